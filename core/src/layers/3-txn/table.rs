//! The transaction table, the lock table and the anonymous-lock registry.
//!
//! Everything here is plain state mutated under the manager's table lock;
//! nothing in this module blocks.
use crate::layers::arena::{SlotId, SlotTable};
use crate::layers::lock::{ChangeDesc, InodeNo, LockType, MetaObject, ObjectKey, ObjectKind};
use crate::layers::log::{LogTid, Lsn};
use crate::os::HashMap;
use crate::prelude::*;
use bitflags::bitflags;

use std::collections::VecDeque;

/// The id of a transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(pub(super) SlotId);

impl TxId {
    /// The owner of anonymous locks, which no transaction holds yet.
    pub const ANONYMOUS: TxId = TxId(SlotId::NULL);

    pub fn is_anonymous(&self) -> bool {
        self.0.is_null()
    }
}

impl Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_anonymous() {
            write!(f, "tx(anon)")
        } else {
            write!(f, "tx{:?}", self.0)
        }
    }
}

/// The id of a lock.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(pub(super) SlotId);

impl Debug for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock{:?}", self.0)
    }
}

bitflags! {
    /// State bits of a transaction block.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TxFlags: u8 {
        /// Started with `force`: exempt from admission barriers.
        const FORCED = 0x01;
        /// Committed lazily; the lazy-commit worker releases it.
        const LAZY = 0x02;
        /// Commit has started; the lock list is frozen.
        const COMMITTING = 0x04;
        /// `end` was called while the lazy commit was in flight.
        const UNLOCKED = 0x08;
        /// Waiting on a (possibly shared) log force.
        const GROUP_COMMIT = 0x10;
        /// Its log force completed.
        const READY = 0x20;
    }
}

/// A transaction block.
pub(super) struct TxBlock {
    pub flags: TxFlags,
    pub logtid: LogTid,
    pub commit_lsn: Lsn,
    /// Locks in log order.
    pub locks: Vec<LockId>,
}

/// Which lock of an object a request refers to.
///
/// An inode carries up to three independent locks: one on the inode
/// itself, one on its inline extent-tree root and one on its inline
/// directory root or data. A page carries a single lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(super) enum LockSlot {
    Primary,
    InodeMeta,
    InlineXtree,
}

/// The key of the lock index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(super) struct LockKey {
    pub object: ObjectKey,
    pub slot: LockSlot,
}

impl LockKey {
    pub fn of(object: &dyn MetaObject, ltype: LockType) -> Self {
        let slot = match (object.kind(), ltype) {
            (ObjectKind::Inode, LockType::Inode) => LockSlot::InodeMeta,
            (ObjectKind::Inode, LockType::ExtentTree) => LockSlot::InlineXtree,
            _ => LockSlot::Primary,
        };
        Self {
            object: object.key(),
            slot,
        }
    }
}

/// A lock record.
pub(super) struct TxLock {
    pub owner: TxId,
    pub object: Arc<dyn MetaObject>,
    pub key: LockKey,
    pub inode: InodeNo,
    pub desc: ChangeDesc,
}

impl TxLock {
    pub fn lock_type(&self) -> LockType {
        self.desc.lock_type()
    }
}

/// Inodes with anonymous locks, oldest first.
#[derive(Default)]
pub(super) struct AnonRegistry {
    order: VecDeque<InodeNo>,
    locks: HashMap<InodeNo, Vec<LockId>>,
}

impl AnonRegistry {
    pub fn push(&mut self, inode: InodeNo, lid: LockId) {
        let locks = self.locks.entry(inode).or_insert_with(|| {
            self.order.push_back(inode);
            Vec::new()
        });
        locks.push(lid);
    }

    /// Removes one lock, dropping the inode once it has none left.
    pub fn remove(&mut self, inode: InodeNo, lid: LockId) {
        let Some(locks) = self.locks.get_mut(&inode) else {
            panic!("anonymous {:?} of inode {} is not registered", lid, inode);
        };
        let Some(pos) = locks.iter().position(|l| *l == lid) else {
            panic!("anonymous {:?} of inode {} is not registered", lid, inode);
        };
        locks.remove(pos);
        if locks.is_empty() {
            self.forget(inode);
        }
    }

    /// Takes every anonymous lock of an inode, in the order they were taken.
    pub fn take(&mut self, inode: InodeNo) -> Vec<LockId> {
        let locks = self.locks.remove(&inode).unwrap_or_default();
        self.order.retain(|i| *i != inode);
        locks
    }

    pub fn oldest(&self) -> Option<InodeNo> {
        self.order.front().copied()
    }

    pub fn inodes(&self) -> impl Iterator<Item = InodeNo> + '_ {
        self.order.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn forget(&mut self, inode: InodeNo) {
        self.locks.remove(&inode);
        self.order.retain(|i| *i != inode);
    }
}

/// Everything guarded by the table lock.
pub(super) struct TxnState {
    pub txs: SlotTable<TxBlock>,
    pub locks: SlotTable<TxLock>,
    pub index: HashMap<LockKey, LockId>,
    pub anon: AnonRegistry,
    /// Set once the lock table crosses the very-high watermark, cleared
    /// when it drops below the low one.
    pub tlocks_low: bool,
    /// Set when the flush agent has work.
    pub agent_wanted: bool,
    pub quiesce: bool,
    /// Transactions begun and not yet returned to the free pool.
    pub log_active: usize,
    pub next_logtid: LogTid,
    pub shutdown: bool,
}

impl TxnState {
    /// Allocates both tables; fails as a whole if either allocation fails.
    pub fn new(ntxblock: usize, ntxlock: usize) -> Result<Self> {
        let txs = SlotTable::with_capacity("tblock", ntxblock)?;
        let locks = SlotTable::with_capacity("tlock", ntxlock)?;
        Ok(Self {
            txs,
            locks,
            index: HashMap::new(),
            anon: AnonRegistry::default(),
            tlocks_low: false,
            agent_wanted: false,
            quiesce: false,
            log_active: 0,
            next_logtid: 1,
            shutdown: false,
        })
    }

    pub fn tx(&self, tid: TxId) -> &TxBlock {
        match self.txs.get(tid.0) {
            Some(tx) if !tid.is_anonymous() => tx,
            _ => panic!("{:?} is not an active transaction", tid),
        }
    }

    pub fn tx_mut(&mut self, tid: TxId) -> &mut TxBlock {
        match self.txs.get_mut(tid.0) {
            Some(tx) if !tid.is_anonymous() => tx,
            _ => panic!("{:?} is not an active transaction", tid),
        }
    }

    pub fn lock(&self, lid: LockId) -> &TxLock {
        self.locks
            .get(lid.0)
            .unwrap_or_else(|| panic!("{:?} is not a live lock", lid))
    }

    pub fn lock_mut(&mut self, lid: LockId) -> &mut TxLock {
        self.locks
            .get_mut(lid.0)
            .unwrap_or_else(|| panic!("{:?} is not a live lock", lid))
    }

    pub fn stamp_logtid(&mut self) -> LogTid {
        let logtid = self.next_logtid;
        self.next_logtid = self.next_logtid.checked_add(1).unwrap_or(1);
        logtid
    }

    /// Moves an anonymous lock to the end of `tid`'s lock list.
    pub fn adopt(&mut self, tid: TxId, lid: LockId) {
        let lock = self.lock_mut(lid);
        debug_assert!(lock.owner.is_anonymous());
        lock.owner = tid;
        let inode = lock.inode;
        self.anon.remove(inode, lid);
        self.tx_mut(tid).locks.push(lid);
    }

    /// Moves every anonymous lock of `inodes` to the front of `tid`'s lock
    /// list, keeping their relative order.
    pub fn adopt_inodes(&mut self, tid: TxId, inodes: &[InodeNo]) -> usize {
        let mut adopted = Vec::new();
        for inode in inodes {
            adopted.extend(self.anon.take(*inode));
        }
        for lid in adopted.iter() {
            self.lock_mut(*lid).owner = tid;
        }
        let count = adopted.len();
        let tx = self.tx_mut(tid);
        adopted.append(&mut tx.locks);
        tx.locks = adopted;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lid(index: u32) -> LockId {
        let mut table = SlotTable::with_capacity("test", index as usize).unwrap();
        let mut id = SlotId::NULL;
        for _ in 0..index {
            id = table.alloc(()).unwrap();
        }
        LockId(id)
    }

    #[test]
    fn anon_registry_order() {
        let mut anon = AnonRegistry::default();
        anon.push(7, lid(1));
        anon.push(3, lid(2));
        anon.push(7, lid(3));
        assert_eq!(anon.inodes().collect::<Vec<_>>(), vec![7, 3]);
        assert_eq!(anon.oldest(), Some(7));

        anon.remove(3, lid(2));
        assert_eq!(anon.inodes().collect::<Vec<_>>(), vec![7]);

        assert_eq!(anon.take(7), vec![lid(1), lid(3)]);
        assert!(anon.is_empty());
        assert!(anon.take(7).is_empty());
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn removing_unknown_anon_lock_is_fatal() {
        let mut anon = AnonRegistry::default();
        anon.remove(1, lid(1));
    }

    #[test]
    fn logtid_skips_zero() {
        let mut state = TxnState::new(16, 256).unwrap();
        state.next_logtid = LogTid::MAX;
        assert_eq!(state.stamp_logtid(), LogTid::MAX);
        assert_eq!(state.stamp_logtid(), 1);
    }
}
