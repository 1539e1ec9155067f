//! The metadata-object contract.
use super::desc::{ChangeDesc, LockType};

use serde::{Deserialize, Serialize};

/// The unique identity of a metadata object (a page or an inode).
pub type ObjectKey = u64;

/// An inode number.
pub type InodeNo = u32;

/// A physical extent: `len` blocks starting at block `addr`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub addr: u64,
    pub len: u32,
}

impl Extent {
    pub const fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }

    /// Returns whether the extent covers no blocks.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// What kind of object a `MetaObject` is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A metadata page (B+tree node, directory index page, map page).
    Page,
    /// An in-memory inode. An inode may carry an inline extent-tree root
    /// that is locked separately from the rest of the inode.
    Inode,
}

/// A metadata object whose updates are made atomic by the transaction manager.
///
/// The object's lifetime is independent of its locks; the manager only
/// records which transaction currently owns the object's lock.
///
/// The callbacks are invoked while the manager holds its table lock, so
/// implementations must not call back into the manager.
pub trait MetaObject: Send + Sync {
    /// Returns the identity of the object.
    fn key(&self) -> ObjectKey;

    /// Returns the kind of the object.
    fn kind(&self) -> ObjectKind {
        ObjectKind::Page
    }

    /// Returns the inode this object belongs to.
    fn inode(&self) -> InodeNo;

    /// Returns the on-disk location of the object.
    fn extent(&self) -> Extent;

    /// Marks the object as modified by an uncommitted transaction, so that it
    /// is not written back home before the transaction is durable.
    fn pin_for_write(&self);

    /// Undoes `pin_for_write` once the lock on the object is released.
    fn unpin(&self);

    /// Returns the initial change descriptor for a new lock of `ltype`.
    ///
    /// Objects override this to seed descriptors from their current content,
    /// e.g. the next free entry index of an extent-tree page.
    fn describe_change(&self, ltype: LockType) -> ChangeDesc {
        ChangeDesc::new(ltype)
    }

    /// Copies `buf.len()` bytes of the object starting at byte `offset`.
    fn read_bytes(&self, offset: usize, buf: &mut [u8]);

    /// Throws away the uncommitted in-memory change. Called on abort.
    fn discard_changes(&self) {}

    /// Releases resources held by the caller before it sleeps waiting for
    /// another transaction to release this object.
    fn release_for_wait(&self) {}

    /// Re-acquires the object after a wait; returns `false` if the object was
    /// invalidated in the meantime.
    fn revalidate(&self) -> bool {
        true
    }
}
