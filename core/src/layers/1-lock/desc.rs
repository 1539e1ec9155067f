//! Change descriptors, one per lock type.
use super::line_lock::LineLock;
use super::object::{Extent, InodeNo};
use crate::prelude::*;
use bitflags::bitflags;

use core::ops::RangeInclusive;
use serde::{Deserialize, Serialize};

/// Number of line entries of an inode lock.
pub const INODE_LINES: usize = 4;
/// Number of line entries of a directory lock (its inline log).
pub const DIR_LINES: usize = 20;
/// Number of line entries of a data lock.
pub const DATA_LINES: usize = 8;

/// Inode and data locks record byte ranges.
const BYTE_LINE_SHIFT: u8 = 0;
/// Directory slots are 32 bytes.
const DIR_SLOT_SHIFT: u8 = 5;
/// Extent-tree entries are 16 bytes.
pub const XT_ENTRY_SHIFT: u8 = 4;

/// The kind of a lock, which selects its change descriptor and log formatter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    /// Inode metadata.
    Inode,
    /// Directory entries of a directory page or inline directory root.
    Directory,
    /// Entries of an extent-tree page or inline extent-tree root.
    ExtentTree,
    /// Raw data of a metadata page, e.g. a directory index table.
    Data,
    /// Allocation-map updates.
    Map,
}

bitflags! {
    /// Flags of a directory lock.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DirFlags: u8 {
        /// The page is the root of the directory tree (stored in the inode).
        const ROOT = 0x01;
        /// The page was newly allocated.
        const NEW = 0x02;
        /// The page was extended in place.
        const EXTEND = 0x04;
        /// The page is being freed.
        const FREE = 0x08;
    }
}

bitflags! {
    /// Flags of an extent-tree lock, selecting how the lock is logged.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct XtFlags: u8 {
        /// The page was newly allocated.
        const NEW = 0x01;
        /// Entries were appended past the previous end.
        const GROW = 0x02;
        /// Entries from the truncation watermark on were deleted.
        const TRUNCATE = 0x04;
        /// The page moved to a new block.
        const RELOCATE = 0x08;
        /// The page is being freed.
        const FREE = 0x10;
        /// The page is the inline root stored in the inode.
        const ROOT = 0x20;
    }
}

/// The change descriptor of an inode lock.
#[derive(Clone, Debug)]
pub struct InodeLock {
    /// Modified byte ranges of the on-disk inode.
    pub lines: LineLock<INODE_LINES>,
    /// The previous on-disk location, if the inode moved.
    pub before: Option<Extent>,
    /// The new on-disk location; the object's own extent if unset.
    pub after: Option<Extent>,
}

impl InodeLock {
    pub fn new() -> Self {
        Self {
            lines: LineLock::new(BYTE_LINE_SHIFT),
            before: None,
            after: None,
        }
    }

    /// Records a modified byte range of the inode.
    pub fn touch(&mut self, byte_offset: usize, nbytes: usize) {
        self.lines.add_bytes(byte_offset, nbytes);
    }

    /// Records that the inode moved from `before` to `after`.
    pub fn relocate(&mut self, before: Extent, after: Extent) {
        self.before = Some(before);
        self.after = Some(after);
    }
}

/// The change descriptor of a directory lock: a small inline log of the
/// directory slots touched.
#[derive(Clone, Debug)]
pub struct DirLock {
    pub lines: LineLock<DIR_LINES>,
    pub flags: DirFlags,
}

impl DirLock {
    pub fn new() -> Self {
        Self {
            lines: LineLock::new(DIR_SLOT_SHIFT),
            flags: DirFlags::empty(),
        }
    }

    /// Records `count` modified directory slots starting at `slot`.
    pub fn touch_slots(&mut self, slot: u16, count: u16) {
        self.lines.add(slot, count);
    }
}

/// The change descriptor of an extent-tree lock.
///
/// The low and high watermarks (`lwm`, `hwm`) bound the entries written
/// since the lock was taken; the truncation watermark (`twm`) is the first
/// entry deleted by a truncation.
#[derive(Clone, Debug)]
pub struct XtLock {
    lwm: u16,
    hwm: u16,
    twm: u16,
    pub flags: XtFlags,
    /// Extents released by deleted entries.
    pub freed: Vec<Extent>,
    /// Extents allocated for new entries.
    pub allocated: Vec<Extent>,
    /// The block the page occupied before a relocation.
    pub relocated_from: Option<Extent>,
}

impl XtLock {
    pub fn new() -> Self {
        Self {
            lwm: u16::MAX,
            hwm: 0,
            twm: u16::MAX,
            flags: XtFlags::empty(),
            freed: Vec::new(),
            allocated: Vec::new(),
            relocated_from: None,
        }
    }

    /// Records that entry `index` was written.
    pub fn touch(&mut self, index: u16) {
        self.lwm = self.lwm.min(index);
        self.hwm = self.hwm.max(index);
    }

    /// Records that entry `index` was written with a newly allocated extent.
    pub fn allocate(&mut self, index: u16, extent: Extent) {
        self.touch(index);
        self.allocated.push(extent);
    }

    /// Records that the entries from `index` on were deleted, releasing
    /// `freed` extents.
    pub fn truncate(&mut self, index: u16, freed: impl IntoIterator<Item = Extent>) {
        self.twm = self.twm.min(index);
        self.flags.insert(XtFlags::TRUNCATE);
        self.freed.extend(freed);
    }

    /// Records that the page moved away from `from`.
    pub fn relocate(&mut self, from: Extent) {
        self.flags.insert(XtFlags::RELOCATE);
        self.relocated_from = Some(from);
    }

    /// Records that the page itself is freed, along with the extents its
    /// entries still referenced.
    pub fn free_page(&mut self, freed: impl IntoIterator<Item = Extent>) {
        self.flags.insert(XtFlags::FREE);
        self.freed.extend(freed);
    }

    /// Returns the range of written entries, if any.
    pub fn modified_range(&self) -> Option<RangeInclusive<u16>> {
        if self.lwm > self.hwm {
            return None;
        }
        Some(self.lwm..=self.hwm)
    }

    /// Returns the first deleted entry, if the page was truncated.
    pub fn truncated_from(&self) -> Option<u16> {
        if self.flags.contains(XtFlags::TRUNCATE) {
            Some(self.twm)
        } else {
            None
        }
    }
}

/// An allocation-map operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapOp {
    Alloc,
    Free,
}

/// How the extents of a map update were described by their owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapList {
    /// Bare physical extents.
    Pxd,
    /// Extents taken from extent-tree entries.
    Xad,
}

/// The change descriptor of an allocation-map lock.
#[derive(Clone, Debug)]
pub struct MapLock {
    pub op: MapOp,
    pub list: MapList,
    pub extents: Vec<Extent>,
}

impl MapLock {
    pub fn new(op: MapOp, list: MapList) -> Self {
        Self {
            op,
            list,
            extents: Vec::new(),
        }
    }

    pub fn push(&mut self, extent: Extent) {
        self.extents.push(extent);
    }
}

/// An update to the allocation maps, applied once the transaction that
/// describes it is durable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapUpdate {
    pub inode: InodeNo,
    pub op: MapOp,
    pub list: MapList,
    pub extents: Vec<Extent>,
}

/// The change descriptor of a lock, tagged by lock type.
#[derive(Clone, Debug)]
pub enum ChangeDesc {
    Inode(InodeLock),
    Directory(DirLock),
    ExtentTree(XtLock),
    Data(LineLock<DATA_LINES>),
    Map(MapLock),
}

impl ChangeDesc {
    /// Creates an empty descriptor for a lock of `ltype`.
    pub fn new(ltype: LockType) -> Self {
        match ltype {
            LockType::Inode => ChangeDesc::Inode(InodeLock::new()),
            LockType::Directory => ChangeDesc::Directory(DirLock::new()),
            LockType::ExtentTree => ChangeDesc::ExtentTree(XtLock::new()),
            LockType::Data => ChangeDesc::Data(LineLock::new(BYTE_LINE_SHIFT)),
            LockType::Map => ChangeDesc::Map(MapLock::new(MapOp::Alloc, MapList::Pxd)),
        }
    }

    /// Returns the lock type of the descriptor.
    pub fn lock_type(&self) -> LockType {
        match self {
            ChangeDesc::Inode(_) => LockType::Inode,
            ChangeDesc::Directory(_) => LockType::Directory,
            ChangeDesc::ExtentTree(_) => LockType::ExtentTree,
            ChangeDesc::Data(_) => LockType::Data,
            ChangeDesc::Map(_) => LockType::Map,
        }
    }

    pub fn as_inode_mut(&mut self) -> Option<&mut InodeLock> {
        match self {
            ChangeDesc::Inode(lock) => Some(lock),
            _ => None,
        }
    }

    pub fn as_dir_mut(&mut self) -> Option<&mut DirLock> {
        match self {
            ChangeDesc::Directory(lock) => Some(lock),
            _ => None,
        }
    }

    pub fn as_xtree_mut(&mut self) -> Option<&mut XtLock> {
        match self {
            ChangeDesc::ExtentTree(lock) => Some(lock),
            _ => None,
        }
    }

    pub fn as_data_mut(&mut self) -> Option<&mut LineLock<DATA_LINES>> {
        match self {
            ChangeDesc::Data(lock) => Some(lock),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut MapLock> {
        match self {
            ChangeDesc::Map(lock) => Some(lock),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xtree_watermarks() {
        let mut xt = XtLock::new();
        assert_eq!(xt.modified_range(), None);
        xt.touch(9);
        xt.allocate(4, Extent::new(100, 8));
        assert_eq!(xt.modified_range(), Some(4..=9));
        assert_eq!(xt.truncated_from(), None);

        xt.truncate(12, [Extent::new(200, 4)]);
        xt.truncate(10, [Extent::new(300, 2)]);
        assert_eq!(xt.truncated_from(), Some(10));
        assert_eq!(xt.freed.len(), 2);
        assert!(xt.flags.contains(XtFlags::TRUNCATE));
        assert!(!xt.flags.contains(XtFlags::RELOCATE));
    }

    #[test]
    fn descriptor_matches_lock_type() {
        for ltype in [
            LockType::Inode,
            LockType::Directory,
            LockType::ExtentTree,
            LockType::Data,
            LockType::Map,
        ] {
            assert_eq!(ChangeDesc::new(ltype).lock_type(), ltype);
        }
    }
}
