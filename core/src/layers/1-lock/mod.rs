//! The layer of lock descriptors.
//!
//! A lock record (tlock) remembers *what* a transaction changed in one
//! metadata object, so that the change can later be turned into log records.
//! This module defines the contract a metadata object has to fulfil
//! (`MetaObject`) and the per-type change descriptors (`ChangeDesc`).
//!
//! # Usage Example
//!
//! ```ignore
//! let mut desc = page.describe_change(LockType::ExtentTree);
//! let xt = desc.as_xtree_mut().unwrap();
//! xt.touch(5);
//! xt.touch(7);
//! assert_eq!(xt.modified_range(), Some(5..=7));
//! ```
mod desc;
mod line_lock;
mod object;

pub use self::desc::{
    ChangeDesc, DirFlags, DirLock, InodeLock, LockType, MapList, MapLock, MapOp, MapUpdate,
    XtFlags, XtLock, DATA_LINES, DIR_LINES, INODE_LINES, XT_ENTRY_SHIFT,
};
pub use self::line_lock::{Line, LineLock};
pub use self::object::{Extent, InodeNo, MetaObject, ObjectKey, ObjectKind};
