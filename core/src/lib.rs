//! A journaled transaction manager.
//!
//! Multi-object metadata updates are made atomic and crash-recoverable
//! through write-ahead logging, fine-grained object locks, group commit and
//! lazy commit. The crate is organized in layers, each building on the ones
//! below it:
//!
//! - `arena`: generation-checked slot tables backing the lock and
//!   transaction tables.
//! - `lock`: the metadata-object contract and the change descriptors.
//! - `log`: log records, the log-device contract and an in-memory log.
//! - `txn`: the transaction manager.
#![allow(dead_code, unused_imports)]

#[cfg(not(feature = "std"))]
compile_error!("the `std` feature is required");

mod error;
mod layers;
mod os;
mod prelude;
mod util;

pub use self::error::{Errno, Error};
pub use self::layers::arena::{SlotId, SlotTable};
pub use self::layers::lock::{
    ChangeDesc, DirFlags, DirLock, Extent, InodeLock, InodeNo, Line, LineLock, LockType,
    MapList, MapLock, MapOp, MapUpdate, MetaObject, ObjectKey, ObjectKind, XtFlags, XtLock,
};
pub use self::layers::log::{
    scan_log, Completion, ForceCallback, LogDevice, LogRecord, LogTid, Lsn, MapFlags, MemLog,
    MemLogConfig, MemLogStats, PageFlags, Payload, RecordBody, RedoLines, ScanResult,
};
pub use self::layers::txn::{
    AllocMap, CommitOptions, LockId, Transaction, TxConfig, TxFlags, TxId, TxStatsSnapshot,
    TxnManager, Watermarks,
};
