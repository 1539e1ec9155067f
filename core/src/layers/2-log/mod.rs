//! The layer of the write-ahead log.
//!
//! The transaction manager turns every committed transaction into a
//! sequence of `LogRecord`s ending with a commit record, hands them to a
//! `LogDevice` and forces them durable before any lock of the transaction
//! is released.
//!
//! This layer provides the record format, the device contract, an
//! in-memory device with group commit (`MemLog`) and the scanner recovery
//! uses to tell committed transactions from torn ones (`scan_log`).
mod device;
mod mem_log;
mod record;
mod scan;

pub use self::device::{Completion, ForceCallback, LogDevice};
pub use self::mem_log::{MemLog, MemLogConfig, MemLogStats};
pub use self::record::{
    tag, LogRecord, LogTid, Lsn, MapFlags, PageFlags, Payload, RecordBody, RedoLines,
    MAX_MAP_EXTENTS, MAX_REDO_LINES, RECORD_HEADER_LEN,
};
pub use self::scan::{scan_log, ScanResult};
