//! Scanning a durable log image, as recovery does.
use super::record::{LogRecord, LogTid, Lsn, RecordBody};
use crate::os::{HashMap, HashSet};
use crate::prelude::*;

/// The outcome of scanning a log image.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Every valid record with its LSN, in log order.
    pub records: Vec<(Lsn, LogRecord)>,
    /// Log transaction ids that have a commit record.
    pub committed: HashSet<LogTid>,
    /// The LSN of the last sync point, if any.
    pub last_sync_point: Option<Lsn>,
    /// The end of the valid prefix of the image.
    pub end: Lsn,
    /// Whether trailing bytes were dropped as a torn or corrupted tail.
    pub torn: bool,
}

impl ScanResult {
    pub fn is_committed(&self, logtid: LogTid) -> bool {
        self.committed.contains(&logtid)
    }

    /// Returns the records of one transaction, in log order.
    pub fn records_of(&self, logtid: LogTid) -> impl Iterator<Item = &LogRecord> + '_ {
        self.records
            .iter()
            .map(|(_, record)| record)
            .filter(move |record| record.logtid == logtid && is_tx_record(record))
    }

    /// Returns the records recovery replays: those of committed
    /// transactions, excluding the commit records themselves.
    pub fn redo_records(&self) -> impl Iterator<Item = &LogRecord> + '_ {
        self.records.iter().map(|(_, record)| record).filter(|record| {
            is_tx_record(record)
                && !matches!(record.body, RecordBody::Commit)
                && self.is_committed(record.logtid)
        })
    }
}

fn is_tx_record(record: &LogRecord) -> bool {
    !matches!(record.body, RecordBody::SyncPoint { .. })
}

/// Decodes records from the start of `image` until its end or the first
/// record that is torn, malformed or breaks its transaction's backchain.
pub fn scan_log(image: &[u8]) -> ScanResult {
    let mut result = ScanResult::default();
    // The LSN of the latest record of each transaction.
    let mut chain_heads: HashMap<LogTid, Lsn> = HashMap::new();
    let mut pos = 0usize;

    while pos < image.len() {
        let (record, len) = match LogRecord::decode(&image[pos..]) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("[MemLog] scan stopped at {}: {}", pos, e);
                result.torn = true;
                break;
            }
        };
        let lsn = (pos + len) as Lsn;

        if is_tx_record(&record) {
            let expected = chain_heads.get(&record.logtid).copied().unwrap_or(0);
            if record.backchain != expected {
                warn!(
                    "[MemLog] broken backchain of logtid {} at lsn {}: {} != {}",
                    record.logtid, lsn, record.backchain, expected
                );
                result.torn = true;
                break;
            }
            chain_heads.insert(record.logtid, lsn);
            if matches!(record.body, RecordBody::Commit) {
                result.committed.insert(record.logtid);
                // A log transaction id can be reused after it committed.
                chain_heads.remove(&record.logtid);
            }
        } else if let RecordBody::SyncPoint { .. } = record.body {
            result.last_sync_point = Some(lsn);
        }

        result.records.push((lsn, record));
        pos += len;
    }

    result.end = pos as Lsn;
    result
}
