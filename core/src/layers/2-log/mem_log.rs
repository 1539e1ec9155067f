//! An in-memory log device with group commit.
use super::device::{ForceCallback, LogDevice};
use super::record::{LogRecord, Lsn, RecordBody};
use crate::os::{spawn, Condvar, CvarMutex, JoinHandle};
use crate::prelude::*;

use core::time::Duration;
use serde::{Deserialize, Serialize};

/// Configuration of a `MemLog`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemLogConfig {
    /// Raise the sync barrier once this many bytes were written since the
    /// last sync point. `None` never raises it.
    pub sync_barrier_bytes: Option<u64>,
    /// How long the flusher waits after the first force request for more
    /// requests to join the same I/O.
    pub group_commit_window: Duration,
}

/// A log kept in memory.
///
/// Records are appended to a byte stream; the LSN of a record is the stream
/// length right after it. A background flusher serves force requests: each
/// flush makes the whole stream written so far durable and completes every
/// pending request it covers, so concurrent commits share one I/O.
///
/// A failed flush marks the log as failed. Nothing written afterwards ever
/// becomes durable, so a commit record that missed its flush cannot reach
/// the durable image through a later one.
pub struct MemLog {
    inner: Arc<LogInner>,
    flusher: Option<JoinHandle<()>>,
}

struct LogInner {
    state: CvarMutex<LogState>,
    // Wakes the flusher.
    work_cond: Condvar,
    config: MemLogConfig,
}

struct LogState {
    stream: Vec<u8>,
    durable: Lsn,
    pending: Vec<(Lsn, ForceCallback)>,
    since_sync_point: u64,
    barrier: bool,
    failed: bool,
    shutdown: bool,
    stats: MemLogStats,
    // Fault injection.
    fail_write_after: Option<u64>,
    fail_next_flush: bool,
}

/// Counters of a `MemLog`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemLogStats {
    pub records: u64,
    pub force_requests: u64,
    pub flushes: u64,
    pub sync_points: u64,
}

impl MemLog {
    pub fn new(config: MemLogConfig) -> Self {
        let inner = Arc::new(LogInner {
            state: CvarMutex::new(LogState {
                stream: Vec::new(),
                durable: 0,
                pending: Vec::new(),
                since_sync_point: 0,
                barrier: false,
                failed: false,
                shutdown: false,
                stats: MemLogStats::default(),
                fail_write_after: None,
                fail_next_flush: false,
            }),
            work_cond: Condvar::new(),
            config,
        });

        let flusher = {
            let inner = inner.clone();
            spawn(move || inner.flush_looped())
        };
        debug!("[MemLog] started");

        Self {
            inner,
            flusher: Some(flusher),
        }
    }

    /// Returns a copy of the durable prefix of the log.
    pub fn durable_image(&self) -> Vec<u8> {
        let state = self.inner.state.lock();
        state.stream[..state.durable as usize].to_vec()
    }

    /// Returns a copy of everything written, durable or not.
    pub fn written_image(&self) -> Vec<u8> {
        self.inner.state.lock().stream.clone()
    }

    /// Returns the LSN up to which the log is durable.
    pub fn durable_lsn(&self) -> Lsn {
        self.inner.state.lock().durable
    }

    /// Returns the LSN of the end of the log.
    pub fn end_lsn(&self) -> Lsn {
        self.inner.state.lock().stream.len() as Lsn
    }

    pub fn stats(&self) -> MemLogStats {
        self.inner.state.lock().stats
    }

    /// Returns whether a flush failed.
    pub fn has_failed(&self) -> bool {
        self.inner.state.lock().failed
    }

    /// Raises the sync barrier by hand.
    pub fn raise_sync_barrier(&self) {
        self.inner.state.lock().barrier = true;
    }

    /// Makes the write after the next `n` successful ones fail.
    pub fn fail_write_after(&self, n: u64) {
        self.inner.state.lock().fail_write_after = Some(n);
    }

    /// Makes the next flush fail, which fails the log.
    pub fn fail_next_flush(&self) {
        self.inner.state.lock().fail_next_flush = true;
    }
}

impl LogDevice for MemLog {
    fn reserve_and_write(&self, record: &LogRecord) -> Result<Lsn> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return_errno_with_msg!(Shutdown, "log is shut down");
        }
        if state.failed {
            return_errno_with_msg!(IoFailed, "log has failed");
        }
        if let Some(remaining) = state.fail_write_after.as_mut() {
            if *remaining == 0 {
                state.fail_write_after = None;
                return_errno_with_msg!(IoFailed, "injected log write failure");
            }
            *remaining -= 1;
        }

        let len = record.encoded_len() as u64;
        record.encode_into(&mut state.stream);
        let lsn = state.stream.len() as Lsn;
        state.stats.records += 1;
        state.since_sync_point += len;

        if let Some(limit) = self.inner.config.sync_barrier_bytes {
            if !state.barrier && state.since_sync_point >= limit {
                debug!("[MemLog] sync barrier raised at lsn {}", lsn);
                state.barrier = true;
            }
        }
        trace!(
            "[MemLog] wrote {:?} of logtid {} at lsn {}",
            record.body.tag(),
            record.logtid,
            lsn
        );
        Ok(lsn)
    }

    fn force(&self, upto: Lsn, on_complete: ForceCallback) {
        let mut state = self.inner.state.lock();
        state.stats.force_requests += 1;

        let res = if upto <= state.durable {
            Ok(())
        } else if upto > state.stream.len() as Lsn {
            Err(Error::with_msg(InvalidArgs, "force beyond the end of the log"))
        } else if state.failed {
            Err(Error::with_msg(IoFailed, "log has failed"))
        } else {
            state.pending.push((upto, on_complete));
            drop(state);
            self.inner.work_cond.notify_all();
            return;
        };
        drop(state);
        on_complete(res);
    }

    fn sync_barrier(&self) -> bool {
        self.inner.state.lock().barrier
    }

    fn checkpoint(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.failed {
            return_errno_with_msg!(IoFailed, "log has failed");
        }

        let sync_lsn = state.stream.len() as Lsn;
        let record = LogRecord::new(0, 0, RecordBody::SyncPoint { lsn: sync_lsn });
        record.encode_into(&mut state.stream);
        state.stats.records += 1;
        state.stats.sync_points += 1;
        state.since_sync_point = 0;
        state.barrier = false;
        debug!("[MemLog] sync point at lsn {}", sync_lsn);
        Ok(())
    }
}

impl LogInner {
    fn flush_looped(&self) {
        loop {
            let mut state = self.state.lock();
            while state.pending.is_empty() && !state.shutdown {
                state = self.work_cond.wait(state);
            }
            if state.pending.is_empty() && state.shutdown {
                break;
            }

            let window = self.config.group_commit_window;
            if !window.is_zero() && !state.shutdown {
                drop(state);
                std::thread::sleep(window);
                state = self.state.lock();
            }

            let requests = core::mem::take(&mut state.pending);
            let res = if state.failed {
                Err(Error::with_msg(IoFailed, "log has failed"))
            } else if state.fail_next_flush {
                state.fail_next_flush = false;
                state.failed = true;
                error!("[MemLog] flush failed, log is now failed");
                Err(Error::with_msg(IoFailed, "injected log flush failure"))
            } else {
                state.durable = state.stream.len() as Lsn;
                state.stats.flushes += 1;
                trace!(
                    "[MemLog] flushed up to lsn {} for {} requests",
                    state.durable,
                    requests.len()
                );
                Ok(())
            };
            drop(state);

            for (_upto, on_complete) in requests {
                on_complete(res.clone());
            }
        }
        debug!("[MemLog] flusher stopped");
    }
}

impl Drop for MemLog {
    fn drop(&mut self) {
        self.inner.state.lock().shutdown = true;
        self.inner.work_cond.notify_all();
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.join();
        }
    }
}

impl Debug for MemLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemLog")
            .field("end", &state.stream.len())
            .field("durable", &state.durable)
            .field("barrier", &state.barrier)
            .field("failed", &state.failed)
            .finish()
    }
}
