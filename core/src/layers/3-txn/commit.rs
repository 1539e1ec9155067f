//! The commit protocol and the lazy-commit worker.
//!
//! A commit moves through `PENDING -> LOGGING -> FORCING -> RELEASING ->
//! DONE`:
//!
//! - LOGGING formats the locks of the transaction in list order, then the
//!   held-back map updates, then a commit record.
//! - FORCING asks the log to make the commit record durable. A synchronous
//!   commit blocks here; a lazy one queues the transaction for the
//!   lazy-commit worker and returns.
//! - RELEASING applies the map updates, unpins and frees every lock and wakes
//!   the threads waiting for them.
//! - DONE is the caller's `end`, which returns the transaction block.
//!
//! Formatting is self-contained per record and a transaction counts as
//! committed only once its commit record is durable. So if formatting or
//! the force fails, the commit record never becomes durable and the
//! transaction is aborted instead: objects discard their changes, locks are
//! released and no map update is applied.
use super::format::{FormatLog, Formatted, LogWriter};
use super::manager::TxnInner;
use super::table::{TxFlags, TxId};
use crate::layers::lock::{ChangeDesc, InodeNo, MapUpdate, MetaObject};
use crate::layers::log::{LogDevice, LogTid};
use crate::os::{Condvar, CvarMutex};
use crate::prelude::*;

use std::collections::VecDeque;

/// The allocation maps, updated once the transaction describing an update
/// is durable.
pub trait AllocMap: Send + Sync {
    fn update_map(&self, logtid: LogTid, update: &MapUpdate);
}

/// Options of a commit.
#[derive(Clone, Debug, Default)]
pub struct CommitOptions {
    /// Return once the records are written, leaving the force and the
    /// release to the lazy-commit worker.
    pub lazy: bool,
    /// Inodes whose anonymous locks are adopted at commit time. They are
    /// logged before the transaction's own locks.
    pub inodes: Vec<InodeNo>,
}

impl TxnInner {
    pub(super) fn commit_with(&self, tid: TxId, opts: &CommitOptions) -> Result<()> {
        let (logtid, work) = {
            let mut state = self.state.lock();
            let tx = state.tx_mut(tid);
            assert!(
                !tx.flags.contains(TxFlags::COMMITTING),
                "{:?} committed twice",
                tid
            );
            tx.flags.insert(TxFlags::COMMITTING);

            let adopted = state.adopt_inodes(tid, &opts.inodes);
            self.stats.add_adoptions(adopted as u64);

            let tx = state.tx(tid);
            let work: Vec<(Arc<dyn MetaObject>, ChangeDesc)> = tx
                .locks
                .iter()
                .map(|lid| {
                    let lock = state.lock(*lid);
                    (lock.object.clone(), lock.desc.clone())
                })
                .collect();
            (tx.logtid, work)
        };

        if work.is_empty() {
            trace!("[TxnManager] {:?} committed with nothing to log", tid);
            self.stats.commits();
            return Ok(());
        }

        // LOGGING
        let formatted = match self.format_records(logtid, &work) {
            Ok(formatted) => formatted,
            Err(e) => {
                error!("[TxnManager] formatting {:?} failed: {}", tid, e);
                self.abort_commit(tid);
                return_errno_with_msg!(TxAborted, "log formatting failed");
            }
        };
        self.stats.add_records(formatted.nrecords as u64);
        {
            let mut state = self.state.lock();
            let tx = state.tx_mut(tid);
            tx.commit_lsn = formatted.commit_lsn;
            tx.flags.insert(TxFlags::GROUP_COMMIT);
            if opts.lazy {
                tx.flags.insert(TxFlags::LAZY);
            }
        }

        // FORCING
        if opts.lazy {
            self.lazy.enqueue(tid, formatted.map_updates);
            let lazy = self.lazy.clone();
            self.log.force(
                formatted.commit_lsn,
                Box::new(move |res| lazy.mark_ready(tid, res)),
            );
            self.stats.lazy_commits();
            debug!(
                "[TxnManager] {:?} committed lazily at lsn {}",
                tid, formatted.commit_lsn
            );
            return Ok(());
        }

        if let Err(e) = self.log.force_sync(formatted.commit_lsn) {
            error!("[TxnManager] forcing {:?} failed: {}", tid, e);
            self.abort_commit(tid);
            return Err(e);
        }

        // RELEASING
        self.release_committed(tid, logtid, &formatted.map_updates);
        self.stats.commits();
        debug!(
            "[TxnManager] {:?} committed at lsn {}",
            tid, formatted.commit_lsn
        );
        Ok(())
    }

    fn format_records(
        &self,
        logtid: LogTid,
        work: &[(Arc<dyn MetaObject>, ChangeDesc)],
    ) -> Result<Formatted> {
        let mut writer = LogWriter::new(self.log.as_ref(), logtid, self.config.inline_payload_max);
        for (object, desc) in work {
            desc.format(object.as_ref(), &mut writer)?;
        }
        writer.finish()
    }

    fn release_committed(&self, tid: TxId, logtid: LogTid, map_updates: &[MapUpdate]) {
        self.apply_map_updates(logtid, map_updates);
        let mut state = self.state.lock();
        state.tx_mut(tid).flags.insert(TxFlags::READY);
        self.release_locks(&mut state, tid, false);
    }

    fn abort_commit(&self, tid: TxId) {
        let mut state = self.state.lock();
        let count = self.release_locks(&mut state, tid, true);
        self.stats.aborts();
        warn!("[TxnManager] {:?} aborted, {} changes discarded", tid, count);
    }

    fn apply_map_updates(&self, logtid: LogTid, map_updates: &[MapUpdate]) {
        let Some(alloc_map) = self.alloc_map.as_ref() else {
            return;
        };
        for update in map_updates {
            alloc_map.update_map(logtid, update);
        }
    }

    pub(super) fn lazy_commit_looped(&self) {
        info!("[LazyCommit] started");
        while let Some(batch) = self.lazy.take_ready() {
            let count = batch.len();
            for entry in batch {
                self.finish_lazy(entry);
            }
            self.lazy.done(count);
        }
        info!("[LazyCommit] stopped");
    }

    fn finish_lazy(&self, entry: LazyEntry) {
        let LazyEntry {
            tid,
            map_updates,
            result,
        } = entry;
        let logtid = self.state.lock().tx(tid).logtid;

        let durable = match result {
            Some(Ok(())) => {
                self.apply_map_updates(logtid, &map_updates);
                true
            }
            Some(Err(e)) => {
                error!("[LazyCommit] forcing {:?} failed: {}", tid, e);
                false
            }
            None => unreachable!("only ready entries are taken"),
        };

        let mut state = self.state.lock();
        if durable {
            state.tx_mut(tid).flags.insert(TxFlags::READY);
            self.stats.commits();
        } else {
            self.stats.aborts();
        }
        self.release_locks(&mut state, tid, !durable);

        let tx = state.tx_mut(tid);
        if tx.flags.contains(TxFlags::UNLOCKED) {
            self.free_tblock(&mut state, tid);
            trace!("[LazyCommit] {:?} finished and freed", tid);
        } else {
            // The owner has not ended it yet; its `end` frees it.
            tx.flags.remove(TxFlags::LAZY);
            trace!("[LazyCommit] {:?} finished", tid);
        }
    }
}

/// A lazily committed transaction waiting for its log force.
pub(super) struct LazyEntry {
    tid: TxId,
    map_updates: Vec<MapUpdate>,
    // Set by the force callback.
    result: Option<Result<()>>,
}

/// The queue between lazy commits and the lazy-commit worker.
///
/// Guarded by its own lock so that force callbacks and the worker never
/// contend with admission on the table lock.
pub(super) struct LazyQueue {
    state: CvarMutex<LazyState>,
    cond: Condvar,
}

struct LazyState {
    entries: VecDeque<LazyEntry>,
    in_flight: usize,
    shutdown: bool,
}

impl LazyQueue {
    pub fn new() -> Self {
        Self {
            state: CvarMutex::new(LazyState {
                entries: VecDeque::new(),
                in_flight: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn enqueue(&self, tid: TxId, map_updates: Vec<MapUpdate>) {
        let mut state = self.state.lock();
        state.entries.push_back(LazyEntry {
            tid,
            map_updates,
            result: None,
        });
        state.in_flight += 1;
    }

    /// Records the outcome of the log force of `tid`.
    pub fn mark_ready(&self, tid: TxId, res: Result<()>) {
        let mut state = self.state.lock();
        match state
            .entries
            .iter_mut()
            .find(|entry| entry.tid == tid && entry.result.is_none())
        {
            Some(entry) => entry.result = Some(res),
            None => warn!("[LazyCommit] force completion for unknown {:?}", tid),
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Blocks until some entries are ready and takes them, oldest first.
    /// Returns `None` once shut down with nothing left in flight.
    fn take_ready(&self) -> Option<Vec<LazyEntry>> {
        let mut state = self.state.lock();
        loop {
            if state.entries.iter().any(|entry| entry.result.is_some()) {
                let (ready, pending): (Vec<_>, Vec<_>) = core::mem::take(&mut state.entries)
                    .into_iter()
                    .partition(|entry| entry.result.is_some());
                state.entries = pending.into();
                return Some(ready);
            }
            if state.shutdown && state.entries.is_empty() {
                return None;
            }
            state = self.cond.wait(state);
        }
    }

    fn done(&self, count: usize) {
        let mut state = self.state.lock();
        state.in_flight -= count;
        drop(state);
        self.cond.notify_all();
    }

    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.in_flight > 0 {
            state = self.cond.wait(state);
        }
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }
}
