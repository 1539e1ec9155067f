//! Transaction admission, lock acquisition and release.
use super::commit::{AllocMap, CommitOptions, LazyQueue};
use super::config::{TxConfig, Watermarks};
use super::handle::Transaction;
use super::stats::{TxStats, TxStatsSnapshot};
use super::table::{LockId, LockKey, TxBlock, TxFlags, TxId, TxLock, TxnState};
use crate::layers::lock::{ChangeDesc, InodeNo, LockType, MetaObject};
use crate::layers::log::{LogDevice, LogTid};
use crate::os::{spawn, Condvar, CvarMutex, CvarMutexGuard, JoinHandle, Mutex};
use crate::prelude::*;

/// The transaction manager.
///
/// Owns the transaction and lock tables and two background workers: the
/// lazy-commit worker, which finishes lazily committed transactions once
/// their log records are durable, and the flush agent, which commits
/// anonymous locks when the lock table runs low.
pub struct TxnManager {
    inner: Arc<TxnInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Inner structures of `TxnManager`.
pub(super) struct TxnInner {
    pub(super) state: CvarMutex<TxnState>,
    pub(super) free_tx_wait: Condvar,
    pub(super) free_lock_wait: Condvar,
    pub(super) low_lock_wait: Condvar,
    pub(super) sync_wait: Condvar,
    pub(super) agent_wait: Condvar,
    // One wait queue per transaction block, indexed by slot. Kept outside
    // the blocks so that reusing a block never disturbs its waiters.
    tx_waitors: Vec<Condvar>,
    pub(super) log: Arc<dyn LogDevice>,
    pub(super) alloc_map: Option<Arc<dyn AllocMap>>,
    pub(super) config: TxConfig,
    pub(super) watermarks: Watermarks,
    pub(super) stats: TxStats,
    pub(super) lazy: Arc<LazyQueue>,
}

impl TxnManager {
    /// Creates a manager writing to `log`.
    pub fn new(config: TxConfig, log: Arc<dyn LogDevice>) -> Result<Self> {
        Self::build(config, log, None)
    }

    /// Creates a manager that also applies map updates to `alloc_map` once
    /// they are durable.
    pub fn with_alloc_map(
        config: TxConfig,
        log: Arc<dyn LogDevice>,
        alloc_map: Arc<dyn AllocMap>,
    ) -> Result<Self> {
        Self::build(config, log, Some(alloc_map))
    }

    fn build(
        config: TxConfig,
        log: Arc<dyn LogDevice>,
        alloc_map: Option<Arc<dyn AllocMap>>,
    ) -> Result<Self> {
        config.validate()?;
        let state = TxnState::new(config.ntxblock, config.ntxlock)?;
        let tx_waitors = (0..=config.ntxblock).map(|_| Condvar::new()).collect();

        let inner = Arc::new(TxnInner {
            state: CvarMutex::new(state),
            free_tx_wait: Condvar::new(),
            free_lock_wait: Condvar::new(),
            low_lock_wait: Condvar::new(),
            sync_wait: Condvar::new(),
            agent_wait: Condvar::new(),
            tx_waitors,
            log,
            alloc_map,
            watermarks: config.watermarks(),
            config,
            stats: TxStats::default(),
            lazy: Arc::new(LazyQueue::new()),
        });

        let mut workers = Vec::new();
        workers.push({
            let inner = inner.clone();
            spawn(move || inner.lazy_commit_looped())
        });
        if inner.config.flush_agent {
            workers.push({
                let inner = inner.clone();
                spawn(move || inner.flush_agent_looped())
            });
        }

        info!(
            "[TxnManager] started with {} tblocks and {} tlocks (watermarks {:?})",
            inner.config.ntxblock, inner.config.ntxlock, inner.watermarks
        );
        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Starts a transaction, blocking while admission is held back.
    ///
    /// A forced transaction skips the sync barrier and the lock-table
    /// backpressure, and may take the last free transaction block.
    pub fn begin(&self, force: bool) -> Result<TxId> {
        self.inner.begin(force)
    }

    /// Starts a transaction wrapped in a handle that aborts it on drop.
    pub fn transaction(&self, force: bool) -> Result<Transaction<'_>> {
        let tid = self.begin(force)?;
        Ok(Transaction::new(self, tid))
    }

    /// Admits an anonymous writer: blocks under the same barriers as
    /// `begin` without taking a transaction block.
    pub fn begin_anonymous(&self) -> Result<()> {
        self.inner.begin_anonymous()
    }

    /// Locks `object` for `tid`, or for no transaction if `tid` is
    /// `TxId::ANONYMOUS`.
    ///
    /// Returns the existing lock if `tid` already holds it, adopts it if it
    /// is anonymous and waits if another transaction holds it. Fails with
    /// `Stale` if the object was invalidated during the wait.
    pub fn lock(
        &self,
        tid: TxId,
        object: Arc<dyn MetaObject>,
        ltype: LockType,
    ) -> Result<LockId> {
        let (lid, ()) = self.inner.lock_with(tid, object, ltype, |_| ())?;
        Ok(lid)
    }

    /// Locks `object` like `lock` and records a change in its descriptor
    /// before the table lock is dropped.
    ///
    /// Anonymous writers use this so that the flush agent cannot commit the
    /// lock between taking it and describing the change.
    pub fn lock_with<R>(
        &self,
        tid: TxId,
        object: Arc<dyn MetaObject>,
        ltype: LockType,
        f: impl FnOnce(&mut ChangeDesc) -> R,
    ) -> Result<(LockId, R)> {
        self.inner.lock_with(tid, object, ltype, f)
    }

    /// Records a change in the descriptor of a lock.
    ///
    /// Fails with `Stale` if the lock was released, or if the commit of its
    /// owner already started. An anonymous lock may have been adopted and
    /// committed by the flush agent in the meantime; the caller locks the
    /// object again.
    pub fn update<R>(&self, lid: LockId, f: impl FnOnce(&mut ChangeDesc) -> R) -> Result<R> {
        self.inner.update(lid, f)
    }

    /// Commits `tid` with the default commit mode.
    pub fn commit(&self, tid: TxId) -> Result<()> {
        let opts = CommitOptions {
            lazy: self.inner.config.lazy_commit,
            inodes: Vec::new(),
        };
        self.inner.commit_with(tid, &opts)
    }

    /// Commits `tid`.
    ///
    /// On success the transaction's records are durable (or, for a lazy
    /// commit, on their way to the log). On failure none of its changes are
    /// durable, its locks are released and its objects were asked to
    /// discard their changes. Either way the caller still ends `tid`.
    pub fn commit_with(&self, tid: TxId, opts: &CommitOptions) -> Result<()> {
        self.inner.commit_with(tid, opts)
    }

    /// Aborts `tid` before its commit: releases its locks without logging.
    pub fn abort(&self, tid: TxId) {
        self.inner.abort(tid)
    }

    /// Ends `tid`, returning its block to the free pool unless a lazy
    /// commit still has to finish.
    pub fn end(&self, tid: TxId) {
        self.inner.end(tid)
    }

    /// Drops the anonymous locks of an inode that is going away.
    pub fn release_anonymous(&self, inode: InodeNo) {
        self.inner.release_anonymous(inode)
    }

    /// Holds back new non-forced transactions, commits every anonymous
    /// lock and waits until no transaction is active.
    pub fn quiesce(&self) -> Result<()> {
        self.inner.quiesce()
    }

    /// Lets transactions start again after `quiesce`.
    pub fn resume(&self) {
        self.inner.resume()
    }

    /// Blocks until every lazy commit in flight has finished.
    pub fn wait_lazy_idle(&self) {
        self.inner.lazy.wait_idle()
    }

    pub fn stats(&self) -> TxStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> &TxConfig {
        &self.inner.config
    }

    /// Returns the owner of a live lock.
    pub fn lock_owner(&self, lid: LockId) -> Option<TxId> {
        let state = self.inner.state.lock();
        state.locks.get(lid.0).map(|lock| lock.owner)
    }

    /// Returns the type of a live lock.
    pub fn lock_type(&self, lid: LockId) -> Option<LockType> {
        let state = self.inner.state.lock();
        state.locks.get(lid.0).map(|lock| lock.lock_type())
    }

    /// Returns the locks of a transaction, in log order.
    pub fn locks_of(&self, tid: TxId) -> Vec<LockId> {
        let state = self.inner.state.lock();
        state
            .txs
            .get(tid.0)
            .map(|tx| tx.locks.clone())
            .unwrap_or_default()
    }

    /// Returns the log transaction id of an active transaction.
    pub fn logtid(&self, tid: TxId) -> Option<LogTid> {
        let state = self.inner.state.lock();
        state.txs.get(tid.0).map(|tx| tx.logtid)
    }

    /// Returns the inodes holding anonymous locks, oldest first.
    pub fn anonymous_inodes(&self) -> Vec<InodeNo> {
        self.inner.state.lock().anon.inodes().collect()
    }

    pub fn locks_in_use(&self) -> usize {
        self.inner.state.lock().locks.in_use()
    }

    pub fn free_tblocks(&self) -> usize {
        self.inner.state.lock().txs.free_count()
    }

    /// Returns the number of transactions not yet returned to the pool.
    pub fn active_transactions(&self) -> usize {
        self.inner.state.lock().log_active
    }

    /// Stops the workers after the lazy commits in flight have finished.
    ///
    /// Blocked and later calls fail with `Shutdown`.
    pub fn shutdown(&self) {
        let workers = core::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        self.inner.shutdown();
        for worker in workers {
            let _ = worker.join();
        }
        info!("[TxnManager] shut down");
    }
}

impl Drop for TxnManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Debug for TxnManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TxnManager")
            .field("tblocks_in_use", &state.txs.in_use())
            .field("tlocks_in_use", &state.locks.in_use())
            .field("log_active", &state.log_active)
            .field("tlocks_low", &state.tlocks_low)
            .field("quiesce", &state.quiesce)
            .finish()
    }
}

type StateGuard<'a> = CvarMutexGuard<'a, TxnState>;

impl TxnInner {
    pub(super) fn begin(&self, force: bool) -> Result<TxId> {
        let mut state = self.state.lock();
        let id = loop {
            state = self.admit(state, force)?;

            // The last block is kept for forced transactions, which the
            // flush agent and sync need to make progress.
            if !force && state.txs.free_count() <= 1 {
                self.stats.free_tblock_stalls();
                debug!("[TxnManager] begin waits for a free tblock");
                state = self.free_tx_wait.wait(state);
                continue;
            }
            let block = TxBlock {
                flags: TxFlags::empty(),
                logtid: 0,
                commit_lsn: 0,
                locks: Vec::new(),
            };
            match state.txs.alloc(block) {
                Ok(id) => break id,
                Err(_) => {
                    self.stats.free_tblock_stalls();
                    state = self.free_tx_wait.wait(state);
                }
            }
        };

        let tid = TxId(id);
        let logtid = state.stamp_logtid();
        let tx = state.tx_mut(tid);
        tx.logtid = logtid;
        if force {
            tx.flags.insert(TxFlags::FORCED);
        }
        state.log_active += 1;
        self.stats.begins();
        trace!("[TxnManager] begin {:?} (logtid {}, force {})", tid, logtid, force);
        Ok(tid)
    }

    pub(super) fn begin_anonymous(&self) -> Result<()> {
        let state = self.state.lock();
        let _state = self.admit(state, false)?;
        self.stats.anonymous_begins();
        Ok(())
    }

    /// Waits until a transaction may start; re-checks every condition after
    /// each wake-up.
    fn admit<'a>(&'a self, mut state: StateGuard<'a>, force: bool) -> Result<StateGuard<'a>> {
        loop {
            if state.shutdown {
                return_errno_with_msg!(Shutdown, "transaction manager is shut down");
            }
            if force {
                return Ok(state);
            }

            if state.quiesce {
                self.stats.barrier_stalls();
                state = self.sync_wait.wait(state);
                continue;
            }

            if self.log.sync_barrier() {
                if state.log_active == 0 {
                    // Nobody is left whose end would take the sync point.
                    self.take_sync_point()?;
                    continue;
                }
                self.stats.barrier_stalls();
                debug!(
                    "[TxnManager] begin waits for the sync barrier ({} active)",
                    state.log_active
                );
                state = self.sync_wait.wait(state);
                continue;
            }

            if state.tlocks_low {
                self.stats.lock_low_stalls();
                debug!("[TxnManager] begin waits for the lock table to drain");
                state = self.low_lock_wait.wait(state);
                continue;
            }

            return Ok(state);
        }
    }

    fn take_sync_point(&self) -> Result<()> {
        self.log.checkpoint()?;
        self.stats.sync_points();
        debug!("[TxnManager] sync point taken");
        self.sync_wait.notify_all();
        Ok(())
    }

    pub(super) fn end(&self, tid: TxId) {
        let mut state = self.state.lock();
        self.wake_tx_waiters(tid);

        let tx = state.tx_mut(tid);
        if tx.flags.contains(TxFlags::LAZY) {
            // The lazy-commit worker frees the block.
            tx.flags.insert(TxFlags::UNLOCKED);
            trace!("[TxnManager] end {:?} deferred to lazy commit", tid);
        } else {
            assert!(
                tx.locks.is_empty(),
                "{:?} ended while holding {} locks",
                tid,
                tx.locks.len()
            );
            self.free_tblock(&mut state, tid);
            trace!("[TxnManager] end {:?}", tid);
        }
        drop(state);
        self.free_tx_wait.notify_all();
    }

    /// Returns a transaction block to the free pool.
    pub(super) fn free_tblock(&self, state: &mut TxnState, tid: TxId) {
        state.txs.free(tid.0);
        state.log_active -= 1;
        if state.log_active == 0 {
            if self.log.sync_barrier() {
                if let Err(e) = self.take_sync_point() {
                    warn!("[TxnManager] sync point failed: {}", e);
                }
            }
            // Quiesce waits for the last active transaction too.
            self.sync_wait.notify_all();
        }
        self.free_tx_wait.notify_all();
    }

    pub(super) fn wake_tx_waiters(&self, tid: TxId) {
        self.tx_waitors[tid.0.index() as usize].notify_all();
    }

    pub(super) fn lock_with<R>(
        &self,
        tid: TxId,
        object: Arc<dyn MetaObject>,
        ltype: LockType,
        f: impl FnOnce(&mut ChangeDesc) -> R,
    ) -> Result<(LockId, R)> {
        let key = LockKey::of(object.as_ref(), ltype);
        let mut state = self.state.lock();
        let lid = loop {
            if state.shutdown {
                return_errno_with_msg!(Shutdown, "transaction manager is shut down");
            }
            if !tid.is_anonymous() {
                assert!(
                    !state.tx(tid).flags.contains(TxFlags::COMMITTING),
                    "{:?} takes a lock after its commit started",
                    tid
                );
            }

            let Some(lid) = state.index.get(&key).copied() else {
                if let Some(lid) = self.alloc_lock(&mut state, tid, &object, key, ltype) {
                    break lid;
                }
                self.stats.free_lock_stalls();
                debug!("[TxnManager] {:?} waits for a free tlock", tid);
                state = self.free_lock_wait.wait(state);
                continue;
            };

            let owner = state.lock(lid).owner;
            if owner == tid {
                break lid;
            }
            if owner.is_anonymous() {
                state.adopt(tid, lid);
                self.stats.adoptions();
                debug!("[TxnManager] {:?} adopted anonymous {:?}", tid, lid);
                break lid;
            }

            // Held by another transaction: wait for it to release the lock,
            // then start over since anything may have changed meanwhile.
            self.stats.contention_waits();
            trace!("[TxnManager] {:?} waits for {:?} held by {:?}", tid, lid, owner);
            object.release_for_wait();
            state = self.tx_waitors[owner.0.index() as usize].wait(state);
            if !object.revalidate() {
                return_errno_with_msg!(Stale, "object invalidated while waiting for its lock");
            }
        };
        let res = f(&mut state.lock_mut(lid).desc);
        Ok((lid, res))
    }

    fn alloc_lock(
        &self,
        state: &mut TxnState,
        tid: TxId,
        object: &Arc<dyn MetaObject>,
        key: LockKey,
        ltype: LockType,
    ) -> Option<LockId> {
        let desc = object.describe_change(ltype);
        assert_eq!(
            desc.lock_type(),
            ltype,
            "object {} described a {:?} change for a {:?} lock",
            key.object,
            desc.lock_type(),
            ltype
        );
        let inode = object.inode();
        let lock = TxLock {
            owner: tid,
            object: object.clone(),
            key,
            inode,
            desc,
        };
        let lid = LockId(state.locks.alloc(lock).ok()?);

        object.pin_for_write();
        state.index.insert(key, lid);
        if tid.is_anonymous() {
            state.anon.push(inode, lid);
        } else {
            state.tx_mut(tid).locks.push(lid);
        }
        self.stats.lock_allocs();

        let in_use = state.locks.in_use();
        if in_use > self.watermarks.high && !state.agent_wanted {
            state.agent_wanted = true;
            self.agent_wait.notify_all();
        }
        if in_use > self.watermarks.very_high && !state.tlocks_low {
            info!(
                "[TxnManager] lock table at {} of {}, holding back new transactions",
                in_use, self.config.ntxlock
            );
            state.tlocks_low = true;
        }
        Some(lid)
    }

    /// Frees a lock and unpins its object, after asking the object to drop
    /// its change if `discard` is set.
    fn free_lock(&self, state: &mut TxnState, lid: LockId, discard: bool) {
        let lock = state.locks.free(lid.0);
        state.index.remove(&lock.key);
        if discard {
            lock.object.discard_changes();
        }
        lock.object.unpin();

        if state.tlocks_low && state.locks.in_use() < self.watermarks.low {
            state.tlocks_low = false;
            info!("[TxnManager] lock table drained, admitting transactions again");
            self.low_lock_wait.notify_all();
        }
        self.free_lock_wait.notify_all();
    }

    /// Releases every lock of `tid` and wakes the threads waiting for them.
    pub(super) fn release_locks(&self, state: &mut TxnState, tid: TxId, discard: bool) -> usize {
        let lids = core::mem::take(&mut state.tx_mut(tid).locks);
        let count = lids.len();
        for lid in lids {
            self.free_lock(state, lid, discard);
        }
        self.wake_tx_waiters(tid);
        count
    }

    pub(super) fn update<R>(&self, lid: LockId, f: impl FnOnce(&mut ChangeDesc) -> R) -> Result<R> {
        let mut state = self.state.lock();
        let Some(owner) = state.locks.get(lid.0).map(|lock| lock.owner) else {
            debug!("[TxnManager] {:?} was released before its update", lid);
            return_errno_with_msg!(Stale, "lock was released");
        };
        if !owner.is_anonymous() && state.tx(owner).flags.contains(TxFlags::COMMITTING) {
            debug!("[TxnManager] {:?} of {:?} updated after its commit started", lid, owner);
            return_errno_with_msg!(Stale, "lock owner is committing");
        }
        Ok(f(&mut state.lock_mut(lid).desc))
    }

    pub(super) fn abort(&self, tid: TxId) {
        let mut state = self.state.lock();
        assert!(
            !state.tx(tid).flags.contains(TxFlags::COMMITTING),
            "{:?} aborted after its commit started",
            tid
        );
        let count = self.release_locks(&mut state, tid, true);
        self.stats.aborts();
        debug!("[TxnManager] {:?} aborted, {} locks released", tid, count);
    }

    pub(super) fn release_anonymous(&self, inode: InodeNo) {
        let mut state = self.state.lock();
        let lids = state.anon.take(inode);
        for lid in lids.iter() {
            self.free_lock(&mut state, *lid, true);
        }
        debug!(
            "[TxnManager] released {} anonymous locks of inode {}",
            lids.len(),
            inode
        );
    }

    pub(super) fn quiesce(&self) -> Result<()> {
        self.state.lock().quiesce = true;
        info!("[TxnManager] quiescing");

        self.flush_anonymous(false)?;

        let mut state = self.state.lock();
        while state.log_active > 0 && !state.shutdown {
            state = self.sync_wait.wait(state);
        }
        Ok(())
    }

    pub(super) fn resume(&self) {
        self.state.lock().quiesce = false;
        info!("[TxnManager] resumed");
        self.sync_wait.notify_all();
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        drop(state);

        for cond in [
            &self.free_tx_wait,
            &self.free_lock_wait,
            &self.low_lock_wait,
            &self.sync_wait,
            &self.agent_wait,
        ] {
            cond.notify_all();
        }
        for cond in self.tx_waitors.iter() {
            cond.notify_all();
        }
        self.lazy.shutdown();
    }
}
