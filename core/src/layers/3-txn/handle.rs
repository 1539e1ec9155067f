//! Scoped transactions.
use super::commit::CommitOptions;
use super::manager::TxnManager;
use super::table::{LockId, TxId};
use crate::layers::lock::{ChangeDesc, InodeNo, LockType, MetaObject};
use crate::prelude::*;

/// A running transaction.
///
/// Committing or aborting consumes the handle and ends the transaction.
/// Dropping an unfinished handle aborts it.
///
/// # Examples
///
/// ```ignore
/// let tx = manager.transaction(false)?;
/// let lid = tx.lock(page.clone(), LockType::Data)?;
/// page.write(128, &bytes);
/// tx.update(lid, |desc| desc.as_data_mut().unwrap().add_bytes(128, bytes.len()))?;
/// tx.commit()?;
/// ```
#[must_use = "dropping a transaction aborts it"]
pub struct Transaction<'a> {
    manager: &'a TxnManager,
    tid: TxId,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(super) fn new(manager: &'a TxnManager, tid: TxId) -> Self {
        Self {
            manager,
            tid,
            finished: false,
        }
    }

    pub fn tid(&self) -> TxId {
        self.tid
    }

    pub fn lock(&self, object: Arc<dyn MetaObject>, ltype: LockType) -> Result<LockId> {
        self.manager.lock(self.tid, object, ltype)
    }

    pub fn update<R>(&self, lid: LockId, f: impl FnOnce(&mut ChangeDesc) -> R) -> Result<R> {
        self.manager.update(lid, f)
    }

    /// Commits with the manager's default commit mode and ends.
    pub fn commit(self) -> Result<()> {
        let lazy = self.manager.config().lazy_commit;
        self.finish(&CommitOptions {
            lazy,
            inodes: Vec::new(),
        })
    }

    /// Commits lazily and ends.
    pub fn commit_lazy(self) -> Result<()> {
        self.finish(&CommitOptions {
            lazy: true,
            inodes: Vec::new(),
        })
    }

    /// Commits together with the anonymous locks of `inodes` and ends.
    pub fn commit_with_inodes(self, inodes: &[InodeNo]) -> Result<()> {
        let lazy = self.manager.config().lazy_commit;
        self.finish(&CommitOptions {
            lazy,
            inodes: inodes.to_vec(),
        })
    }

    fn finish(mut self, opts: &CommitOptions) -> Result<()> {
        self.finished = true;
        let res = self.manager.commit_with(self.tid, opts);
        self.manager.end(self.tid);
        res
    }

    /// Aborts and ends.
    pub fn abort(mut self) {
        self.finished = true;
        self.manager.abort(self.tid);
        self.manager.end(self.tid);
    }
}

impl<'a> Drop for Transaction<'a> {
    fn drop(&mut self) {
        if self.finished || std::thread::panicking() {
            return;
        }
        self.manager.abort(self.tid);
        self.manager.end(self.tid);
    }
}

impl<'a> Debug for Transaction<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("tid", &self.tid)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::log::scan_log;
    use crate::layers::txn::test_util::{new_manager, small_config, MemPage};

    #[test]
    fn commit_ends_the_transaction() {
        let (manager, log) = new_manager(small_config());
        let page = MemPage::new(1, 1, 64);
        let tx = manager.transaction(false).unwrap();
        let logtid = manager.logtid(tx.tid()).unwrap();
        let lid = tx.lock(page.clone(), LockType::Data).unwrap();
        page.write(8, &[1, 2, 3, 4]);
        tx.update(lid, |desc| desc.as_data_mut().unwrap().add_bytes(8, 4)).unwrap();
        tx.commit().unwrap();

        assert_eq!(manager.active_transactions(), 0);
        assert_eq!(page.pins(), 0);
        assert!(scan_log(&log.durable_image()).is_committed(logtid));
    }

    #[test]
    fn drop_aborts() {
        let (manager, log) = new_manager(small_config());
        let page = MemPage::new(1, 1, 64);
        {
            let tx = manager.transaction(false).unwrap();
            tx.lock(page.clone(), LockType::Data).unwrap();
        }
        assert_eq!(manager.active_transactions(), 0);
        assert_eq!(page.discards(), 1);
        assert_eq!(page.pins(), 0);
        assert_eq!(log.end_lsn(), 0);
    }

    #[test]
    fn commit_lazy_through_handle() {
        let (manager, log) = new_manager(small_config());
        let page = MemPage::new(1, 1, 64);
        let tx = manager.transaction(false).unwrap();
        let logtid = manager.logtid(tx.tid()).unwrap();
        let lid = tx.lock(page.clone(), LockType::Data).unwrap();
        tx.update(lid, |desc| desc.as_data_mut().unwrap().add_bytes(0, 4)).unwrap();
        tx.commit_lazy().unwrap();
        manager.wait_lazy_idle();

        assert_eq!(manager.active_transactions(), 0);
        assert_eq!(page.pins(), 0);
        assert!(scan_log(&log.durable_image()).is_committed(logtid));
    }

    #[test]
    fn commit_with_inodes_takes_anonymous_locks() {
        let (manager, _log) = new_manager(small_config());
        let anon = MemPage::new(1, 12, 64);
        manager
            .lock(TxId::ANONYMOUS, anon.clone(), LockType::Data)
            .unwrap();

        let tx = manager.transaction(false).unwrap();
        tx.commit_with_inodes(&[12]).unwrap();
        assert!(manager.anonymous_inodes().is_empty());
        assert_eq!(manager.locks_in_use(), 0);
        assert_eq!(anon.pins(), 0);
        assert_eq!(anon.discards(), 0);
    }
}
