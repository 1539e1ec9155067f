//! The log-device contract.
use super::record::{LogRecord, Lsn};
use crate::os::{Condvar, CvarMutex};
use crate::prelude::*;

/// Invoked once the records up to a forced LSN are durable, or the force
/// failed.
///
/// The callback may run on the log's own I/O thread or, if the records are
/// already durable, directly on the caller's thread. It must not block.
pub type ForceCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// A write-ahead log as seen by the transaction manager.
pub trait LogDevice: Send + Sync {
    /// Appends a record to the log, returning its LSN.
    ///
    /// The record is not durable until a `force` covering its LSN completes.
    fn reserve_and_write(&self, record: &LogRecord) -> Result<Lsn>;

    /// Requests that every record up to `upto` becomes durable, calling
    /// `on_complete` when done.
    ///
    /// Concurrent requests may be served by the same I/O.
    fn force(&self, upto: Lsn, on_complete: ForceCallback);

    /// Returns whether the log wants a sync point: new non-forced
    /// transactions are held back until the active ones drain and a
    /// checkpoint is taken.
    fn sync_barrier(&self) -> bool;

    /// Writes a sync point and lifts the sync barrier.
    fn checkpoint(&self) -> Result<()>;

    /// Forces the log up to `upto` and blocks until it is durable.
    fn force_sync(&self, upto: Lsn) -> Result<()> {
        let completion = Arc::new(Completion::new());
        let notifier = completion.clone();
        self.force(upto, Box::new(move |res| notifier.complete(res)));
        completion.wait()
    }
}

/// A one-shot completion a thread can block on.
pub struct Completion {
    result: CvarMutex<Option<Result<()>>>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            result: CvarMutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Stores the result and wakes the waiter. Only the first result counts.
    pub fn complete(&self, res: Result<()>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(res);
        }
        drop(result);
        self.cond.notify_all();
    }

    /// Blocks until the completion is signalled.
    pub fn wait(&self) -> Result<()> {
        let mut result = self.result.lock();
        loop {
            if let Some(res) = result.as_ref() {
                return res.clone();
            }
            result = self.cond.wait(result);
        }
    }

    /// Returns the result if the completion has been signalled.
    pub fn try_result(&self) -> Option<Result<()>> {
        self.result.lock().clone()
    }
}

impl Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("result", &self.try_result())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::spawn;

    #[test]
    fn completion_wakes_waiter() {
        let completion = Arc::new(Completion::new());
        assert!(completion.try_result().is_none());

        let notifier = completion.clone();
        let handle = spawn(move || notifier.complete(Err(Error::new(IoFailed))));
        assert_eq!(completion.wait().unwrap_err().errno(), IoFailed);
        handle.join().unwrap();

        // Later results are ignored.
        completion.complete(Ok(()));
        assert!(completion.wait().is_err());
    }
}
