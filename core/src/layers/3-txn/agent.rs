//! The anonymous-lock flush agent.
//!
//! Updates made outside a transaction hold anonymous locks until some
//! transaction adopts them. When the lock table crosses its high watermark
//! the agent commits them itself, one inode per forced transaction, oldest
//! inode first, until the table drops below the low watermark.
use super::commit::CommitOptions;
use super::manager::TxnInner;
use crate::prelude::*;

impl TxnInner {
    pub(super) fn flush_agent_looped(&self) {
        info!("[FlushAgent] started");
        loop {
            let mut state = self.state.lock();
            while !state.agent_wanted && !state.shutdown {
                state = self.agent_wait.wait(state);
            }
            if state.shutdown {
                break;
            }
            drop(state);

            self.stats.agent_runs();
            match self.flush_anonymous(true) {
                Ok(0) => {}
                Ok(n) => debug!("[FlushAgent] committed anonymous locks of {} inodes", n),
                Err(e) => warn!("[FlushAgent] flush stopped: {}", e),
            }
            self.state.lock().agent_wanted = false;
        }
        info!("[FlushAgent] stopped");
    }

    /// Commits the anonymous locks of registered inodes, oldest first,
    /// until none are left or, with `until_low`, the lock table is below
    /// its low watermark. Returns the number of inodes flushed.
    pub(super) fn flush_anonymous(&self, until_low: bool) -> Result<usize> {
        let mut flushed = 0;
        loop {
            let inode = {
                let state = self.state.lock();
                if state.shutdown {
                    break;
                }
                if until_low && state.locks.in_use() < self.watermarks.low {
                    break;
                }
                match state.anon.oldest() {
                    Some(inode) => inode,
                    None => break,
                }
            };

            let tid = self.begin(true)?;
            let opts = CommitOptions {
                lazy: false,
                inodes: vec![inode],
            };
            let res = self.commit_with(tid, &opts);
            self.end(tid);
            res?;
            flushed += 1;
        }
        Ok(flushed)
    }
}
