//! Counters of the transaction manager.
use core::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};

macro_rules! define_stats {
    ($($(#[$meta:meta])* $field:ident,)*) => {
        /// Live counters, bumped without taking the table lock.
        #[derive(Default)]
        pub(super) struct TxStats {
            $($field: AtomicU64,)*
        }

        /// A point-in-time copy of the counters.
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct TxStatsSnapshot {
            $($(#[$meta])* pub $field: u64,)*
        }

        impl TxStats {
            $(pub fn $field(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            })*

            pub fn snapshot(&self) -> TxStatsSnapshot {
                TxStatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

define_stats! {
    /// Transactions started.
    begins,
    /// Starts held back by a sync barrier or quiesce.
    barrier_stalls,
    /// Starts held back because the lock table was nearly full.
    lock_low_stalls,
    /// Starts that waited for a free transaction block.
    free_tblock_stalls,
    /// Admissions of anonymous writers.
    anonymous_begins,
    /// Locks allocated.
    lock_allocs,
    /// Lock requests that waited for a free lock slot.
    free_lock_stalls,
    /// Lock requests that waited for another transaction.
    contention_waits,
    /// Anonymous locks adopted by a transaction.
    adoptions,
    /// Transactions committed.
    commits,
    /// Transactions committed lazily.
    lazy_commits,
    /// Transactions aborted, before or during commit.
    aborts,
    /// Log records written.
    records_written,
    /// Sync points taken when the last active transaction ended.
    sync_points,
    /// Flush-agent passes.
    agent_runs,
}

impl TxStats {
    pub fn add_records(&self, n: u64) {
        self.records_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_adoptions(&self, n: u64) {
        self.adoptions.fetch_add(n, Ordering::Relaxed);
    }
}
