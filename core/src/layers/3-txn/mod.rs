//! The layer of the transaction manager.
//!
//! `TxnManager` makes updates to many metadata objects atomic. A caller
//! begins a transaction, locks every object it modifies, records each
//! change in the lock's change descriptor and commits. The commit logs all
//! the changes, forces the log and only then releases the locks, so no
//! object reaches its home location before the change is durable.
//!
//! Updates made outside any transaction take anonymous locks, which the
//! first transaction touching the object adopts, or which the flush agent
//! commits when the lock table runs low.
//!
//! # Usage Example
//!
//! ```ignore
//! let log = Arc::new(MemLog::new(MemLogConfig::default()));
//! let manager = TxnManager::new(TxConfig::default(), log)?;
//!
//! let tid = manager.begin(false)?;
//! let lid = manager.lock(tid, inode.clone(), LockType::Inode)?;
//! manager.update(lid, |desc| desc.as_inode_mut().unwrap().touch(0, 32))?;
//! manager.commit(tid)?;
//! manager.end(tid);
//! ```
mod agent;
mod commit;
mod config;
mod format;
mod handle;
mod manager;
mod stats;
mod table;
#[cfg(test)]
mod test_util;

pub use self::commit::{AllocMap, CommitOptions};
pub use self::config::{TxConfig, Watermarks};
pub use self::handle::Transaction;
pub use self::manager::TxnManager;
pub use self::stats::TxStatsSnapshot;
pub use self::table::{LockId, TxFlags, TxId};
