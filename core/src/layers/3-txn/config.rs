//! Sizing and behavior knobs of the transaction manager.
use crate::prelude::*;

use serde::{Deserialize, Serialize};

/// Configuration of a `TxnManager`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxConfig {
    /// Capacity of the transaction table.
    pub ntxblock: usize,
    /// Capacity of the lock table.
    pub ntxlock: usize,
    /// Redo payloads up to this many bytes are copied into the log record;
    /// larger ones are logged page-relative.
    #[serde(default = "default_inline_payload_max")]
    pub inline_payload_max: usize,
    /// Whether `commit` defaults to a lazy commit.
    #[serde(default)]
    pub lazy_commit: bool,
    /// Whether to run the anonymous-lock flush agent.
    #[serde(default = "default_flush_agent")]
    pub flush_agent: bool,
}

fn default_inline_payload_max() -> usize {
    256
}

fn default_flush_agent() -> bool {
    true
}

/// Occupancy thresholds of the lock table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Watermarks {
    /// Below this, held-back transaction starts resume.
    pub low: usize,
    /// Above this, the flush agent is woken.
    pub high: usize,
    /// Above this, new non-forced transactions are held back.
    pub very_high: usize,
}

impl TxConfig {
    pub const NTXBLOCK_MIN: usize = 16;
    pub const NTXBLOCK_MAX: usize = 65536;
    pub const NTXLOCK_MIN: usize = 256;
    pub const NTXLOCK_MAX: usize = 65536;

    /// Sizes the tables from the amount of memory, in pages.
    pub fn for_memory(total_ram_pages: usize) -> Self {
        Self::with_tables(None, None, total_ram_pages)
    }

    /// Sizes the tables, deriving whichever is not given.
    ///
    /// Without either size, the lock table gets a quarter of the memory
    /// pages, at most 64Ki entries. Given only the transaction table, the
    /// lock table gets 8 entries per transaction. The transaction table
    /// defaults to an eighth of the lock table. Both are then clamped to
    /// their ranges.
    pub fn with_tables(
        ntxblock: Option<usize>,
        ntxlock: Option<usize>,
        total_ram_pages: usize,
    ) -> Self {
        let ntxlock = ntxlock.unwrap_or_else(|| match ntxblock {
            None if total_ram_pages > 256 * 1024 => 64 * 1024,
            None => total_ram_pages / 4,
            Some(n) if n > 8 * 1024 => 64 * 1024,
            Some(n) => n.saturating_mul(8),
        });
        let ntxblock = ntxblock.unwrap_or(ntxlock / 8);

        Self {
            ntxblock: ntxblock.clamp(Self::NTXBLOCK_MIN, Self::NTXBLOCK_MAX),
            ntxlock: ntxlock.clamp(Self::NTXLOCK_MIN, Self::NTXLOCK_MAX),
            inline_payload_max: default_inline_payload_max(),
            lazy_commit: false,
            flush_agent: default_flush_agent(),
        }
    }

    /// Checks that the table sizes are within range.
    pub fn validate(&self) -> Result<()> {
        if !(Self::NTXBLOCK_MIN..=Self::NTXBLOCK_MAX).contains(&self.ntxblock) {
            return_errno_with_msg!(InvalidArgs, "ntxblock out of range");
        }
        if !(Self::NTXLOCK_MIN..=Self::NTXLOCK_MAX).contains(&self.ntxlock) {
            return_errno_with_msg!(InvalidArgs, "ntxlock out of range");
        }
        Ok(())
    }

    /// Returns the lock-table watermarks: 40%, 70% and 80% of its size.
    pub fn watermarks(&self) -> Watermarks {
        Watermarks {
            low: self.ntxlock * 4 / 10,
            high: self.ntxlock * 7 / 10,
            very_high: self.ntxlock * 8 / 10,
        }
    }
}

impl Default for TxConfig {
    fn default() -> Self {
        Self::with_tables(None, Some(Self::NTXLOCK_MAX), 0)
    }
}
