//! The layer of fixed-capacity arenas.
//!
//! The lock table and the transaction table are both `SlotTable`s: a
//! fixed-size array of slots handed out through a free list. A slot is
//! addressed by a `SlotId`, which pairs the slot index with the generation
//! of the slot at allocation time. Each free bumps the generation, so a
//! stale id can never reach the value stored by a later allocation, and a
//! second free of the same id is caught instead of corrupting the free list.
//!
//! Index 0 is never handed out, leaving it free to mean "no slot".
mod slot_table;

pub use self::slot_table::{SlotId, SlotTable};
