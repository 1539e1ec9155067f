#[path = "0-arena/mod.rs"]
pub mod arena;
#[path = "1-lock/mod.rs"]
pub mod lock;
#[path = "2-log/mod.rs"]
pub mod log;
#[path = "3-txn/mod.rs"]
pub mod txn;
