//! 存储层：离线消息、投递记录与用户目录
//! Storage layer: offline messages, delivery ledger and user directory

pub mod memory;
#[cfg(feature = "postgres")]
pub mod pg_store;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod traits;

pub use memory::{MemoryLedgerStore, MemoryOfflineStore, StaticDirectory};
pub use traits::{IndexSpec, LedgerStore, OfflineStore, StoreError, StoreResult, UserDirectory, REQUIRED_INDEXES};
