// Storage module - PERSISTENCE
// Ordered key-value stores (memory and sled) and the chain object layout on top

mod chain_store;
mod kv;
mod store;

pub use chain_store::{ChainHead, ChainStore, TxLocation};
pub use kv::{BatchOp, KvStore, MemoryStore};
pub use store::{SledStore, StorageStats, StoreError};
