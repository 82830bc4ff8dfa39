// Mempool module - pending transactions awaiting block inclusion

mod pool;

pub use pool::{Admission, Mempool, MempoolConfig, MempoolError};
