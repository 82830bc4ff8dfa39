//! stakechain - permissioned proof-of-stake ledger core
//!
//! Signed transactions move value between addresses whose balances are
//! backed by unspent ledger entries. Validators bond stake, propose blocks
//! in a stake-weighted deterministic rotation, finalize them with
//! two-thirds stake votes, and are slashed for double-signing, inactivity or
//! malicious forks. The chain reorganizes to longer competing segments
//! within a bounded depth and never past a finalized block.

pub mod block;
pub mod chain;
pub mod clock;
pub mod consensus;
pub mod error;
pub mod hash;
pub mod identity;
pub mod ledger;
pub mod mempool;
pub mod storage;
pub mod tx;

pub use chain::{ChainConfig, ChainManager};
pub use error::{ChainError, ConsensusError, ErrorKind};
