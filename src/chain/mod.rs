// Chain module - CHAIN CONTEXT
// Genesis, configuration, block application, fork choice, checkpoints and snapshots

mod checkpoint;
mod config;
mod genesis;
mod manager;
mod reorg;
mod snapshot;

pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointManager};
pub use config::{ChainConfig, ConfigError, ConsensusConfig, GenesisConfig};
pub use genesis::{build_genesis_block, validate_genesis};
pub use manager::{ChainManager, ChainStatus, ExpiryReport};
pub use reorg::ReorgOutcome;
pub use snapshot::{SnapshotError, StateSnapshot, SNAPSHOT_VERSION};
