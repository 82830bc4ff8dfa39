//! Versioned JSON export of the whole chain state
//!
//! A snapshot carries every block plus the derived state (ledger, registry,
//! finality, slashing history, checkpoints and pending transactions) so a
//! node can restart or be seeded without replaying blocks. Import checks the
//! hash chain and merkle roots, then replays the blocks into a fresh ledger
//! and compares balances before trusting it.

use crate::block::{Block, BlockError, BlockValidator};
use crate::chain::{validate_genesis, ChainConfig, CheckpointManager};
use crate::consensus::{Finalizer, RegistryUndo, SlashingEngine, ValidatorRegistry};
use crate::identity::Address;
use crate::ledger::{Ledger, LedgerError};
use crate::tx::{Amount, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

/// Format version written by this build
pub const SNAPSHOT_VERSION: u32 = 1;

/// Errors from snapshot export and import
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Unsupported snapshot version {found}, expected {expected}")]
    UnsupportedVersion { found: u64, expected: u32 },

    #[error("Malformed snapshot: {0}")]
    Json(String),

    #[error("Snapshot I/O failed: {0}")]
    Io(String),

    #[error("Snapshot contains no blocks")]
    EmptyChain,

    #[error("Snapshot genesis is invalid: {0}")]
    Genesis(BlockError),

    #[error("Snapshot chain broken at height {height}: {reason}")]
    BrokenChain { height: u64, reason: String },

    #[error("Snapshot ledger is inconsistent: {0}")]
    Ledger(LedgerError),

    #[error("Snapshot ledger minted {ledger}, blocks mint {blocks}")]
    MintedMismatch { ledger: Amount, blocks: Amount },

    #[error("Snapshot balance of {address} is {snapshot}, replaying the blocks gives {replayed}")]
    BalanceMismatch {
        address: Address,
        snapshot: Amount,
        replayed: Amount,
    },

    #[error("Snapshot finality state is inconsistent: {0}")]
    Finality(String),
}

impl SnapshotError {
    /// Failed reading or writing rather than on content
    pub fn is_io(&self) -> bool {
        matches!(self, SnapshotError::Io(_))
    }
}

/// Complete exported chain state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub exported_at: u64,
    pub config: ChainConfig,
    pub blocks: Vec<Block>,
    pub ledger: Ledger,
    pub registry: ValidatorRegistry,
    pub undo: BTreeMap<u64, Vec<RegistryUndo>>,
    pub finalizer: Finalizer,
    pub slashing: SlashingEngine,
    pub checkpoints: CheckpointManager,
    pub mempool: Vec<Transaction>,
}

impl StateSnapshot {
    pub fn height(&self) -> u64 {
        self.blocks.len().saturating_sub(1) as u64
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        serde_json::to_string_pretty(self).map_err(|e| SnapshotError::Json(e.to_string()))
    }

    /// Parse a snapshot. The version is checked before the body so older or
    /// newer formats fail with a clear error.
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        let value: serde_json::Value = serde_json::from_str(json).map_err(|e| SnapshotError::Json(e.to_string()))?;
        let found = value
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| SnapshotError::Json("missing version".into()))?;
        if found != SNAPSHOT_VERSION as u64 {
            return Err(SnapshotError::UnsupportedVersion {
                found,
                expected: SNAPSHOT_VERSION,
            });
        }
        serde_json::from_value(value).map_err(|e| SnapshotError::Json(e.to_string()))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SnapshotError> {
        std::fs::write(path, self.to_json()?).map_err(|e| SnapshotError::Io(e.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SnapshotError> {
        let json = std::fs::read_to_string(path).map_err(|e| SnapshotError::Io(e.to_string()))?;
        Self::from_json(&json)
    }

    /// Check internal consistency
    pub fn verify(&self) -> Result<(), SnapshotError> {
        let genesis = self.blocks.first().ok_or(SnapshotError::EmptyChain)?;
        validate_genesis(genesis, &self.config.genesis).map_err(SnapshotError::Genesis)?;

        for (index, pair) in self.blocks.windows(2).enumerate() {
            let (parent, block) = (&pair[0], &pair[1]);
            let height = index as u64 + 1;
            let broken = |reason: String| SnapshotError::BrokenChain { height, reason };
            if block.height != height {
                return Err(broken(format!("block claims height {}", block.height)));
            }
            if block.prev_hash != parent.hash {
                return Err(broken("previous hash does not match parent".into()));
            }
            BlockValidator::check_integrity(block).map_err(|e| broken(e.to_string()))?;
        }

        self.ledger.verify_integrity().map_err(SnapshotError::Ledger)?;

        let minted = self
            .blocks
            .iter()
            .flat_map(|b| b.transactions.iter())
            .filter(|tx| tx.is_system())
            .try_fold(Amount::ZERO, |acc, tx| acc.checked_add(tx.amount()))
            .ok_or_else(|| SnapshotError::Json("minted supply overflows".into()))?;
        if minted != self.ledger.minted() {
            return Err(SnapshotError::MintedMismatch {
                ledger: self.ledger.minted(),
                blocks: minted,
            });
        }

        self.verify_balances()?;

        if self.finalizer.latest_finalized_height() > self.height() {
            return Err(SnapshotError::Finality(format!(
                "finalized height {} is above the chain height {}",
                self.finalizer.latest_finalized_height(),
                self.height()
            )));
        }
        for block in &self.blocks {
            if let Some(hash) = self.finalizer.finalized_hash(block.height) {
                if hash != &block.hash {
                    return Err(SnapshotError::Finality(format!(
                        "finalized block at height {} is not the snapshot's block",
                        block.height
                    )));
                }
            }
        }
        Ok(())
    }

    /// Replay every block into an empty ledger and compare the balances
    fn verify_balances(&self) -> Result<(), SnapshotError> {
        let mut replayed = Ledger::new(
            self.config.genesis.unspendable_address.clone(),
            self.config.genesis.staking_address.clone(),
        );
        for block in &self.blocks {
            for tx in &block.transactions {
                replayed.apply(tx).map_err(|e| SnapshotError::BrokenChain {
                    height: block.height,
                    reason: e.to_string(),
                })?;
            }
        }

        let addresses: BTreeSet<&Address> = self
            .ledger
            .accounts()
            .chain(replayed.accounts())
            .map(|(address, _)| address)
            .collect();
        for address in addresses {
            let snapshot = self.ledger.get_balance(address);
            let replayed = replayed.get_balance(address);
            if snapshot != replayed {
                return Err(SnapshotError::BalanceMismatch {
                    address: address.clone(),
                    snapshot,
                    replayed,
                });
            }
        }
        Ok(())
    }
}
