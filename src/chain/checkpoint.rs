use crate::consensus::{RegistryUndo, ValidatorRegistry};
use crate::hash::BlockHash;
use crate::ledger::Ledger;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use tracing::{debug, info};

/// How often checkpoints are taken and how many are kept
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// A checkpoint is taken at every multiple of this height
    pub interval: u64,
    /// Checkpoints kept after pruning
    pub retention: usize,
    /// Most recent checkpoints that survive pruning whatever `retention` says
    pub safety_net: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: 1_000,
            retention: 10,
            safety_net: 2,
        }
    }
}

impl CheckpointConfig {
    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.interval == 0 {
            return Err("checkpoint interval must be positive".into());
        }
        if self.retention == 0 && self.safety_net == 0 {
            return Err("at least one checkpoint must be retained".into());
        }
        Ok(())
    }

    /// Number of checkpoints pruning leaves behind
    pub fn keep(&self) -> usize {
        self.retention.max(self.safety_net).max(1)
    }
}

/// Ledger and validator state as of one block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    pub block_hash: BlockHash,
    pub timestamp: u64,
    pub ledger: Ledger,
    pub registry: ValidatorRegistry,
    /// Undo records of the blocks still inside the reorganization window
    pub undo: BTreeMap<u64, Vec<RegistryUndo>>,
    /// Slashing events recorded when the checkpoint was taken
    pub slashing_sequence: u64,
    /// The block at `height` is finalized
    pub verified: bool,
}

/// Bounded, height-ordered set of checkpoints
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManager {
    config: CheckpointConfig,
    checkpoints: BTreeMap<u64, Checkpoint>,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            checkpoints: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// A checkpoint is due at this height
    pub fn is_due(&self, height: u64) -> bool {
        height > 0 && height % self.config.interval.max(1) == 0
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn get(&self, height: u64) -> Option<&Checkpoint> {
        self.checkpoints.get(&height)
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.values().next_back()
    }

    pub fn heights(&self) -> Vec<u64> {
        self.checkpoints.keys().copied().collect()
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.values()
    }

    /// Store a checkpoint and prune. Returns the heights pruned away.
    pub fn insert(&mut self, checkpoint: Checkpoint) -> Vec<u64> {
        info!(height = checkpoint.height, block = %checkpoint.block_hash.short(), "checkpoint created");
        self.checkpoints.insert(checkpoint.height, checkpoint);
        self.prune()
    }

    /// Verify every unverified checkpoint at or below the finalized height
    /// whose block is still canonical. Returns the heights newly verified.
    pub fn verify_finalized<F>(&mut self, finalized: u64, canonical: F) -> Vec<u64>
    where
        F: Fn(u64) -> Option<BlockHash>,
    {
        let mut verified = Vec::new();
        for (height, cp) in self.checkpoints.range_mut(..=finalized) {
            if cp.verified {
                continue;
            }
            if canonical(*height).as_ref() == Some(&cp.block_hash) {
                cp.verified = true;
                verified.push(*height);
            }
        }
        if !verified.is_empty() {
            debug!(heights = ?verified, "checkpoints verified");
        }
        verified
    }

    /// Drop checkpoints above `height`, which no longer describe the chain
    pub fn truncate_above(&mut self, height: u64) -> Vec<u64> {
        let dropped: Vec<u64> = self.checkpoints.range((Excluded(height), Unbounded)).map(|(h, _)| *h).collect();
        for h in &dropped {
            self.checkpoints.remove(h);
        }
        dropped
    }

    /// Keep only the most recent `config.keep()` checkpoints
    pub fn prune(&mut self) -> Vec<u64> {
        let keep = self.config.keep();
        let excess = self.checkpoints.len().saturating_sub(keep);
        let pruned: Vec<u64> = self.checkpoints.keys().take(excess).copied().collect();
        for h in &pruned {
            self.checkpoints.remove(h);
        }
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "pruned old checkpoints");
        }
        pruned
    }
}
