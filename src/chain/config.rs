use crate::block::BlockConfig;
use crate::chain::CheckpointConfig;
use crate::consensus::SlashingConfig;
use crate::identity::Address;
use crate::mempool::MempoolConfig;
use crate::tx::{Amount, TxRules};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors from loading or checking configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {section} configuration: {reason}")]
    Invalid { section: &'static str, reason: String },

    #[error("Failed to read configuration: {0}")]
    Io(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    fn invalid(section: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            section,
            reason: reason.into(),
        }
    }
}

/// Initial allocations of the genesis block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Receives `unspendable_amount`; can never send
    pub unspendable_address: Address,
    pub unspendable_amount: Amount,
    pub message: String,
    /// Receives `staking_amount` and becomes the first validator
    pub staking_address: Address,
    pub staking_amount: Amount,
    pub timestamp: u64,
}

impl GenesisConfig {
    pub fn new(staking_address: Address) -> Self {
        Self {
            unspendable_address: Address::unspendable(),
            unspendable_amount: Amount::from_coins(50),
            message: "bitcoin aged fine!".to_string(),
            staking_address,
            staking_amount: Amount::from_coins(150),
            timestamp: 0,
        }
    }
}

/// Validator set, finality and fork-choice parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub min_stake: Amount,
    /// Share of active stake that finalizes a block, in basis points
    pub finality_threshold_bps: u64,
    pub vote_timeout_secs: u64,
    /// Heights a proposer sits out after proposing
    pub selection_cooldown_blocks: u64,
    pub max_reorg_depth: u64,
    pub slashing: SlashingConfig,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_stake: Amount::from_coins(100),
            finality_threshold_bps: 6_700,
            vote_timeout_secs: 300,
            selection_cooldown_blocks: 1,
            max_reorg_depth: 100,
            slashing: SlashingConfig::default(),
        }
    }
}

impl ConsensusConfig {
    pub fn with_min_stake(mut self, min_stake: Amount) -> Self {
        self.min_stake = min_stake;
        self
    }

    pub fn with_finality_threshold_bps(mut self, bps: u64) -> Self {
        self.finality_threshold_bps = bps;
        self
    }

    pub fn with_vote_timeout_secs(mut self, secs: u64) -> Self {
        self.vote_timeout_secs = secs;
        self
    }

    pub fn with_selection_cooldown(mut self, blocks: u64) -> Self {
        self.selection_cooldown_blocks = blocks;
        self
    }

    pub fn with_max_reorg_depth(mut self, depth: u64) -> Self {
        self.max_reorg_depth = depth;
        self
    }

    pub fn with_slashing(mut self, slashing: SlashingConfig) -> Self {
        self.slashing = slashing;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_stake.is_zero() {
            return Err(ConfigError::invalid("consensus", "min_stake must be positive"));
        }
        if self.finality_threshold_bps == 0 || self.finality_threshold_bps > 10_000 {
            return Err(ConfigError::invalid(
                "consensus",
                format!("finality threshold {} bps is outside 1..=10000", self.finality_threshold_bps),
            ));
        }
        if self.max_reorg_depth == 0 {
            return Err(ConfigError::invalid("consensus", "max_reorg_depth must be positive"));
        }
        if self.slashing.inactivity_threshold_secs == 0 {
            return Err(ConfigError::invalid("slashing", "inactivity threshold must be positive"));
        }
        if self.slashing.max_inactivity_penalty_bps > 10_000 {
            return Err(ConfigError::invalid("slashing", "penalty cap exceeds 100%"));
        }
        Ok(())
    }
}

/// Complete chain configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub genesis: GenesisConfig,
    pub consensus: ConsensusConfig,
    pub mempool: MempoolConfig,
    pub block: BlockConfig,
    pub checkpoint: CheckpointConfig,
    pub tx: TxRules,
}

impl ChainConfig {
    /// Defaults everywhere; `staking_address` is the genesis validator
    pub fn new(staking_address: Address) -> Self {
        Self {
            genesis: GenesisConfig::new(staking_address),
            consensus: ConsensusConfig::default(),
            mempool: MempoolConfig::default(),
            block: BlockConfig::default(),
            checkpoint: CheckpointConfig::default(),
            tx: TxRules::default(),
        }
    }

    pub fn with_consensus(mut self, consensus: ConsensusConfig) -> Self {
        self.consensus = consensus;
        self
    }

    pub fn with_mempool(mut self, mempool: MempoolConfig) -> Self {
        self.mempool = mempool;
        self
    }

    pub fn with_block(mut self, block: BlockConfig) -> Self {
        self.block = block;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_tx_rules(mut self, tx: TxRules) -> Self {
        self.tx = tx;
        self
    }

    pub fn with_genesis_timestamp(mut self, timestamp: u64) -> Self {
        self.genesis.timestamp = timestamp;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.genesis.staking_address.is_reserved() {
            return Err(ConfigError::invalid("genesis", "staking address must be a key address"));
        }
        if self.genesis.staking_address == self.genesis.unspendable_address {
            return Err(ConfigError::invalid("genesis", "staking and unspendable addresses must differ"));
        }
        if self.genesis.staking_amount < self.consensus.min_stake {
            return Err(ConfigError::invalid(
                "genesis",
                format!(
                    "staking allocation {} is below the minimum stake {}",
                    self.genesis.staking_amount, self.consensus.min_stake
                ),
            ));
        }
        self.consensus.validate()?;
        self.mempool
            .validate()
            .map_err(|reason| ConfigError::invalid("mempool", reason))?;
        self.block
            .validate()
            .map_err(|reason| ConfigError::invalid("block", reason))?;
        self.checkpoint
            .validate()
            .map_err(|reason| ConfigError::invalid("checkpoint", reason))?;
        if self.tx.min_delegation.is_zero() {
            return Err(ConfigError::invalid("tx", "min_delegation must be positive"));
        }
        Ok(())
    }

    /// Load from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Self = serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| ConfigError::Io(e.to_string()))
    }
}
