use crate::block::{Block, RewardSchedule, BLOCK_VERSION};
use crate::consensus::{RegistryError, ValidatorRegistry, ValidatorSelector};
use crate::hash::{BlockHash, MerkleRoot, TxId};
use crate::identity::{Address, SignatureVerifier};
use crate::ledger::{BalanceOverlay, Ledger, LedgerError};
use crate::tx::{Amount, Transaction, TxData, TxRules, TxValidator, ValidationError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Block limits and the reward schedule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockConfig {
    /// Maximum block size in bytes
    pub max_block_size: u64,
    /// Maximum transactions per block, the reward included
    pub max_transactions: usize,
    /// How far ahead of local time a block timestamp may be
    pub future_bound_secs: u64,
    /// How far behind local time a block timestamp may be
    pub past_bound_secs: u64,
    pub rewards: RewardSchedule,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            max_block_size: 1_000_000,
            max_transactions: 100,
            future_bound_secs: 120,
            past_bound_secs: 86_400,
            rewards: RewardSchedule::default(),
        }
    }
}

impl BlockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_block_size(mut self, bytes: u64) -> Self {
        self.max_block_size = bytes;
        self
    }

    pub fn with_max_transactions(mut self, count: usize) -> Self {
        self.max_transactions = count;
        self
    }

    pub fn with_time_bounds(mut self, past_secs: u64, future_secs: u64) -> Self {
        self.past_bound_secs = past_secs;
        self.future_bound_secs = future_secs;
        self
    }

    pub fn with_rewards(mut self, rewards: RewardSchedule) -> Self {
        self.rewards = rewards;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_transactions < 1 {
            return Err("max_transactions must leave room for the reward".into());
        }
        if self.max_block_size == 0 {
            return Err("max_block_size must be positive".into());
        }
        if self.rewards.halving_interval == 0 {
            return Err("halving_interval must be positive".into());
        }
        Ok(())
    }
}

/// Why a transaction inside a block was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxRejection {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Transaction {0} is already on chain")]
    Duplicate(TxId),
}

/// Errors from block validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Unsupported block version {0}")]
    UnsupportedVersion(u32),

    #[error("Height mismatch: expected {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },

    #[error("Previous hash mismatch: expected {expected}, got {got}")]
    PrevHashMismatch { expected: BlockHash, got: BlockHash },

    #[error("Timestamp {timestamp} outside [{earliest}, {latest}]")]
    TimestampOutOfRange { timestamp: u64, earliest: u64, latest: u64 },

    #[error("Block too large: {size} bytes exceeds {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("Too many transactions: {count} exceeds {max}")]
    TooManyTransactions { count: usize, max: usize },

    #[error("Merkle root mismatch: computed {computed}, block says {stored}")]
    MerkleMismatch { computed: MerkleRoot, stored: MerkleRoot },

    #[error("Hash mismatch: computed {computed}, block says {stored}")]
    HashMismatch { computed: BlockHash, stored: BlockHash },

    #[error("Size mismatch: computed {computed}, block says {stored}")]
    SizeMismatch { computed: u64, stored: u64 },

    #[error("Block has no mining reward")]
    MissingReward,

    #[error("Block has {0} mining rewards, expected exactly one")]
    MultipleRewards(usize),

    #[error("Reward mismatch: expected {expected}, got {got}")]
    RewardMismatch { expected: Amount, got: Amount },

    #[error("Reward paid to {got}, proposer is {expected}")]
    RewardRecipient { expected: Address, got: Address },

    #[error("Block has no proposer")]
    MissingProposer,

    #[error("proposer mismatch: expected {expected}, got {got}")]
    ProposerMismatch { expected: Address, got: Address },

    #[error("No eligible validator for height {0}")]
    NoValidator(u64),

    #[error("Missing or invalid proposer signature")]
    InvalidSignature,

    #[error("Transaction {index} rejected: {source}")]
    InvalidTransaction { index: usize, source: TxRejection },

    #[error("Invalid genesis block: {0}")]
    InvalidGenesis(String),
}

/// The chain as seen by block validation
pub struct ValidationContext<'a> {
    /// Height the next block must have
    pub height: u64,
    /// Hash the next block must point to
    pub tip: BlockHash,
    pub ledger: &'a Ledger,
    pub registry: &'a ValidatorRegistry,
    pub selector: &'a ValidatorSelector,
    pub verifier: &'a dyn SignatureVerifier,
    pub tx_rules: &'a TxRules,
    pub now: u64,
    pub is_confirmed: &'a dyn Fn(&TxId) -> bool,
}

/// Validator for non-genesis blocks
pub struct BlockValidator;

impl BlockValidator {
    /// Check a block against the chain tip without changing any state
    ///
    /// This performs:
    /// - Version, height and parent hash checks
    /// - Timestamp window, size and transaction count limits
    /// - Merkle root, hash and size recomputation
    /// - Exactly one mining reward of the scheduled amount, paid to the proposer
    /// - Proposer selection and signature
    /// - A dry run of every transaction against the ledger and the registry
    pub fn validate(block: &Block, config: &BlockConfig, ctx: &ValidationContext<'_>) -> Result<(), BlockError> {
        Self::validate_header(block, config, ctx)?;
        Self::validate_reward(block, config)?;
        Self::validate_proposer(block, ctx)?;
        Self::dry_run(block, ctx)
    }

    /// Shape checks that need no chain state beyond the tip
    pub fn validate_header(block: &Block, config: &BlockConfig, ctx: &ValidationContext<'_>) -> Result<(), BlockError> {
        if block.version != BLOCK_VERSION {
            return Err(BlockError::UnsupportedVersion(block.version));
        }
        if block.height != ctx.height || block.is_genesis() {
            return Err(BlockError::HeightMismatch {
                expected: ctx.height,
                got: block.height,
            });
        }
        if block.prev_hash != ctx.tip {
            return Err(BlockError::PrevHashMismatch {
                expected: ctx.tip,
                got: block.prev_hash,
            });
        }

        let earliest = ctx.now.saturating_sub(config.past_bound_secs);
        let latest = ctx.now.saturating_add(config.future_bound_secs);
        if block.timestamp < earliest || block.timestamp > latest {
            return Err(BlockError::TimestampOutOfRange {
                timestamp: block.timestamp,
                earliest,
                latest,
            });
        }

        Self::check_integrity(block)?;

        if block.size > config.max_block_size {
            return Err(BlockError::TooLarge {
                size: block.size,
                max: config.max_block_size,
            });
        }
        if block.transactions.len() > config.max_transactions {
            return Err(BlockError::TooManyTransactions {
                count: block.transactions.len(),
                max: config.max_transactions,
            });
        }
        Ok(())
    }

    /// Recompute merkle root, hash and size
    pub fn check_integrity(block: &Block) -> Result<(), BlockError> {
        let merkle = block.compute_merkle_root();
        if merkle != block.merkle_root {
            return Err(BlockError::MerkleMismatch {
                computed: merkle,
                stored: block.merkle_root,
            });
        }
        let hash = block.compute_hash();
        if hash != block.hash {
            return Err(BlockError::HashMismatch {
                computed: hash,
                stored: block.hash,
            });
        }
        let size = block.compute_size();
        if size != block.size {
            return Err(BlockError::SizeMismatch {
                computed: size,
                stored: block.size,
            });
        }
        Ok(())
    }

    fn validate_reward(block: &Block, config: &BlockConfig) -> Result<(), BlockError> {
        let rewards: Vec<&Transaction> = block.rewards().collect();
        let reward = match rewards.as_slice() {
            [] => return Err(BlockError::MissingReward),
            [reward] => *reward,
            many => return Err(BlockError::MultipleRewards(many.len())),
        };

        let expected = config.rewards.reward_at(block.height);
        if reward.amount() != expected {
            return Err(BlockError::RewardMismatch {
                expected,
                got: reward.amount(),
            });
        }
        if let Some(proposer) = &block.proposer {
            if reward.recipient() != proposer {
                return Err(BlockError::RewardRecipient {
                    expected: proposer.clone(),
                    got: reward.recipient().clone(),
                });
            }
        }
        Ok(())
    }

    fn validate_proposer(block: &Block, ctx: &ValidationContext<'_>) -> Result<(), BlockError> {
        let proposer = block.proposer.as_ref().ok_or(BlockError::MissingProposer)?;
        let expected = ctx
            .selector
            .select(ctx.registry, block.height, &block.prev_hash, block.timestamp)
            .ok_or(BlockError::NoValidator(block.height))?;
        if proposer != &expected {
            return Err(BlockError::ProposerMismatch {
                expected,
                got: proposer.clone(),
            });
        }
        if !block.verify_signature(ctx.verifier) {
            return Err(BlockError::InvalidSignature);
        }
        Ok(())
    }

    /// Apply every transaction to a balance overlay and a registry copy, in
    /// block order, so later transactions see the effects of earlier ones
    fn dry_run(block: &Block, ctx: &ValidationContext<'_>) -> Result<(), BlockError> {
        let mut overlay = ctx.ledger.overlay();
        let mut registry = ctx.registry.clone();

        for (index, tx) in block.transactions.iter().enumerate() {
            Self::dry_run_tx(tx, block, ctx, &mut overlay, &mut registry)
                .map_err(|source| BlockError::InvalidTransaction { index, source })?;
        }
        Ok(())
    }

    fn dry_run_tx(
        tx: &Transaction,
        block: &Block,
        ctx: &ValidationContext<'_>,
        overlay: &mut BalanceOverlay<'_>,
        registry: &mut ValidatorRegistry,
    ) -> Result<(), TxRejection> {
        let id = tx.id();
        if (ctx.is_confirmed)(&id) {
            return Err(TxRejection::Duplicate(id));
        }
        match tx.data() {
            TxData::MiningReward => {
                TxValidator::validate_structure(tx, ctx.tx_rules)?;
                TxValidator::verify_signature(tx, ctx.verifier)?;
            }
            TxData::Genesis { .. } => {
                return Err(ValidationError::SystemTransaction(tx.kind()).into());
            }
            _ => TxValidator::validate(tx, ctx.verifier, ctx.tx_rules, ctx.now, None)?,
        }
        overlay.apply(tx)?;
        registry.apply_transaction(tx, block.timestamp)?;
        Ok(())
    }
}
