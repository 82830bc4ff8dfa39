// Error taxonomy - every rejection the chain can return, classified by kind

use crate::block::{BlockError, TxRejection};
use crate::chain::{ConfigError, SnapshotError};
use crate::consensus::{FinalityError, RegistryError, SlashingError, SlashingReason};
use crate::hash::BlockHash;
use crate::identity::Address;
use crate::ledger::LedgerError;
use crate::mempool::MempoolError;
use crate::storage::StoreError;
use crate::tx::{TxError, ValidationError};
use std::fmt;
use thiserror::Error;

/// Broad class of a `ChainError`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or rule-breaking input
    Validation,
    /// Fork choice, finality and validator behavior
    Consensus,
    /// Persistence failed
    Storage,
    /// Stake below a required minimum or above what can be withdrawn
    InsufficientStake,
    /// Balance below what a transaction spends
    InsufficientFunds,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Consensus => "consensus",
            ErrorKind::Storage => "storage",
            ErrorKind::InsufficientStake => "insufficient_stake",
            ErrorKind::InsufficientFunds => "insufficient_funds",
        };
        f.write_str(name)
    }
}

/// Fork-choice and chain-level consensus failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Reorganization too deep: {depth} blocks exceeds the maximum of {max}")]
    ReorgTooDeep { depth: u64, max: u64 },

    #[error("Reorganization would revert finalized height {finalized} (common ancestor at {ancestor})")]
    FinalizedConflict { ancestor: u64, finalized: u64 },

    #[error("Competing chain of height {proposed} is not longer than the current height {current}")]
    NotHeavier { current: u64, proposed: u64 },

    #[error("Competing chain does not connect to the canonical chain at {0}")]
    UnknownAncestor(BlockHash),

    #[error("Competing segment is empty")]
    EmptySegment,

    #[error("Competing segment is not contiguous at position {0}")]
    BrokenSegment(usize),

    #[error("Block {hash} is not canonical at height {height}")]
    NotCanonical { hash: BlockHash, height: u64 },

    #[error("No checkpoint at height {0}")]
    CheckpointMissing(u64),

    #[error("Cannot restore height {height}: chain is finalized up to {finalized}")]
    BelowFinalized { height: u64, finalized: u64 },

    #[error("Validator {validator} was slashed for {reason}")]
    Slashed { validator: Address, reason: SlashingReason },

    #[error("Block {height} bonds stake of {validator}, slashed since; reverting it would refund the penalty")]
    SlashedStakeRevert { validator: Address, height: u64 },
}

/// Any error returned by the chain manager
#[derive(Error, Debug)]
pub enum ChainError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Mempool(#[from] MempoolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Finality(#[from] FinalityError),

    #[error(transparent)]
    Slashing(#[from] SlashingError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ChainError {
    /// Classify the error, looking through wrapped ledger and registry errors
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Ledger(e) => ledger_kind(e),
            ChainError::Mempool(MempoolError::Ledger(e)) => ledger_kind(e),
            ChainError::Registry(e) => registry_kind(e),
            ChainError::Slashing(SlashingError::Registry(e)) => registry_kind(e),
            ChainError::Block(BlockError::InvalidTransaction { source, .. }) => match source {
                TxRejection::Ledger(e) => ledger_kind(e),
                TxRejection::Registry(e) => registry_kind(e),
                _ => ErrorKind::Validation,
            },
            ChainError::Block(
                BlockError::ProposerMismatch { .. } | BlockError::NoValidator(_) | BlockError::InvalidSignature,
            ) => ErrorKind::Consensus,
            ChainError::Finality(_) | ChainError::Slashing(_) | ChainError::Consensus(_) => ErrorKind::Consensus,
            ChainError::Storage(_) => ErrorKind::Storage,
            ChainError::Snapshot(e) if e.is_io() => ErrorKind::Storage,
            _ => ErrorKind::Validation,
        }
    }
}

fn ledger_kind(e: &LedgerError) -> ErrorKind {
    match e {
        LedgerError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
        _ => ErrorKind::Validation,
    }
}

fn registry_kind(e: &RegistryError) -> ErrorKind {
    match e {
        RegistryError::InsufficientStake { .. }
        | RegistryError::StakeUnderflow { .. }
        | RegistryError::DelegationTooSmall { .. }
        | RegistryError::DelegationUnderflow { .. } => ErrorKind::InsufficientStake,
        RegistryError::InsufficientRewards { .. } => ErrorKind::InsufficientFunds,
        _ => ErrorKind::Consensus,
    }
}
