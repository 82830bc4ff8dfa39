use crate::block::{Block, BlockError, BlockValidator};
use crate::chain::GenesisConfig;
use crate::hash::BlockHash;
use crate::tx::{Transaction, TxData};

/// Build the genesis block: two allocations minted from the system address,
/// no proposer, previous hash zero
pub fn build_genesis_block(config: &GenesisConfig) -> Block {
    let transactions = vec![
        Transaction::genesis(
            config.unspendable_address.clone(),
            config.unspendable_amount,
            Some(config.message.clone()),
            config.timestamp,
        ),
        Transaction::genesis(
            config.staking_address.clone(),
            config.staking_amount,
            None,
            config.timestamp,
        ),
    ];
    Block::new(0, BlockHash::ZERO, transactions, config.timestamp, None)
}

/// Check that `block` is exactly the genesis block `config` describes
pub fn validate_genesis(block: &Block, config: &GenesisConfig) -> Result<(), BlockError> {
    let invalid = |reason: &str| Err(BlockError::InvalidGenesis(reason.to_string()));

    if block.height != 0 {
        return invalid("height must be 0");
    }
    if block.prev_hash != BlockHash::ZERO {
        return invalid("previous hash must be zero");
    }
    if block.proposer.is_some() || block.signature.is_some() {
        return invalid("genesis has no proposer");
    }
    BlockValidator::check_integrity(block)?;

    if block.transactions.len() != 2 {
        return invalid("genesis carries exactly two transactions");
    }
    if !block
        .transactions
        .iter()
        .all(|tx| matches!(tx.data(), TxData::Genesis { .. }) && tx.sender().is_system() && tx.fee().is_zero())
    {
        return invalid("genesis transactions must be unsigned system allocations");
    }

    let expected = build_genesis_block(config);
    let allocations = |b: &Block| -> Vec<_> {
        b.transactions
            .iter()
            .map(|tx| (tx.recipient().clone(), tx.amount()))
            .collect()
    };
    if allocations(block) != allocations(&expected) {
        return invalid("allocations differ from the configured recipients and amounts");
    }
    if block.hash != expected.hash {
        return invalid("hash differs from the configured genesis");
    }
    Ok(())
}
