use stakechain::block::{Block, BlockError, RewardSchedule};
use stakechain::chain::{ChainConfig, ChainManager, CheckpointConfig, ConsensusConfig};
use stakechain::clock::{Clock, ManualClock};
use stakechain::consensus::{
    BlockVote, FinalityError, ForkEvidence, RegistryError, SlashingError, SlashingReason, VoteOutcome,
};
use stakechain::identity::{Address, Ed25519Verifier, Keypair, SigningService};
use stakechain::mempool::MempoolError;
use stakechain::storage::{BatchOp, KvStore, MemoryStore, StoreError};
use stakechain::tx::{Amount, Transaction, TxBuilder};
use stakechain::{ChainError, ConsensusError, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const NOW: u64 = 1_700_000_000;
const DAY: u64 = 86_400;

struct Node {
    chain: ChainManager,
    clock: Arc<ManualClock>,
    validator: Keypair,
}

impl Node {
    fn new() -> Self {
        Self::with_config(|config| config)
    }

    fn with_config(customize: impl FnOnce(ChainConfig) -> ChainConfig) -> Self {
        let validator = Keypair::generate();
        let config = customize(ChainConfig::new(validator.address()).with_genesis_timestamp(NOW));
        let clock = Arc::new(ManualClock::new(NOW));
        let chain = ChainManager::in_memory(config, clock.clone()).unwrap();
        Self {
            chain,
            clock,
            validator,
        }
    }

    /// Advance the clock and let the selected proposer among `extra` and the
    /// genesis validator produce the next block
    fn produce_with(&self, extra: &[&Keypair]) -> Block {
        self.clock.advance(10);
        for key in std::iter::once(&self.validator).chain(extra.iter().copied()) {
            if let Some(block) = self.chain.propose_block(key).unwrap() {
                return block;
            }
        }
        panic!("no proposer selected at height {}", self.chain.height() + 1);
    }

    fn produce(&self) -> Block {
        self.produce_with(&[])
    }

    fn transfer(&self, from: &Keypair, to: &Address, amount: Amount, nonce: u64) -> Transaction {
        TxBuilder::new()
            .signer(from)
            .recipient(to.clone())
            .amount(amount)
            .fee(Amount::parse("0.0001").unwrap())
            .timestamp(self.clock.now())
            .nonce(nonce)
            .build()
            .unwrap()
    }

    fn vote(&self, block: &Block) -> Result<VoteOutcome, ChainError> {
        self.chain
            .submit_vote(BlockVote::new(&self.validator, block.hash, block.height, self.clock.now()))
    }
}

// ============================================================================
// GENESIS
// ============================================================================

#[test]
fn test_genesis_state() {
    let node = Node::new();
    let status = node.chain.status();

    assert_eq!(status.height, 0);
    assert_eq!(status.finalized_height, 0);
    assert_eq!(status.total_supply, Amount::from_coins(200));
    assert_eq!(status.circulating_supply, Amount::from_coins(150));
    assert_eq!(status.validators, 1);
    assert_eq!(status.active_validators, 1);
    assert_eq!(status.total_active_stake, Amount::from_coins(150));
    assert_eq!(node.chain.balance(&node.validator.address()), Amount::from_coins(150));
    assert_eq!(node.chain.balance(&Address::unspendable()), Amount::from_coins(50));
    assert!(node.chain.is_finalized(&node.chain.tip_hash()));
    assert_eq!(node.chain.expected_proposer(), Some(node.validator.address()));
}

#[test]
fn test_invalid_config_rejected() {
    let validator = Keypair::generate();
    let config = ChainConfig::new(validator.address())
        .with_consensus(ConsensusConfig::default().with_finality_threshold_bps(0));

    let result = ChainManager::in_memory(config, Arc::new(ManualClock::new(NOW)));

    assert!(matches!(result, Err(ChainError::Config(_))));
}

// ============================================================================
// TRANSACTIONS AND BLOCKS
// ============================================================================

#[test]
fn test_basic_transfer_through_block() {
    let node = Node::new();
    let recipient = Keypair::generate().address();
    let tx = node.transfer(&node.validator, &recipient, Amount::from_coins(10), 1);

    let id = node.chain.add_transaction(tx).unwrap();
    assert!(node.chain.mempool_contains(&id));

    let block = node.produce();

    assert_eq!(block.height, 1);
    assert_eq!(block.transactions.len(), 2);
    assert_eq!(node.chain.tx_height(&id), Some(1));
    assert_eq!(node.chain.mempool_len(), 0);
    assert_eq!(node.chain.balance(&recipient), Amount::from_coins(10));
    // 150 - 10 - 0.0001 + 50 reward
    assert_eq!(
        node.chain.balance(&node.validator.address()),
        Amount::parse("189.9999").unwrap()
    );
    assert_eq!(node.chain.balance(&Address::escrow()), Amount::parse("0.0001").unwrap());
    assert_eq!(node.chain.status().total_supply, Amount::from_coins(250));

    let validator = node.chain.validator(&node.validator.address()).unwrap();
    assert_eq!(validator.unclaimed_rewards, Amount::parse("0.0001").unwrap());
    assert_eq!(validator.last_selected_height, Some(1));
    assert_eq!(validator.stats.blocks_proposed, 1);

    assert_eq!(node.chain.store().balance(&recipient).unwrap(), Amount::from_coins(10));
    assert_eq!(node.chain.store().head().unwrap().map(|h| h.hash), Some(block.hash));
    assert!(node.chain.ledger().verify_integrity().is_ok());
}

#[test]
fn test_duplicate_and_confirmed_transactions_rejected() {
    let node = Node::new();
    let tx = node.transfer(&node.validator, &Keypair::generate().address(), Amount::from_coins(1), 1);

    node.chain.add_transaction(tx.clone()).unwrap();
    assert!(matches!(
        node.chain.add_transaction(tx.clone()),
        Err(ChainError::Mempool(MempoolError::Duplicate(_)))
    ));

    node.produce();
    assert!(matches!(
        node.chain.add_transaction(tx),
        Err(ChainError::Mempool(MempoolError::AlreadyConfirmed(_)))
    ));
}

#[test]
fn test_overdraft_classified_as_insufficient_funds() {
    let node = Node::new();
    let tx = node.transfer(&node.validator, &Keypair::generate().address(), Amount::from_coins(151), 1);

    let err = node.chain.add_transaction(tx).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
}

#[test]
fn test_only_selected_validator_builds() {
    let node = Node::new();
    let outsider = Keypair::generate();

    assert!(node.chain.build_block(&outsider).unwrap().is_none());
    assert!(node.chain.propose_block(&outsider).unwrap().is_none());
    assert_eq!(node.chain.height(), 0);
}

#[test]
fn test_invalid_block_leaves_chain_unchanged() {
    let node = Node::new();
    let before = node.chain.status();
    let mut block = node.chain.build_block(&node.validator).unwrap().unwrap();
    block.timestamp += 1;

    let result = node.chain.apply_block(block);

    assert!(matches!(result, Err(ChainError::Block(BlockError::HashMismatch { .. }))));
    assert_eq!(node.chain.status(), before);
}

#[test]
fn test_block_reward_halves() {
    let node = Node::with_config(|config| {
        let block = config.block.clone().with_rewards(RewardSchedule::new(Amount::from_coins(50), 2));
        config.with_block(block)
    });

    let rewards: Vec<Amount> = (0..4)
        .map(|_| node.produce().rewards().next().unwrap().amount())
        .collect();

    assert_eq!(
        rewards,
        vec![
            Amount::from_coins(50),
            Amount::from_coins(25),
            Amount::from_coins(25),
            Amount::parse("12.5").unwrap(),
        ]
    );
    assert_eq!(node.chain.status().total_supply, Amount::parse("312.5").unwrap());
}

// ============================================================================
// STAKING
// ============================================================================

#[test]
fn test_new_validator_joins_through_stake() {
    let node = Node::new();
    let newcomer = Keypair::generate();
    node.chain
        .add_transaction(node.transfer(&node.validator, &newcomer.address(), Amount::from_coins(120), 1))
        .unwrap();
    node.produce();

    let stake = TxBuilder::new()
        .stake(&newcomer, Amount::from_coins(100))
        .timestamp(node.clock.now())
        .nonce(2)
        .build()
        .unwrap();
    node.chain.add_transaction(stake).unwrap();
    node.produce_with(&[&newcomer]);

    let joined = node.chain.validator(&newcomer.address()).unwrap();
    assert_eq!(joined.stake, Amount::from_coins(100));
    assert!(joined.active);
    assert_eq!(node.chain.status().validators, 2);
    assert_eq!(node.chain.balance(&newcomer.address()), Amount::parse("19.9999").unwrap());

    // Both validators keep producing
    for _ in 0..6 {
        node.produce_with(&[&newcomer]);
    }
    assert_eq!(node.chain.height(), 8);
}

#[test]
fn test_stake_below_minimum_rejected() {
    let node = Node::new();
    let newcomer = Keypair::generate();
    node.chain
        .add_transaction(node.transfer(&node.validator, &newcomer.address(), Amount::from_coins(60), 1))
        .unwrap();
    node.produce();

    let stake = TxBuilder::new()
        .stake(&newcomer, Amount::from_coins(50))
        .timestamp(node.clock.now())
        .nonce(2)
        .build()
        .unwrap();
    let err = node.chain.add_transaction(stake).unwrap_err();

    assert!(matches!(err, ChainError::Registry(RegistryError::InsufficientStake { .. })));
    assert_eq!(err.kind(), ErrorKind::InsufficientStake);
}

#[test]
fn test_genesis_stake_cannot_be_unstaked() {
    let node = Node::new();
    let unstake = TxBuilder::new()
        .unstake(&node.validator, Amount::from_coins(10))
        .timestamp(NOW)
        .nonce(1)
        .build()
        .unwrap();

    let err = node.chain.add_transaction(unstake).unwrap_err();

    assert!(matches!(err, ChainError::Registry(RegistryError::StakeUnderflow { .. })));
}

// ============================================================================
// FINALITY
// ============================================================================

#[test]
fn test_vote_finalizes_block() {
    let node = Node::new();
    let block = node.produce();

    let outcome = node.vote(&block).unwrap();

    assert_eq!(
        outcome,
        VoteOutcome::Finalized {
            block_hash: block.hash,
            height: 1,
        }
    );
    assert_eq!(node.chain.latest_finalized_height(), 1);
    assert!(node.chain.is_finalized(&block.hash));
    assert_eq!(
        node.chain.validator(&node.validator.address()).unwrap().stats.blocks_signed,
        1
    );
}

#[test]
fn test_finalized_height_is_monotonic() {
    let node = Node::new();
    let first = node.produce();
    let second = node.produce();

    node.vote(&second).unwrap();
    node.vote(&first).unwrap();

    assert_eq!(node.chain.latest_finalized_height(), 2);
}

#[test]
fn test_vote_for_unknown_block_rejected() {
    let node = Node::new();
    node.produce();
    let stranger = stakechain::hash::BlockHash::digest(b"not on chain");

    let result = node
        .chain
        .submit_vote(BlockVote::new(&node.validator, stranger, 5, NOW));

    assert!(matches!(result, Err(ChainError::Consensus(ConsensusError::NotCanonical { .. }))));
}

#[test]
fn test_forged_vote_rejected() {
    let node = Node::new();
    let block = node.produce();
    let mut vote = BlockVote::new(&Keypair::generate(), block.hash, 1, NOW);
    vote.validator = node.validator.address();

    let result = node.chain.submit_vote(vote);

    assert!(matches!(result, Err(ChainError::Finality(FinalityError::InvalidSignature(_)))));
}

#[test]
fn test_votes_beyond_reorg_window_rejected_untracked() {
    let node = Node::new();
    let block = node.produce();
    let stranger = Keypair::generate();
    let far = node.chain.height() + node.chain.config().consensus.max_reorg_depth + 1;

    for voter in [&stranger, &node.validator] {
        let result = node
            .chain
            .submit_vote(BlockVote::new(voter, block.hash, far, node.clock.now()));
        assert!(matches!(
            result,
            Err(ChainError::Consensus(ConsensusError::NotCanonical { .. }))
        ));
    }
    let result = node
        .chain
        .submit_vote(BlockVote::new(&stranger, block.hash, block.height, node.clock.now()));
    assert!(matches!(
        result,
        Err(ChainError::Finality(FinalityError::InactiveValidator(_)))
    ));

    assert_eq!(node.chain.export_state().slashing.tracked_votes(), 0);
    assert!(node.chain.slashing_history(&node.validator.address()).is_empty());
}

#[test]
fn test_double_vote_slashes_validator() {
    let node = Node::new();
    let block = node.produce();
    node.vote(&block).unwrap();

    let conflicting = BlockVote::new(
        &node.validator,
        stakechain::hash::BlockHash::digest(b"other block"),
        block.height,
        node.clock.now(),
    );
    let result = node.chain.submit_vote(conflicting);

    assert!(matches!(
        result,
        Err(ChainError::Consensus(ConsensusError::Slashed {
            reason: SlashingReason::DoubleSigning,
            ..
        }))
    ));
    assert!(node.chain.validator(&node.validator.address()).is_none());
    let history = node.chain.slashing_history(&node.validator.address());
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].penalty, Amount::from_coins(150));
    assert_eq!(node.chain.status().total_active_stake, Amount::ZERO);
}

// ============================================================================
// SLASHING AND JAIL
// ============================================================================

#[test]
fn test_inactive_validator_jailed_then_released() {
    let node = Node::new();
    node.produce();

    node.clock.advance(2 * DAY);
    let events = node.chain.check_inactivity().unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, SlashingReason::Inactivity);
    let jailed = node.chain.validator(&node.validator.address()).unwrap();
    assert!(jailed.stake < Amount::from_coins(150));
    assert!(node.chain.build_block(&node.validator).unwrap().is_none());

    assert!(matches!(
        node.chain.unjail(&node.validator.address()),
        Err(ChainError::Registry(RegistryError::StillJailed { .. }))
    ));
    node.clock.advance(DAY);
    node.chain.unjail(&node.validator.address()).unwrap();
    node.produce();
}

#[test]
fn test_fork_report_slashes_proposer() {
    let node = Node::new();
    node.clock.advance(10);
    let first = node.chain.build_block(&node.validator).unwrap().unwrap();
    let mut second = Block::new(
        first.height,
        first.prev_hash,
        first.transactions.clone(),
        first.timestamp + 1,
        first.proposer.clone(),
    );
    second.sign(&node.validator);
    let evidence = ForkEvidence {
        first: first.signed_header().unwrap(),
        second: second.signed_header().unwrap(),
    };

    let event = node.chain.report_fork(&node.validator.address(), &evidence).unwrap();

    assert_eq!(event.reason, SlashingReason::MaliciousFork);
    assert!(event.removed);
    assert!(node.chain.expected_proposer().is_none());
}

// ============================================================================
// EXPIRY
// ============================================================================

#[test]
fn test_expire_drops_stale_transactions() {
    let node = Node::new();
    let tx = node.transfer(&node.validator, &Keypair::generate().address(), Amount::from_coins(1), 1);
    let id = node.chain.add_transaction(tx).unwrap();

    node.clock.advance(72 * 3600 + 1);
    let report = node.chain.expire();

    assert_eq!(report.transactions, vec![id]);
    assert_eq!(node.chain.mempool_len(), 0);
}

// ============================================================================
// CHECKPOINTS AND PRUNING
// ============================================================================

fn checkpointing_node() -> Node {
    Node::with_config(|config| config.with_checkpoint(CheckpointConfig::default().with_interval(2)))
}

#[test]
fn test_checkpoint_taken_on_interval() {
    let node = checkpointing_node();
    for _ in 0..5 {
        node.produce();
    }

    assert_eq!(node.chain.checkpoint_heights(), vec![2, 4]);
    assert_eq!(node.chain.store().checkpoint_heights().unwrap(), vec![2, 4]);
}

#[test]
fn test_restore_checkpoint_requeues_transactions() {
    let node = checkpointing_node();
    node.produce();
    node.produce();
    let at_checkpoint = node.chain.status();

    let recipient = Keypair::generate().address();
    let tx = node.transfer(&node.validator, &recipient, Amount::from_coins(5), 1);
    let id = node.chain.add_transaction(tx).unwrap();
    node.produce();
    node.produce();
    assert_eq!(node.chain.balance(&recipient), Amount::from_coins(5));

    node.chain.restore_checkpoint(2).unwrap();

    assert_eq!(node.chain.height(), 2);
    assert_eq!(node.chain.tip_hash(), at_checkpoint.tip);
    assert_eq!(node.chain.balance(&recipient), Amount::ZERO);
    assert_eq!(node.chain.tx_height(&id), None);
    assert!(node.chain.mempool_contains(&id));
    assert_eq!(node.chain.checkpoint_heights(), vec![2]);
    assert_eq!(node.chain.store().hash_at(3).unwrap(), None);
    assert_eq!(node.chain.store().balance(&recipient).unwrap(), Amount::ZERO);

    // The chain continues from the checkpoint
    node.produce();
    assert_eq!(node.chain.tx_height(&id), Some(3));
}

#[test]
fn test_restore_below_finality_rejected() {
    let node = checkpointing_node();
    node.produce();
    node.produce();
    let third = node.produce();
    node.vote(&third).unwrap();

    assert!(matches!(
        node.chain.restore_checkpoint(2),
        Err(ChainError::Consensus(ConsensusError::BelowFinalized { height: 2, finalized: 3 }))
    ));
}

#[test]
fn test_restore_missing_checkpoint_rejected() {
    let node = checkpointing_node();
    node.produce();
    node.produce();
    node.produce();

    assert!(matches!(
        node.chain.restore_checkpoint(3),
        Err(ChainError::Consensus(ConsensusError::CheckpointMissing(3)))
    ));
}

#[test]
fn test_manual_checkpoint() {
    let node = Node::new();
    node.produce();

    assert_eq!(node.chain.create_checkpoint().unwrap(), 1);
    assert_eq!(node.chain.checkpoint_heights(), vec![1]);
}

#[test]
fn test_prune_store_keeps_reorg_window() {
    let node = Node::with_config(|config| {
        let consensus = config.consensus.clone().with_max_reorg_depth(2);
        config.with_consensus(consensus)
    });
    for _ in 0..5 {
        node.produce();
    }

    let pruned = node.chain.prune_store(0).unwrap();

    assert_eq!(pruned, 2);
    assert!(node.chain.store().get_block_at(0).unwrap().is_some());
    assert!(node.chain.store().get_block_at(1).unwrap().is_none());
    assert!(node.chain.store().get_block_at(3).unwrap().is_some());
    // The in-memory chain is unaffected
    assert_eq!(node.chain.block_at(1).map(|b| b.height), Some(1));
}

#[test]
fn test_checkpoint_verified_once_finalized() {
    let node = Node::new();
    let block = node.produce();

    node.chain.create_checkpoint().unwrap();
    assert!(!node.chain.checkpoint(1).unwrap().verified);
    assert!(!node.chain.store().load_checkpoint(1).unwrap().unwrap().verified);

    node.vote(&block).unwrap();

    assert!(node.chain.checkpoint(1).unwrap().verified);
    assert!(node.chain.store().load_checkpoint(1).unwrap().unwrap().verified);
    // Taken at a finalized tip, a checkpoint starts out verified
    node.chain.create_checkpoint().unwrap();
    assert!(node.chain.checkpoint(1).unwrap().verified);
}

#[test]
fn test_restore_keeps_double_sign_penalty() {
    let node = Node::new();
    let first = node.produce();
    node.chain.create_checkpoint().unwrap();
    node.vote(&first).unwrap();
    node.produce();

    let conflicting = BlockVote::new(
        &node.validator,
        stakechain::hash::BlockHash::digest(b"other block"),
        first.height,
        node.clock.now(),
    );
    assert!(node.chain.submit_vote(conflicting).is_err());
    assert!(node.chain.validator(&node.validator.address()).is_none());

    node.chain.restore_checkpoint(1).unwrap();

    assert_eq!(node.chain.height(), 1);
    assert!(node.chain.validator(&node.validator.address()).is_none());
    assert_eq!(node.chain.status().total_active_stake, Amount::ZERO);
    assert_eq!(node.chain.slashing_history(&node.validator.address()).len(), 1);
}

#[test]
fn test_restore_refused_when_penalty_exceeds_checkpoint_stake() {
    let node = Node::new();
    let delegator = Keypair::generate();
    node.chain
        .add_transaction(node.transfer(&node.validator, &delegator.address(), Amount::from_coins(60), 1))
        .unwrap();
    node.produce();
    node.chain.create_checkpoint().unwrap();

    let delegate = TxBuilder::new()
        .delegate(&delegator, node.validator.address(), Amount::from_coins(50))
        .timestamp(node.clock.now())
        .nonce(1)
        .build()
        .unwrap();
    node.chain.add_transaction(delegate).unwrap();
    node.produce();

    node.clock.advance(10);
    let first = node.chain.build_block(&node.validator).unwrap().unwrap();
    let mut second = Block::new(
        first.height,
        first.prev_hash,
        first.transactions.clone(),
        first.timestamp + 1,
        first.proposer.clone(),
    );
    second.sign(&node.validator);
    let evidence = ForkEvidence {
        first: first.signed_header().unwrap(),
        second: second.signed_header().unwrap(),
    };
    let event = node.chain.report_fork(&node.validator.address(), &evidence).unwrap();
    assert_eq!(event.penalty, Amount::from_coins(200));
    let before = node.chain.status();

    let result = node.chain.restore_checkpoint(1);

    assert!(matches!(
        result,
        Err(ChainError::Slashing(SlashingError::PenaltyNotCovered { .. }))
    ));
    assert_eq!(node.chain.status(), before);
    assert_eq!(node.chain.height(), 2);
    assert!(node.chain.validator(&node.validator.address()).is_none());
}

/// Memory store whose deletes can be made to fail
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_deletes: Arc<AtomicBool>,
}

impl KvStore for FlakyStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.inner.put(key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("disk unavailable".into()));
        }
        self.inner.delete(key)
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        self.inner.batch(ops)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.inner.scan_prefix(prefix)
    }
}

#[test]
fn test_failed_restore_leaves_chain_unchanged() {
    let validator = Keypair::generate();
    let clock = Arc::new(ManualClock::new(NOW));
    let store = FlakyStore::default();
    let fail_deletes = store.fail_deletes.clone();
    let config = ChainConfig::new(validator.address())
        .with_genesis_timestamp(NOW)
        .with_checkpoint(CheckpointConfig::default().with_interval(2));
    let chain = ChainManager::new(config, store, Arc::new(Ed25519Verifier), clock.clone()).unwrap();
    for _ in 0..4 {
        clock.advance(10);
        chain.propose_block(&validator).unwrap().unwrap();
    }
    let before = chain.status();

    fail_deletes.store(true, Ordering::SeqCst);
    let result = chain.restore_checkpoint(2);

    assert!(matches!(result, Err(ChainError::Storage(_))));
    assert_eq!(chain.status(), before);
    assert_eq!(chain.height(), 4);
    assert_eq!(chain.checkpoint_heights(), vec![2, 4]);
    assert_eq!(chain.store().head().unwrap().unwrap().height, 4);

    fail_deletes.store(false, Ordering::SeqCst);
    chain.restore_checkpoint(2).unwrap();
    assert_eq!(chain.height(), 2);
    assert_eq!(chain.store().head().unwrap().unwrap().height, 2);
}
