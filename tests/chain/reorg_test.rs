use stakechain::block::Block;
use stakechain::chain::{ChainConfig, ChainManager, ConsensusConfig};
use stakechain::clock::{Clock, ManualClock};
use stakechain::consensus::{BlockVote, ForkEvidence};
use stakechain::identity::{Keypair, SigningService};
use stakechain::tx::{Amount, TxBuilder};
use stakechain::{ChainError, ConsensusError};
use std::sync::Arc;

const NOW: u64 = 1_700_000_000;

/// Two nodes sharing a genesis but producing on different clocks, so their
/// blocks at the same height differ
struct Fork {
    validator: Keypair,
    ours: ChainManager,
    ours_clock: Arc<ManualClock>,
    theirs: ChainManager,
    theirs_clock: Arc<ManualClock>,
}

impl Fork {
    fn new(max_reorg_depth: u64) -> Self {
        let validator = Keypair::generate();
        let config = ChainConfig::new(validator.address())
            .with_genesis_timestamp(NOW)
            .with_consensus(ConsensusConfig::default().with_max_reorg_depth(max_reorg_depth));
        let ours_clock = Arc::new(ManualClock::new(NOW));
        let theirs_clock = Arc::new(ManualClock::new(NOW + 5));
        let ours = ChainManager::in_memory(config.clone(), ours_clock.clone()).unwrap();
        let theirs = ChainManager::in_memory(config, theirs_clock.clone()).unwrap();
        assert_eq!(ours.tip_hash(), theirs.tip_hash());
        Self {
            validator,
            ours,
            ours_clock,
            theirs,
            theirs_clock,
        }
    }

    fn extend_ours(&self, count: usize) -> Vec<Block> {
        (0..count)
            .map(|_| {
                self.ours_clock.advance(10);
                self.ours.propose_block(&self.validator).unwrap().unwrap()
            })
            .collect()
    }

    fn extend_theirs(&self, count: usize) -> Vec<Block> {
        (0..count)
            .map(|_| {
                self.theirs_clock.advance(10);
                self.theirs.propose_block(&self.validator).unwrap().unwrap()
            })
            .collect()
    }

    /// Bring our clock level with theirs so their blocks are not in the future
    fn sync_clocks(&self) {
        self.ours_clock.set(self.theirs_clock.now());
    }
}

#[test]
fn test_reorganize_to_longer_segment() {
    let fork = Fork::new(100);
    let recipient = Keypair::generate().address();
    let tx = TxBuilder::new()
        .signer(&fork.validator)
        .recipient(recipient.clone())
        .amount(Amount::from_coins(7))
        .timestamp(NOW)
        .nonce(1)
        .build()
        .unwrap();
    let id = fork.ours.add_transaction(tx).unwrap();
    let ours = fork.extend_ours(1);
    let theirs = fork.extend_theirs(2);
    fork.sync_clocks();
    assert_eq!(fork.ours.balance(&recipient), Amount::from_coins(7));

    let outcome = fork.ours.reorganize(theirs.clone()).unwrap();

    assert_eq!(outcome.ancestor_height, 0);
    assert_eq!(outcome.reverted, vec![ours[0].hash]);
    assert_eq!(outcome.applied, vec![theirs[0].hash, theirs[1].hash]);
    assert_eq!(outcome.requeued, 1);

    assert_eq!(fork.ours.height(), 2);
    assert_eq!(fork.ours.tip_hash(), theirs[1].hash);
    assert_eq!(fork.ours.status().total_supply, fork.theirs.status().total_supply);
    assert_eq!(fork.ours.balance(&recipient), Amount::ZERO);
    assert_eq!(fork.ours.tx_height(&id), None);
    assert!(fork.ours.mempool_contains(&id));
    assert!(fork.ours.ledger().verify_integrity().is_ok());

    let head = fork.ours.store().head().unwrap().unwrap();
    assert_eq!(head.hash, theirs[1].hash);
    assert_eq!(fork.ours.store().hash_at(1).unwrap(), Some(theirs[0].hash));
    assert_eq!(fork.ours.store().balance(&recipient).unwrap(), Amount::ZERO);
    // The reverted body stays archived
    assert!(fork.ours.store().get_block(&ours[0].hash).unwrap().is_some());

    // The requeued transfer confirms on the new branch
    fork.ours_clock.advance(10);
    fork.ours.propose_block(&fork.validator).unwrap().unwrap();
    assert_eq!(fork.ours.tx_height(&id), Some(3));
}

#[test]
fn test_reorganize_from_shared_prefix() {
    let fork = Fork::new(100);
    let shared = fork.extend_theirs(1);
    fork.sync_clocks();
    fork.ours.apply_block(shared[0].clone()).unwrap();
    fork.ours_clock.advance(1);

    fork.extend_ours(1);
    let theirs = fork.extend_theirs(2);
    fork.sync_clocks();

    let outcome = fork.ours.reorganize(theirs.clone()).unwrap();

    assert_eq!(outcome.ancestor_height, 1);
    assert_eq!(outcome.reverted.len(), 1);
    assert_eq!(fork.ours.height(), 3);
    assert_eq!(fork.ours.tip_hash(), theirs[1].hash);
}

#[test]
fn test_equal_length_segment_not_heavier() {
    let fork = Fork::new(100);
    fork.extend_ours(1);
    let theirs = fork.extend_theirs(1);
    fork.sync_clocks();
    let tip = fork.ours.tip_hash();

    let result = fork.ours.reorganize(theirs);

    assert!(matches!(
        result,
        Err(ChainError::Consensus(ConsensusError::NotHeavier { current: 1, proposed: 1 }))
    ));
    assert_eq!(fork.ours.tip_hash(), tip);
}

#[test]
fn test_reorg_deeper_than_limit_rejected() {
    let fork = Fork::new(2);
    fork.extend_ours(3);
    let theirs = fork.extend_theirs(4);
    fork.sync_clocks();

    let result = fork.ours.reorganize(theirs);

    assert!(matches!(
        result,
        Err(ChainError::Consensus(ConsensusError::ReorgTooDeep { depth: 3, max: 2 }))
    ));
    assert_eq!(fork.ours.height(), 3);
}

#[test]
fn test_reorg_past_finalized_block_rejected() {
    let fork = Fork::new(100);
    let ours = fork.extend_ours(1);
    fork.ours
        .submit_vote(BlockVote::new(&fork.validator, ours[0].hash, 1, NOW))
        .unwrap();
    let theirs = fork.extend_theirs(3);
    fork.sync_clocks();

    let result = fork.ours.reorganize(theirs);

    assert!(matches!(
        result,
        Err(ChainError::Consensus(ConsensusError::FinalizedConflict { ancestor: 0, finalized: 1 }))
    ));
    assert_eq!(fork.ours.tip_hash(), ours[0].hash);
}

#[test]
fn test_malformed_segments_rejected() {
    let fork = Fork::new(100);
    fork.extend_ours(1);
    let theirs = fork.extend_theirs(3);
    fork.sync_clocks();

    assert!(matches!(
        fork.ours.reorganize(Vec::new()),
        Err(ChainError::Consensus(ConsensusError::EmptySegment))
    ));
    assert!(matches!(
        fork.ours.reorganize(vec![theirs[0].clone(), theirs[2].clone()]),
        Err(ChainError::Consensus(ConsensusError::BrokenSegment(1)))
    ));
    assert!(matches!(
        fork.ours.reorganize(theirs[1..].to_vec()),
        Err(ChainError::Consensus(ConsensusError::UnknownAncestor(_)))
    ));

    let mut wrapped = theirs[..2].to_vec();
    wrapped[0].height = u64::MAX;
    wrapped[1].height = 0;
    assert!(matches!(
        fork.ours.reorganize(wrapped),
        Err(ChainError::Consensus(ConsensusError::BrokenSegment(1)))
    ));
    assert_eq!(fork.ours.height(), 1);
}

#[test]
fn test_invalid_block_in_segment_leaves_chain_unchanged() {
    let fork = Fork::new(100);
    let ours = fork.extend_ours(1);
    let mut theirs = fork.extend_theirs(2);
    fork.sync_clocks();
    let before = fork.ours.status();

    // Re-sign block 2 with a stranger's key
    theirs[1].sign(&Keypair::generate());
    let result = fork.ours.reorganize(theirs);

    assert!(matches!(result, Err(ChainError::Block(_))));
    assert_eq!(fork.ours.status(), before);
    assert_eq!(fork.ours.tip_hash(), ours[0].hash);
    assert_eq!(fork.ours.store().head().unwrap().unwrap().hash, ours[0].hash);
}

#[test]
fn test_reorg_refused_over_slashed_delegation() {
    let fork = Fork::new(100);
    let delegator = Keypair::generate();
    let funding = TxBuilder::new()
        .signer(&fork.validator)
        .recipient(delegator.address())
        .amount(Amount::from_coins(60))
        .timestamp(NOW)
        .nonce(1)
        .build()
        .unwrap();
    fork.ours.add_transaction(funding).unwrap();
    let first = fork.extend_ours(1);
    let delegate = TxBuilder::new()
        .delegate(&delegator, fork.validator.address(), Amount::from_coins(50))
        .timestamp(fork.ours_clock.now())
        .nonce(1)
        .build()
        .unwrap();
    fork.ours.add_transaction(delegate).unwrap();
    let second = fork.extend_ours(1);
    assert_eq!(second[0].transactions.len(), 2);

    let theirs = fork.extend_theirs(3);
    fork.sync_clocks();
    let evidence = ForkEvidence {
        first: first[0].signed_header().unwrap(),
        second: theirs[0].signed_header().unwrap(),
    };
    fork.ours.report_fork(&fork.validator.address(), &evidence).unwrap();
    let before = fork.ours.status();

    let result = fork.ours.reorganize(theirs);

    assert!(matches!(
        result,
        Err(ChainError::Consensus(ConsensusError::SlashedStakeRevert { height: 2, .. }))
    ));
    assert_eq!(fork.ours.status(), before);
    assert_eq!(fork.ours.tip_hash(), second[0].hash);
    assert!(fork.ours.validator(&fork.validator.address()).is_none());
}
