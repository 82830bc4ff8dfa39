use crate::consensus::ValidatorRegistry;
use crate::hash::BlockHash;
use crate::identity::{Address, Signature, SignatureVerifier, SigningService};
use crate::tx::Amount;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info};

const VOTE_DOMAIN: &[u8] = b"stakechain:vote:v1";

/// Errors from vote submission
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FinalityError {
    #[error("Validator {0} is not active")]
    InactiveValidator(Address),

    #[error("Block {0} is already finalized")]
    AlreadyFinalized(BlockHash),

    #[error("Invalid vote signature from {0}")]
    InvalidSignature(Address),
}

/// A validator's signed vote for a block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVote {
    pub validator: Address,
    pub block_hash: BlockHash,
    pub height: u64,
    pub timestamp: u64,
    pub signature: Signature,
}

impl BlockVote {
    /// Bytes a vote signature covers
    pub fn signing_bytes(block_hash: &BlockHash, height: u64, timestamp: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(VOTE_DOMAIN.len() + 48);
        bytes.extend_from_slice(VOTE_DOMAIN);
        bytes.extend_from_slice(block_hash.as_bytes());
        bytes.extend_from_slice(&height.to_le_bytes());
        bytes.extend_from_slice(&timestamp.to_le_bytes());
        bytes
    }

    /// Create and sign a vote
    pub fn new(signer: &dyn SigningService, block_hash: BlockHash, height: u64, timestamp: u64) -> Self {
        let signature = signer.sign(&Self::signing_bytes(&block_hash, height, timestamp));
        Self {
            validator: signer.address(),
            block_hash,
            height,
            timestamp,
            signature,
        }
    }

    pub fn verify(&self, verifier: &dyn SignatureVerifier) -> bool {
        match self.validator.public_key() {
            Ok(public_key) => verifier.verify(
                &Self::signing_bytes(&self.block_hash, self.height, self.timestamp),
                &self.signature,
                &public_key,
            ),
            Err(_) => false,
        }
    }
}

/// Result of an accepted vote
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Vote recorded, threshold not reached yet
    Pending { voted_stake: Amount, total_stake: Amount },
    /// This vote pushed the block over the threshold
    Finalized { block_hash: BlockHash, height: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct PendingVote {
    vote: BlockVote,
    received_at: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PendingBlock {
    height: u64,
    votes: BTreeMap<Address, PendingVote>,
}

/// Stake-weighted finality gadget.
///
/// A block hash is pending until the non-expired votes behind it carry at
/// least `threshold_bps / 10_000` of the total active stake, then finalized
/// for good.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalizer {
    threshold_bps: u64,
    vote_timeout_secs: u64,
    pending: HashMap<BlockHash, PendingBlock>,
    finalized: BTreeMap<u64, BlockHash>,
    finalized_hashes: HashSet<BlockHash>,
    latest_finalized_height: u64,
}

impl Finalizer {
    pub fn new(threshold_bps: u64, vote_timeout_secs: u64) -> Self {
        Self {
            threshold_bps,
            vote_timeout_secs,
            pending: HashMap::new(),
            finalized: BTreeMap::new(),
            finalized_hashes: HashSet::new(),
            latest_finalized_height: 0,
        }
    }

    pub fn latest_finalized_height(&self) -> u64 {
        self.latest_finalized_height
    }

    pub fn is_finalized(&self, hash: &BlockHash) -> bool {
        self.finalized_hashes.contains(hash)
    }

    pub fn finalized_hash(&self, height: u64) -> Option<&BlockHash> {
        self.finalized.get(&height)
    }

    /// Number of votes currently held for `hash`
    pub fn vote_count(&self, hash: &BlockHash) -> usize {
        self.pending.get(hash).map_or(0, |p| p.votes.len())
    }

    pub fn pending_blocks(&self) -> usize {
        self.pending.len()
    }

    /// Mark a block final without votes (the genesis block)
    pub fn mark_finalized(&mut self, hash: BlockHash, height: u64) {
        self.pending.remove(&hash);
        self.finalized.insert(height, hash);
        self.finalized_hashes.insert(hash);
        self.latest_finalized_height = self.latest_finalized_height.max(height);
    }

    /// Record a vote and finalize the block when the stake threshold is met.
    /// A repeated vote from the same validator replaces the earlier one.
    pub fn submit_vote(
        &mut self,
        vote: BlockVote,
        registry: &ValidatorRegistry,
        now: u64,
    ) -> Result<VoteOutcome, FinalityError> {
        if !registry.is_active(&vote.validator, now) {
            return Err(FinalityError::InactiveValidator(vote.validator.clone()));
        }
        if self.is_finalized(&vote.block_hash) {
            return Err(FinalityError::AlreadyFinalized(vote.block_hash));
        }

        let hash = vote.block_hash;
        let height = vote.height;
        let pending = self.pending.entry(hash).or_insert_with(|| PendingBlock {
            height,
            votes: BTreeMap::new(),
        });
        pending.votes.insert(
            vote.validator.clone(),
            PendingVote {
                vote,
                received_at: now,
            },
        );

        let voted_stake = self.voted_stake(&hash, registry, now);
        let total_stake = registry.total_active_stake(now);
        debug!(block = %hash.short(), voted = %voted_stake, total = %total_stake, "vote recorded");

        if self.meets_threshold(voted_stake, total_stake) {
            self.mark_finalized(hash, height);
            self.collect_expired(now);
            info!(block = %hash.short(), height, "block finalized");
            return Ok(VoteOutcome::Finalized {
                block_hash: hash,
                height,
            });
        }

        Ok(VoteOutcome::Pending {
            voted_stake,
            total_stake,
        })
    }

    /// Stake behind the unexpired votes of active validators for `hash`
    pub fn voted_stake(&self, hash: &BlockHash, registry: &ValidatorRegistry, now: u64) -> Amount {
        let Some(pending) = self.pending.get(hash) else {
            return Amount::ZERO;
        };
        pending
            .votes
            .values()
            .filter(|p| p.received_at.saturating_add(self.vote_timeout_secs) >= now)
            .filter_map(|p| registry.get(&p.vote.validator))
            .filter(|v| v.is_eligible(now))
            .fold(Amount::ZERO, |acc, v| acc.saturating_add(v.effective_stake()))
    }

    /// Drop votes past the timeout, and blocks left without votes
    pub fn collect_expired(&mut self, now: u64) -> usize {
        let timeout = self.vote_timeout_secs;
        let mut dropped = 0;
        for pending in self.pending.values_mut() {
            let before = pending.votes.len();
            pending
                .votes
                .retain(|_, p| p.received_at.saturating_add(timeout) >= now);
            dropped += before - pending.votes.len();
        }
        self.pending.retain(|_, p| !p.votes.is_empty());
        dropped
    }

    /// Forget pending votes for blocks that left the canonical chain
    pub fn discard_pending(&mut self, hash: &BlockHash) {
        self.pending.remove(hash);
    }

    fn meets_threshold(&self, voted: Amount, total: Amount) -> bool {
        if total.is_zero() {
            return false;
        }
        (voted.units() as u128) * 10_000 >= (total.units() as u128) * (self.threshold_bps as u128)
    }
}
