use crate::block::Block;
use crate::consensus::{BlockVote, RegistryError, ValidatorRegistry};
use crate::hash::BlockHash;
use crate::identity::{Address, Signature, SignatureVerifier};
use crate::tx::Amount;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Errors from slashing checks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlashingError {
    #[error("Unknown validator {0}")]
    UnknownValidator(Address),

    #[error("Invalid fork evidence: {0}")]
    InvalidEvidence(String),

    #[error("Penalty of {penalty} on {validator} cannot be reapplied, only {covered} is at stake")]
    PenaltyNotCovered {
        validator: Address,
        penalty: Amount,
        covered: Amount,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlashingReason {
    DoubleSigning,
    Inactivity,
    MaliciousFork,
}

impl fmt::Display for SlashingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlashingReason::DoubleSigning => "double_signing",
            SlashingReason::Inactivity => "inactivity",
            SlashingReason::MaliciousFork => "malicious_fork",
        };
        f.write_str(name)
    }
}

/// One entry of the append-only penalty log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashingEvent {
    /// Position in the log, counting from zero
    pub sequence: u64,
    pub validator: Address,
    pub reason: SlashingReason,
    pub evidence: Vec<u8>,
    pub timestamp: u64,
    pub penalty: Amount,
    pub removed: bool,
}

/// A block header as signed by its proposer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHeader {
    pub height: u64,
    pub block_hash: BlockHash,
    pub signature: Signature,
}

/// Two different blocks signed by the same proposer for the same height
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkEvidence {
    pub first: SignedHeader,
    pub second: SignedHeader,
}

impl ForkEvidence {
    /// Check that both headers are genuinely signed by `validator` and conflict
    pub fn verify(&self, validator: &Address, verifier: &dyn SignatureVerifier) -> Result<(), SlashingError> {
        if self.first.height != self.second.height {
            return Err(SlashingError::InvalidEvidence("headers are at different heights".into()));
        }
        if self.first.block_hash == self.second.block_hash {
            return Err(SlashingError::InvalidEvidence("headers name the same block".into()));
        }
        let public_key = validator
            .public_key()
            .map_err(|e| SlashingError::InvalidEvidence(e.to_string()))?;
        for header in [&self.first, &self.second] {
            let message = Block::proposal_bytes(&header.block_hash, header.height);
            if !verifier.verify(&message, &header.signature, &public_key) {
                return Err(SlashingError::InvalidEvidence(format!(
                    "signature on {} does not belong to {}",
                    header.block_hash.short(),
                    validator
                )));
            }
        }
        Ok(())
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 * (8 + 32 + 64));
        for header in [&self.first, &self.second] {
            bytes.extend_from_slice(&header.height.to_le_bytes());
            bytes.extend_from_slice(header.block_hash.as_bytes());
            bytes.extend_from_slice(header.signature.as_bytes());
        }
        bytes
    }
}

/// Slashing parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashingConfig {
    /// Silence longer than this counts as inactivity
    pub inactivity_threshold_secs: u64,
    /// Penalty per full threshold of silence, in basis points
    pub inactivity_rate_bps: u64,
    /// Cap on the inactivity penalty, in basis points
    pub max_inactivity_penalty_bps: u64,
    /// How long an inactive validator stays jailed
    pub jail_duration_secs: u64,
}

impl Default for SlashingConfig {
    fn default() -> Self {
        Self {
            inactivity_threshold_secs: 86_400,
            inactivity_rate_bps: 1_000,
            max_inactivity_penalty_bps: 5_000,
            jail_duration_secs: 86_400,
        }
    }
}

/// Detects misbehavior and applies penalties through the registry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashingEngine {
    config: SlashingConfig,
    /// First vote seen per height and validator
    votes: BTreeMap<u64, BTreeMap<Address, BlockHash>>,
    history: BTreeMap<Address, Vec<SlashingEvent>>,
    recorded: u64,
}

impl SlashingEngine {
    pub fn new(config: SlashingConfig) -> Self {
        Self {
            config,
            votes: BTreeMap::new(),
            history: BTreeMap::new(),
            recorded: 0,
        }
    }

    pub fn config(&self) -> &SlashingConfig {
        &self.config
    }

    /// Penalty history of one validator, oldest first
    pub fn history(&self, validator: &Address) -> &[SlashingEvent] {
        self.history.get(validator).map_or(&[], |v| v.as_slice())
    }

    /// Every event, grouped by validator
    pub fn events(&self) -> impl Iterator<Item = &SlashingEvent> {
        self.history.values().flatten()
    }

    /// Number of events ever recorded, also the sequence of the next one
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    /// Events recorded at or after `sequence`, in log order
    pub fn events_since(&self, sequence: u64) -> Vec<&SlashingEvent> {
        let mut events: Vec<&SlashingEvent> = self.events().filter(|e| e.sequence >= sequence).collect();
        events.sort_by_key(|e| e.sequence);
        events
    }

    /// Validator and height pairs whose first vote is remembered
    pub fn tracked_votes(&self) -> usize {
        self.votes.values().map(BTreeMap::len).sum()
    }

    /// Apply the penalties recorded since `sequence` to a registry rolled
    /// back to before they happened. Inactivity penalties jail again.
    ///
    /// Fails when a penalty can no longer be taken in full, which happens
    /// when the stake it consumed was bonded after the rollback point.
    pub fn reapply_since(&self, registry: &mut ValidatorRegistry, sequence: u64) -> Result<usize, SlashingError> {
        let events = self.events_since(sequence);
        for event in &events {
            if event.penalty.is_zero() {
                continue;
            }
            let covered = registry
                .get(&event.validator)
                .map_or(Amount::ZERO, |v| v.effective_stake());
            if covered < event.penalty {
                return Err(SlashingError::PenaltyNotCovered {
                    validator: event.validator.clone(),
                    penalty: event.penalty,
                    covered,
                });
            }
            let outcome = registry.slash(&event.validator, event.penalty)?;
            if event.reason == SlashingReason::Inactivity && !outcome.removed {
                let until = event.timestamp.saturating_add(self.config.jail_duration_secs);
                registry.jail(&event.validator, until)?;
            }
        }
        Ok(events.len())
    }

    pub fn total_slashed(&self) -> Amount {
        self.events()
            .fold(Amount::ZERO, |acc, e| acc.saturating_add(e.penalty))
    }

    /// Compare a vote with the first vote the validator cast at that height.
    /// A different block hash is double-signing and costs the whole stake.
    pub fn check_double_signing(
        &mut self,
        registry: &mut ValidatorRegistry,
        vote: &BlockVote,
        now: u64,
    ) -> Result<Option<SlashingEvent>, SlashingError> {
        // Only validators have stake to lose; other signers are not tracked
        if !registry.contains(&vote.validator) {
            return Ok(None);
        }
        let seen = self.votes.entry(vote.height).or_default();
        let Some(prior) = seen.get(&vote.validator).copied() else {
            seen.insert(vote.validator.clone(), vote.block_hash);
            return Ok(None);
        };
        if prior == vote.block_hash {
            return Ok(None);
        }
        let Some(validator) = registry.get(&vote.validator) else {
            return Ok(None);
        };

        let penalty = validator.effective_stake();
        let mut evidence = Vec::with_capacity(72);
        evidence.extend_from_slice(&vote.height.to_le_bytes());
        evidence.extend_from_slice(prior.as_bytes());
        evidence.extend_from_slice(vote.block_hash.as_bytes());

        let event = self.penalize(
            registry,
            &vote.validator,
            SlashingReason::DoubleSigning,
            penalty,
            evidence,
            now,
        )?;
        Ok(Some(event))
    }

    /// Penalize a validator silent for longer than the inactivity threshold.
    /// The penalty grows linearly with the silence, capped, and the validator
    /// is jailed. Jailed validators are not checked again.
    pub fn check_inactivity(
        &mut self,
        registry: &mut ValidatorRegistry,
        address: &Address,
        now: u64,
    ) -> Result<Option<SlashingEvent>, SlashingError> {
        let validator = registry
            .get(address)
            .ok_or_else(|| SlashingError::UnknownValidator(address.clone()))?;
        if validator.is_jailed(now) {
            return Ok(None);
        }

        let silence = now.saturating_sub(validator.stats.last_active);
        let threshold = self.config.inactivity_threshold_secs.max(1);
        if silence <= threshold {
            return Ok(None);
        }

        let rate = (self.config.inactivity_rate_bps as u128) * (silence as u128) / (threshold as u128);
        let bps = rate.min(self.config.max_inactivity_penalty_bps as u128) as u64;
        let penalty = validator.effective_stake().mul_ratio(bps, 10_000);

        let event = self.penalize(
            registry,
            address,
            SlashingReason::Inactivity,
            penalty,
            silence.to_le_bytes().to_vec(),
            now,
        )?;
        if !event.removed {
            registry.jail(address, now.saturating_add(self.config.jail_duration_secs))?;
        }
        Ok(Some(event))
    }

    /// Penalize the full stake of a validator proven to have signed two
    /// conflicting blocks at one height
    pub fn check_malicious_fork(
        &mut self,
        registry: &mut ValidatorRegistry,
        address: &Address,
        evidence: &ForkEvidence,
        verifier: &dyn SignatureVerifier,
        now: u64,
    ) -> Result<SlashingEvent, SlashingError> {
        let validator = registry
            .get(address)
            .ok_or_else(|| SlashingError::UnknownValidator(address.clone()))?;
        evidence.verify(address, verifier)?;

        let penalty = validator.effective_stake();
        self.penalize(
            registry,
            address,
            SlashingReason::MaliciousFork,
            penalty,
            evidence.to_bytes(),
            now,
        )
    }

    /// Forget first-vote records below `height`
    pub fn prune_votes_below(&mut self, height: u64) {
        self.votes = self.votes.split_off(&height);
    }

    fn penalize(
        &mut self,
        registry: &mut ValidatorRegistry,
        address: &Address,
        reason: SlashingReason,
        penalty: Amount,
        evidence: Vec<u8>,
        now: u64,
    ) -> Result<SlashingEvent, SlashingError> {
        let outcome = registry.slash(address, penalty)?;
        let event = SlashingEvent {
            sequence: self.recorded,
            validator: address.clone(),
            reason,
            evidence,
            timestamp: now,
            penalty: outcome.deducted,
            removed: outcome.removed,
        };
        warn!(
            validator = %address,
            reason = %reason,
            penalty = %outcome.deducted,
            removed = outcome.removed,
            "validator slashed"
        );
        self.history
            .entry(address.clone())
            .or_default()
            .push(event.clone());
        self.recorded += 1;
        Ok(event)
    }
}
