//! Chain manager
//!
//! Owns the canonical chain and every piece of state derived from it. All
//! mutation goes through one write lock, so readers only ever see whole
//! blocks applied. Persistence happens under the same lock, after the
//! in-memory transition succeeded; a failed write rolls the block back.

use crate::block::{Block, BlockBuilder, BlockValidator, ValidationContext};
use crate::chain::{build_genesis_block, ChainConfig, Checkpoint, CheckpointManager, StateSnapshot, SNAPSHOT_VERSION};
use crate::clock::Clock;
use crate::consensus::{
    BlockVote, FinalityError, Finalizer, ForkEvidence, RegistryUndo, SlashingEngine, SlashingEvent, Validator,
    ValidatorRegistry, ValidatorSelector, VoteOutcome,
};
use crate::error::{ChainError, ConsensusError};
use crate::hash::{BlockHash, TxId};
use crate::identity::{Address, Ed25519Verifier, SignatureVerifier, SigningService};
use crate::ledger::{Ledger, LedgerError, Movements};
use crate::mempool::{Admission, Mempool};
use crate::storage::{ChainStore, KvStore, MemoryStore};
use crate::tx::{Amount, Transaction, TxData, TxValidator};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Point-in-time summary of the chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub height: u64,
    pub tip: BlockHash,
    pub finalized_height: u64,
    pub total_supply: Amount,
    pub circulating_supply: Amount,
    pub validators: usize,
    pub active_validators: usize,
    pub total_active_stake: Amount,
    pub mempool_size: usize,
    pub checkpoints: Vec<u64>,
}

/// What a round of expiry removed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    pub transactions: Vec<TxId>,
    pub votes: usize,
}

/// Read-only inputs to a state transition
pub(super) struct Env<'a> {
    pub config: &'a ChainConfig,
    pub selector: &'a ValidatorSelector,
    pub verifier: &'a dyn SignatureVerifier,
    pub now: u64,
}

/// Everything derived from the canonical chain
#[derive(Clone, Debug)]
pub(super) struct ChainState {
    /// Canonical blocks, index = height. Never empty.
    pub blocks: Vec<Block>,
    pub tx_index: HashMap<TxId, u64>,
    pub ledger: Ledger,
    pub registry: ValidatorRegistry,
    /// Registry undo records per height, inside the reorganization window
    pub undo: BTreeMap<u64, Vec<RegistryUndo>>,
    pub mempool: Mempool,
    pub finalizer: Finalizer,
    pub slashing: SlashingEngine,
    pub checkpoints: CheckpointManager,
}

impl ChainState {
    fn genesis(config: &ChainConfig) -> Result<Self, ChainError> {
        let genesis = build_genesis_block(&config.genesis);
        let mut state = Self {
            blocks: Vec::new(),
            tx_index: HashMap::new(),
            ledger: Ledger::new(
                config.genesis.unspendable_address.clone(),
                config.genesis.staking_address.clone(),
            ),
            registry: ValidatorRegistry::new(config.consensus.min_stake, config.tx.min_delegation),
            undo: BTreeMap::new(),
            mempool: Mempool::new(config.mempool.clone()),
            finalizer: Finalizer::new(
                config.consensus.finality_threshold_bps,
                config.consensus.vote_timeout_secs,
            ),
            slashing: SlashingEngine::new(config.consensus.slashing.clone()),
            checkpoints: CheckpointManager::new(config.checkpoint.clone()),
        };

        for tx in &genesis.transactions {
            state.ledger.apply(tx)?;
            state.tx_index.insert(tx.id(), 0);
        }
        state.registry.register_locked(
            config.genesis.staking_address.clone(),
            config.genesis.staking_amount,
            config.genesis.timestamp,
        )?;
        state.finalizer.mark_finalized(genesis.hash, 0);
        state.blocks.push(genesis);
        Ok(state)
    }

    pub fn height(&self) -> u64 {
        self.blocks.len().saturating_sub(1) as u64
    }

    pub fn next_height(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.blocks.last().map_or(BlockHash::ZERO, |b| b.hash)
    }

    pub fn validate(&self, block: &Block, env: &Env<'_>) -> Result<(), ChainError> {
        let is_confirmed = |id: &TxId| self.tx_index.contains_key(id);
        let ctx = ValidationContext {
            height: self.next_height(),
            tip: self.tip_hash(),
            ledger: &self.ledger,
            registry: &self.registry,
            selector: env.selector,
            verifier: env.verifier,
            tx_rules: &env.config.tx,
            now: env.now,
            is_confirmed: &is_confirmed,
        };
        BlockValidator::validate(block, &env.config.block, &ctx)?;
        Ok(())
    }

    /// Apply a validated block. On failure every partial effect is undone.
    pub fn apply(&mut self, block: &Block, env: &Env<'_>) -> Result<(), ChainError> {
        let mut applied = 0;
        let mut undo = Vec::new();
        if let Err(e) = self.apply_effects(block, &mut applied, &mut undo) {
            warn!(height = block.height, error = %e, "block application failed, rolling back");
            for record in undo.iter().rev() {
                if let Err(err) = self.registry.undo(record) {
                    warn!(error = %err, "registry rollback step failed");
                }
            }
            for tx in block.transactions[..applied].iter().rev() {
                if let Err(err) = self.ledger.revert(tx) {
                    warn!(tx = %tx.id().short(), error = %err, "ledger rollback step failed");
                }
            }
            return Err(e);
        }

        for tx in &block.transactions {
            self.tx_index.insert(tx.id(), block.height);
        }
        self.undo.insert(block.height, undo);
        self.blocks.push(block.clone());

        let ids = block.tx_ids();
        self.mempool.remove_confirmed(ids.iter());
        let dropped = self.mempool.retain_valid(&self.ledger);
        if dropped > 0 {
            debug!(dropped, "dropped pooled transactions invalidated by the block");
        }
        self.forget_beyond(env.config.consensus.max_reorg_depth);
        Ok(())
    }

    fn apply_effects(
        &mut self,
        block: &Block,
        applied: &mut usize,
        undo: &mut Vec<RegistryUndo>,
    ) -> Result<(), ChainError> {
        for tx in &block.transactions {
            self.ledger.apply(tx)?;
            *applied += 1;
            if let Some(record) = self.registry.apply_transaction(tx, block.timestamp)? {
                undo.push(record);
            }
        }
        if let Some(proposer) = &block.proposer {
            undo.push(self.registry.record_proposal(proposer, block.height, block.timestamp)?);
            let fees = block.total_fees();
            if !fees.is_zero() {
                undo.push(self.registry.credit_rewards(proposer, fees)?);
            }
        }
        Ok(())
    }

    /// Release undo data for the block that just left the reorganization window
    fn forget_beyond(&mut self, max_reorg_depth: u64) {
        let Some(height) = self.height().checked_sub(max_reorg_depth) else {
            return;
        };
        if height == 0 {
            return;
        }
        if let Some(block) = self.blocks.get(height as usize) {
            let ids = block.tx_ids();
            self.ledger.forget(ids.iter());
            self.undo.remove(&height);
        }
    }

    /// Take the tip block off the chain, undoing its ledger and registry effects
    pub fn revert_tip(&mut self) -> Result<Block, ChainError> {
        if self.blocks.len() <= 1 {
            return Err(ConsensusError::FinalizedConflict {
                ancestor: 0,
                finalized: self.finalizer.latest_finalized_height(),
            }
            .into());
        }
        let height = self.height();
        if let Some(validator) = self.blocks.last().and_then(|b| self.slashed_since_bonded(b)) {
            return Err(ConsensusError::SlashedStakeRevert { validator, height }.into());
        }
        let undo = self.undo.remove(&height).ok_or_else(|| {
            LedgerError::Corrupted(format!("no undo record for height {}, block is too deep to revert", height))
        })?;
        let Some(block) = self.blocks.pop() else {
            return Err(LedgerError::Corrupted("chain is empty".into()).into());
        };

        for record in undo.iter().rev() {
            self.registry.undo(record)?;
        }
        for tx in block.transactions.iter().rev() {
            self.ledger.revert(tx)?;
            self.tx_index.remove(&tx.id());
        }
        self.finalizer.discard_pending(&block.hash);
        info!(height, block = %block.hash.short(), "block reverted");
        Ok(block)
    }

    /// A validator whose stake `block` bonds and who has been slashed at or
    /// after the block's time. The escrow no longer holds that stake in full.
    fn slashed_since_bonded(&self, block: &Block) -> Option<Address> {
        block.transactions.iter().find_map(|tx| {
            let validator = match tx.data() {
                TxData::Stake { validator } | TxData::Delegate { validator } => validator,
                _ => return None,
            };
            self.slashing
                .history(validator)
                .iter()
                .any(|event| event.timestamp >= block.timestamp)
                .then(|| validator.clone())
        })
    }

    /// Put transactions back in the pool, typically those of reverted
    /// blocks. Returns how many were re-admitted.
    pub fn requeue<'t, I>(&mut self, txs: I, env: &Env<'_>) -> usize
    where
        I: IntoIterator<Item = &'t Transaction>,
    {
        self.mempool.retain_valid(&self.ledger);
        let mut requeued = 0;
        for tx in txs {
            if tx.is_system() || self.tx_index.contains_key(&tx.id()) {
                continue;
            }
            let tx_index = &self.tx_index;
            let is_confirmed = |id: &TxId| tx_index.contains_key(id);
            let admission = Admission {
                ledger: &self.ledger,
                verifier: env.verifier,
                rules: &env.config.tx,
                now: env.now,
                is_confirmed: &is_confirmed,
            };
            if self.mempool.add(tx.clone(), &admission).is_ok() {
                requeued += 1;
            }
        }
        requeued
    }

    /// Current balances of every address the blocks touch
    pub fn balances_touched_by<'a, I>(&self, blocks: I) -> Vec<(Address, Amount)>
    where
        I: IntoIterator<Item = &'a Block>,
    {
        let mut addresses = BTreeSet::new();
        for tx in blocks.into_iter().flat_map(|b| b.transactions.iter()) {
            if let Ok(movements) = Movements::of(tx) {
                addresses.extend(movements.addresses().cloned());
            }
        }
        addresses
            .into_iter()
            .map(|a| {
                let balance = self.ledger.get_balance(&a);
                (a, balance)
            })
            .collect()
    }

    pub fn checkpoint(&self, timestamp: u64) -> Checkpoint {
        let height = self.height();
        let block_hash = self.tip_hash();
        Checkpoint {
            height,
            block_hash,
            timestamp,
            ledger: self.ledger.clone(),
            registry: self.registry.clone(),
            undo: self.undo.clone(),
            slashing_sequence: self.slashing.recorded(),
            verified: self.finalizer.finalized_hash(height) == Some(&block_hash),
        }
    }
}

/// The chain context: canonical chain, ledger, validators, finality and
/// slashing behind one lock, persisted to a `KvStore`
pub struct ChainManager<S: KvStore = MemoryStore> {
    pub(super) config: ChainConfig,
    pub(super) selector: ValidatorSelector,
    pub(super) state: RwLock<ChainState>,
    pub(super) store: ChainStore<S>,
    pub(super) verifier: Arc<dyn SignatureVerifier>,
    pub(super) clock: Arc<dyn Clock>,
}

impl ChainManager<MemoryStore> {
    /// A chain kept only in memory, verifying Ed25519 signatures
    pub fn in_memory(config: ChainConfig, clock: Arc<dyn Clock>) -> Result<Self, ChainError> {
        Self::new(config, MemoryStore::new(), Arc::new(Ed25519Verifier), clock)
    }
}

impl<S: KvStore> ChainManager<S> {
    /// Start a fresh chain from the configured genesis block
    pub fn new(
        config: ChainConfig,
        store: S,
        verifier: Arc<dyn SignatureVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ChainError> {
        config.validate()?;
        let state = ChainState::genesis(&config)?;
        let store = ChainStore::new(store);
        let genesis = &state.blocks[0];
        store.commit_block(genesis, &state.balances_touched_by([genesis]))?;
        info!(
            genesis = %genesis.hash.short(),
            validator = %config.genesis.staking_address,
            "chain initialized"
        );

        Ok(Self {
            selector: ValidatorSelector::new(config.consensus.selection_cooldown_blocks),
            config,
            state: RwLock::new(state),
            store,
            verifier,
            clock,
        })
    }

    /// Rebuild a chain from an exported snapshot, after checking it
    pub fn from_snapshot(
        snapshot: StateSnapshot,
        store: S,
        verifier: Arc<dyn SignatureVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ChainError> {
        snapshot.verify()?;
        snapshot.config.validate()?;
        let config = snapshot.config;

        let mut tx_index = HashMap::new();
        for block in &snapshot.blocks {
            for tx in &block.transactions {
                tx_index.insert(tx.id(), block.height);
            }
        }
        let mut state = ChainState {
            blocks: snapshot.blocks,
            tx_index,
            ledger: snapshot.ledger,
            registry: snapshot.registry,
            undo: snapshot.undo,
            mempool: Mempool::new(config.mempool.clone()),
            finalizer: snapshot.finalizer,
            slashing: snapshot.slashing,
            checkpoints: snapshot.checkpoints,
        };

        let store = ChainStore::new(store);
        for block in &state.blocks {
            store.commit_block(block, &[])?;
        }
        let balances: Vec<(Address, Amount)> = state
            .ledger
            .accounts()
            .map(|(address, account)| (address.clone(), account.balance()))
            .collect();
        store.put_balances(&balances)?;
        for checkpoint in state.checkpoints.checkpoints() {
            store.save_checkpoint(checkpoint)?;
        }

        let selector = ValidatorSelector::new(config.consensus.selection_cooldown_blocks);
        let requeued = {
            let env = Env {
                config: &config,
                selector: &selector,
                verifier: verifier.as_ref(),
                now: clock.now(),
            };
            state.requeue(&snapshot.mempool, &env)
        };
        info!(height = state.height(), requeued, "chain restored from snapshot");

        Ok(Self {
            config,
            selector,
            state: RwLock::new(state),
            store,
            verifier,
            clock,
        })
    }

    pub(super) fn env(&self, now: u64) -> Env<'_> {
        Env {
            config: &self.config,
            selector: &self.selector,
            verifier: self.verifier.as_ref(),
            now,
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn store(&self) -> &ChainStore<S> {
        &self.store
    }

    pub fn height(&self) -> u64 {
        self.state.read().height()
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.state.read().tip_hash()
    }

    pub fn block_at(&self, height: u64) -> Option<Block> {
        self.state.read().blocks.get(height as usize).cloned()
    }

    /// Height of the canonical block containing `id`
    pub fn tx_height(&self, id: &TxId) -> Option<u64> {
        self.state.read().tx_index.get(id).copied()
    }

    pub fn balance(&self, address: &Address) -> Amount {
        self.state.read().ledger.get_balance(address)
    }

    /// Copy of the current ledger
    pub fn ledger(&self) -> Ledger {
        self.state.read().ledger.clone()
    }

    pub fn validator(&self, address: &Address) -> Option<Validator> {
        self.state.read().registry.get(address).cloned()
    }

    /// Copy of the current validator registry
    pub fn registry(&self) -> ValidatorRegistry {
        self.state.read().registry.clone()
    }

    pub fn mempool_len(&self) -> usize {
        self.state.read().mempool.len()
    }

    pub fn mempool_contains(&self, id: &TxId) -> bool {
        self.state.read().mempool.contains(id)
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.state.read().mempool.transactions()
    }

    pub fn latest_finalized_height(&self) -> u64 {
        self.state.read().finalizer.latest_finalized_height()
    }

    pub fn is_finalized(&self, hash: &BlockHash) -> bool {
        self.state.read().finalizer.is_finalized(hash)
    }

    pub fn slashing_history(&self, address: &Address) -> Vec<SlashingEvent> {
        self.state.read().slashing.history(address).to_vec()
    }

    pub fn checkpoint_heights(&self) -> Vec<u64> {
        self.state.read().checkpoints.heights()
    }

    pub fn checkpoint(&self, height: u64) -> Option<Checkpoint> {
        self.state.read().checkpoints.get(height).cloned()
    }

    /// The validator entitled to propose the next block right now
    pub fn expected_proposer(&self) -> Option<Address> {
        let state = self.state.read();
        self.selector.select(
            &state.registry,
            state.next_height(),
            &state.tip_hash(),
            self.clock.now(),
        )
    }

    pub fn status(&self) -> ChainStatus {
        let state = self.state.read();
        let now = self.clock.now();
        ChainStatus {
            height: state.height(),
            tip: state.tip_hash(),
            finalized_height: state.finalizer.latest_finalized_height(),
            total_supply: state.ledger.total_supply(),
            circulating_supply: state.ledger.circulating_supply(),
            validators: state.registry.len(),
            active_validators: state.registry.active_validators(now).len(),
            total_active_stake: state.registry.total_active_stake(now),
            mempool_size: state.mempool.len(),
            checkpoints: state.checkpoints.heights(),
        }
    }

    // ========================================================================
    // BLOCKS
    // ========================================================================

    /// Check a block against the current tip without applying it
    pub fn validate_block(&self, block: &Block) -> Result<(), ChainError> {
        let state = self.state.read();
        state.validate(block, &self.env(self.clock.now()))
    }

    /// Validate and append a block, then persist it
    pub fn apply_block(&self, block: Block) -> Result<BlockHash, ChainError> {
        let mut guard = self.state.write();
        let env = self.env(self.clock.now());
        guard.validate(&block, &env)?;
        guard.apply(&block, &env)?;

        let balances = guard.balances_touched_by([&block]);
        if let Err(e) = self.store.commit_block(&block, &balances) {
            warn!(height = block.height, error = %e, "failed to persist block, reverting");
            let reverted = guard.revert_tip()?;
            guard.requeue(&reverted.transactions, &env);
            return Err(e.into());
        }

        if guard.checkpoints.is_due(block.height) {
            self.take_checkpoint(&mut guard, env.now)?;
        }
        info!(
            height = block.height,
            block = %block.hash.short(),
            txs = block.transactions.len(),
            "block applied"
        );
        Ok(block.hash)
    }

    /// Assemble a block for the next height if `signer` is the selected
    /// proposer. `None` when it is not, or when nobody is eligible.
    pub fn build_block(&self, signer: &dyn SigningService) -> Result<Option<Block>, ChainError> {
        let state = self.state.read();
        let now = self.clock.now();
        let height = state.next_height();
        let prev_hash = state.tip_hash();

        let Some(expected) = self.selector.select(&state.registry, height, &prev_hash, now) else {
            debug!(height, "no eligible validator, skipping slot");
            return Ok(None);
        };
        if expected != signer.address() {
            return Ok(None);
        }

        let is_confirmed = |id: &TxId| state.tx_index.contains_key(id);
        let block = BlockBuilder::new(height, prev_hash, now)
            .candidates(state.mempool.transactions())
            .state(&state.ledger, &state.registry)
            .tx_rules(self.config.tx.clone())
            .verifier(self.verifier.as_ref())
            .confirmed(&is_confirmed)
            .build(&self.config.block, signer);
        Ok(Some(block))
    }

    /// Build, apply and return a block if `signer` is the selected proposer
    pub fn propose_block(&self, signer: &dyn SigningService) -> Result<Option<Block>, ChainError> {
        let Some(block) = self.build_block(signer)? else {
            return Ok(None);
        };
        self.apply_block(block.clone())?;
        Ok(Some(block))
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    /// Validate a transaction and admit it to the mempool
    pub fn add_transaction(&self, tx: Transaction) -> Result<TxId, ChainError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let now = self.clock.now();

        if tx.data().validator().is_some() {
            TxValidator::validate_structure(&tx, &self.config.tx)?;
            state.registry.clone().apply_transaction(&tx, now)?;
        }

        let tx_index = &state.tx_index;
        let is_confirmed = |id: &TxId| tx_index.contains_key(id);
        let admission = Admission {
            ledger: &state.ledger,
            verifier: self.verifier.as_ref(),
            rules: &self.config.tx,
            now,
            is_confirmed: &is_confirmed,
        };
        let id = state.mempool.add(tx, &admission)?;
        debug!(tx = %id.short(), pool = state.mempool.len(), "transaction admitted");
        Ok(id)
    }

    /// Drop expired mempool transactions and expired votes
    pub fn expire(&self) -> ExpiryReport {
        let mut state = self.state.write();
        let now = self.clock.now();
        ExpiryReport {
            transactions: state.mempool.expire(now),
            votes: state.finalizer.collect_expired(now),
        }
    }

    // ========================================================================
    // VOTING AND SLASHING
    // ========================================================================

    /// Verify and count a finality vote.
    ///
    /// A second vote at the same height for a different block is
    /// double-signing: the validator is slashed and the vote rejected.
    pub fn submit_vote(&self, vote: BlockVote) -> Result<VoteOutcome, ChainError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let now = self.clock.now();

        if !vote.verify(self.verifier.as_ref()) {
            return Err(FinalityError::InvalidSignature(vote.validator.clone()).into());
        }
        if vote.height > state.height().saturating_add(self.config.consensus.max_reorg_depth) {
            return Err(ConsensusError::NotCanonical {
                hash: vote.block_hash,
                height: vote.height,
            }
            .into());
        }
        if let Some(event) = state
            .slashing
            .check_double_signing(&mut state.registry, &vote, now)?
        {
            return Err(ConsensusError::Slashed {
                validator: event.validator,
                reason: event.reason,
            }
            .into());
        }
        match state.blocks.get(vote.height as usize) {
            Some(block) if block.hash == vote.block_hash => {}
            _ => {
                return Err(ConsensusError::NotCanonical {
                    hash: vote.block_hash,
                    height: vote.height,
                }
                .into())
            }
        }

        let validator = vote.validator.clone();
        let outcome = state.finalizer.submit_vote(vote, &state.registry, now)?;
        state.registry.record_vote(&validator, now);

        if let VoteOutcome::Finalized { height, .. } = &outcome {
            state.slashing.prune_votes_below(*height);
            let blocks = &state.blocks;
            let verified = state
                .checkpoints
                .verify_finalized(*height, |h| blocks.get(h as usize).map(|b| b.hash));
            for h in verified {
                if let Some(checkpoint) = state.checkpoints.get(h) {
                    if let Err(e) = self.store.save_checkpoint(checkpoint) {
                        warn!(height = h, error = %e, "failed to persist checkpoint verification");
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Penalize and jail every validator silent past the inactivity threshold
    pub fn check_inactivity(&self) -> Result<Vec<SlashingEvent>, ChainError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let now = self.clock.now();

        let addresses: Vec<Address> = state.registry.validators().map(|v| v.address.clone()).collect();
        let mut events = Vec::new();
        for address in addresses {
            if let Some(event) = state
                .slashing
                .check_inactivity(&mut state.registry, &address, now)?
            {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Slash a validator shown to have signed two blocks at one height
    pub fn report_fork(&self, validator: &Address, evidence: &ForkEvidence) -> Result<SlashingEvent, ChainError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let now = self.clock.now();
        let event = state.slashing.check_malicious_fork(
            &mut state.registry,
            validator,
            evidence,
            self.verifier.as_ref(),
            now,
        )?;
        Ok(event)
    }

    /// Release a validator whose jail time is over
    pub fn unjail(&self, validator: &Address) -> Result<(), ChainError> {
        let now = self.clock.now();
        self.state.write().registry.unjail(validator, now)?;
        info!(validator = %validator, "validator unjailed");
        Ok(())
    }

    // ========================================================================
    // CHECKPOINTS AND SNAPSHOTS
    // ========================================================================

    /// Checkpoint the current tip. Returns its height.
    pub fn create_checkpoint(&self) -> Result<u64, ChainError> {
        let mut guard = self.state.write();
        self.take_checkpoint(&mut guard, self.clock.now())
    }

    fn take_checkpoint(&self, state: &mut ChainState, now: u64) -> Result<u64, ChainError> {
        let checkpoint = state.checkpoint(now);
        let height = checkpoint.height;
        self.store.save_checkpoint(&checkpoint)?;
        for pruned in state.checkpoints.insert(checkpoint) {
            self.store.delete_checkpoint(pruned)?;
        }
        Ok(height)
    }

    /// Roll the chain back to the checkpoint at `height`. Blocks above it are
    /// dropped and their transactions return to the mempool. Finalized blocks
    /// are never rolled back. Penalties recorded after the checkpoint was
    /// taken stay in force. On any failure the chain is left unchanged.
    pub fn restore_checkpoint(&self, height: u64) -> Result<(), ChainError> {
        let mut guard = self.state.write();
        let env = self.env(self.clock.now());

        let finalized = guard.finalizer.latest_finalized_height();
        if height < finalized {
            return Err(ConsensusError::BelowFinalized { height, finalized }.into());
        }
        let checkpoint = match guard.checkpoints.get(height) {
            Some(cp) => cp.clone(),
            None => self
                .store
                .load_checkpoint(height)?
                .ok_or(ConsensusError::CheckpointMissing(height))?,
        };
        match guard.blocks.get(height as usize) {
            Some(block) if block.hash == checkpoint.block_hash => {}
            _ => {
                return Err(ConsensusError::NotCanonical {
                    hash: checkpoint.block_hash,
                    height,
                }
                .into())
            }
        }

        let backup = guard.clone();
        match self.rewind_to(&mut guard, checkpoint, &env) {
            Ok((removed, requeued)) => {
                info!(height, removed, requeued, "checkpoint restored");
                Ok(())
            }
            Err(e) => {
                warn!(height, error = %e, "checkpoint restore failed, chain left unchanged");
                *guard = backup;
                Err(e)
            }
        }
    }

    /// Swap in the checkpoint's state and persist the rollback. Returns the
    /// number of blocks removed and transactions requeued.
    fn rewind_to(
        &self,
        state: &mut ChainState,
        checkpoint: Checkpoint,
        env: &Env<'_>,
    ) -> Result<(usize, usize), ChainError> {
        let height = checkpoint.height;
        let removed = state.blocks.split_off(height as usize + 1);
        for block in &removed {
            for tx in &block.transactions {
                state.tx_index.remove(&tx.id());
            }
            state.finalizer.discard_pending(&block.hash);
        }
        state.ledger = checkpoint.ledger;
        state.registry = checkpoint.registry;
        state.undo = checkpoint.undo;
        let reapplied = state
            .slashing
            .reapply_since(&mut state.registry, checkpoint.slashing_sequence)?;
        if reapplied > 0 {
            debug!(height, reapplied, "penalties reapplied over the checkpoint registry");
        }
        let dropped = state.checkpoints.truncate_above(height);

        for h in dropped {
            self.store.delete_checkpoint(h)?;
        }
        for block in removed.iter().rev() {
            self.store.uncommit_block(block, &[])?;
        }
        self.store.put_balances(&state.balances_touched_by(removed.iter()))?;

        let requeued = state.requeue(removed.iter().flat_map(|b| b.transactions.iter()), env);
        Ok((removed.len(), requeued))
    }

    /// Export the whole state as a versioned snapshot
    pub fn export_state(&self) -> StateSnapshot {
        let state = self.state.read();
        StateSnapshot {
            version: SNAPSHOT_VERSION,
            exported_at: self.clock.now(),
            config: self.config.clone(),
            blocks: state.blocks.clone(),
            ledger: state.ledger.clone(),
            registry: state.registry.clone(),
            undo: state.undo.clone(),
            finalizer: state.finalizer.clone(),
            slashing: state.slashing.clone(),
            checkpoints: state.checkpoints.clone(),
            mempool: state.mempool.transactions(),
        }
    }

    /// Drop archived block bodies older than `keep_recent` blocks. Blocks
    /// inside the reorganization window and checkpoint heights are kept.
    pub fn prune_store(&self, keep_recent: u64) -> Result<usize, ChainError> {
        let protected: BTreeSet<u64> = self.checkpoint_heights().into_iter().collect();
        let keep = keep_recent.max(self.config.consensus.max_reorg_depth);
        Ok(self.store.prune_blocks(keep, &protected)?)
    }
}
