use crate::block::{Block, BlockConfig};
use crate::consensus::ValidatorRegistry;
use crate::hash::{BlockHash, TxId};
use crate::identity::{SignatureVerifier, SigningService};
use crate::ledger::Ledger;
use crate::tx::{Transaction, TxRules, TxValidator};
use tracing::{debug, warn};

/// Assembles a signed candidate block.
///
/// The mining reward comes first, followed by candidates in the order given
/// (the mempool hands them over fee-ranked). Each candidate is dry-run on top
/// of the ones already taken; those that fail are skipped. Assembly stops at
/// the transaction count or byte limit.
pub struct BlockBuilder<'a> {
    height: u64,
    prev_hash: BlockHash,
    timestamp: u64,
    candidates: Vec<Transaction>,
    ledger: Option<&'a Ledger>,
    registry: Option<&'a ValidatorRegistry>,
    tx_rules: TxRules,
    verifier: Option<&'a dyn SignatureVerifier>,
    is_confirmed: Option<&'a dyn Fn(&TxId) -> bool>,
}

impl<'a> BlockBuilder<'a> {
    pub fn new(height: u64, prev_hash: BlockHash, timestamp: u64) -> Self {
        Self {
            height,
            prev_hash,
            timestamp,
            candidates: Vec::new(),
            ledger: None,
            registry: None,
            tx_rules: TxRules::default(),
            verifier: None,
            is_confirmed: None,
        }
    }

    /// Pending transactions to choose from, best first
    pub fn candidates(mut self, candidates: Vec<Transaction>) -> Self {
        self.candidates = candidates;
        self
    }

    /// State the candidates are dry-run against. Without it no user
    /// transaction is included.
    pub fn state(mut self, ledger: &'a Ledger, registry: &'a ValidatorRegistry) -> Self {
        self.ledger = Some(ledger);
        self.registry = Some(registry);
        self
    }

    pub fn tx_rules(mut self, rules: TxRules) -> Self {
        self.tx_rules = rules;
        self
    }

    /// Re-check signatures of candidates with this verifier
    pub fn verifier(mut self, verifier: &'a dyn SignatureVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Skip candidates the chain already contains
    pub fn confirmed(mut self, is_confirmed: &'a dyn Fn(&TxId) -> bool) -> Self {
        self.is_confirmed = Some(is_confirmed);
        self
    }

    /// Assemble the block and sign it as `proposer`
    pub fn build(self, config: &BlockConfig, proposer: &dyn SigningService) -> Block {
        let address = proposer.address();
        let reward = Transaction::mining_reward(
            address.clone(),
            config.rewards.reward_at(self.height),
            self.height,
            self.timestamp,
        );

        let mut transactions = vec![reward];
        let base = Block::new(
            self.height,
            self.prev_hash,
            transactions.clone(),
            self.timestamp,
            Some(address.clone()),
        );
        let mut size = base.size;

        if let (Some(ledger), Some(registry)) = (self.ledger, self.registry) {
            let mut overlay = ledger.overlay();
            let mut registry = registry.clone();
            // Block order: the reward lands before any candidate spends.
            // Candidates are only dry-run on top of a reward that applies.
            let candidates = match overlay.apply(&transactions[0]) {
                Ok(()) => self.candidates,
                Err(e) => {
                    warn!(height = self.height, error = %e, "block reward does not apply, proposing it alone");
                    Vec::new()
                }
            };

            for tx in candidates {
                if transactions.len() >= config.max_transactions {
                    break;
                }
                let tx_size = tx.encoded_size() as u64;
                if size.saturating_add(tx_size) > config.max_block_size {
                    debug!(tx = %tx.id().short(), "candidate does not fit, skipping");
                    continue;
                }
                if self.is_confirmed.is_some_and(|f| f(&tx.id())) {
                    continue;
                }
                if tx.is_system() || TxValidator::validate_structure(&tx, &self.tx_rules).is_err() {
                    continue;
                }
                if let Some(verifier) = self.verifier {
                    if TxValidator::verify_signature(&tx, verifier).is_err() {
                        continue;
                    }
                }
                if TxValidator::validate_time(&tx, self.timestamp, &self.tx_rules, None).is_err() {
                    continue;
                }

                let mut trial = registry.clone();
                if trial.apply_transaction(&tx, self.timestamp).is_err() {
                    debug!(tx = %tx.id().short(), "candidate fails registry dry run, skipping");
                    continue;
                }
                if overlay.apply(&tx).is_err() {
                    debug!(tx = %tx.id().short(), "candidate fails ledger dry run, skipping");
                    continue;
                }
                registry = trial;
                size = size.saturating_add(tx_size);
                transactions.push(tx);
            }
        }

        let mut block = Block::new(
            self.height,
            self.prev_hash,
            transactions,
            self.timestamp,
            Some(address),
        );
        block.sign(proposer);
        block
    }
}
