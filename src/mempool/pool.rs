//! Transaction pool
//!
//! Holds validated, unconfirmed transactions ranked by fee. The pool never
//! mutates chain state; it only admits, orders and drops transactions.

use crate::hash::TxId;
use crate::identity::{Address, SignatureVerifier};
use crate::ledger::{Ledger, LedgerError, Movements};
use crate::tx::{Amount, Transaction, TxRules, TxValidator, ValidationError};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::debug;

/// Mempool configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolConfig {
    /// Maximum number of transactions held
    pub max_size: usize,
    /// Transactions older than this are rejected and expired
    pub max_age_secs: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5_000,
            max_age_secs: 72 * 3600,
        }
    }
}

impl MempoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_max_age_secs(mut self, max_age_secs: u64) -> Self {
        self.max_age_secs = max_age_secs;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("mempool max_size must be at least 1".into());
        }
        if self.max_age_secs == 0 {
            return Err("mempool max_age_secs must be positive".into());
        }
        Ok(())
    }
}

/// Errors from mempool admission
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("Transaction {0} is already in the pool")]
    Duplicate(TxId),

    #[error("Transaction {0} is already confirmed")]
    AlreadyConfirmed(TxId),

    #[error("Pool full: fee {fee} does not beat the lowest pooled fee {lowest}")]
    PoolFull { fee: Amount, lowest: Amount },

    #[error("Invalid transaction: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Rejected by ledger: {0}")]
    Ledger(#[from] LedgerError),
}

/// Everything admission needs to know about the world outside the pool
pub struct Admission<'a> {
    pub ledger: &'a Ledger,
    pub verifier: &'a dyn SignatureVerifier,
    pub rules: &'a TxRules,
    pub now: u64,
    pub is_confirmed: &'a dyn Fn(&TxId) -> bool,
}

#[derive(Clone, Debug)]
struct PoolEntry {
    tx: Transaction,
    seq: u64,
    added_at: u64,
    /// What the sender pays out of its own balance
    sender_debit: Amount,
}

type RankKey = (Reverse<Amount>, u64, TxId);

/// Fee-ranked pool of pending transactions
#[derive(Clone, Debug)]
pub struct Mempool {
    config: MempoolConfig,
    entries: HashMap<TxId, PoolEntry>,
    ranked: BTreeSet<RankKey>,
    pending_by_sender: HashMap<Address, Amount>,
    next_seq: u64,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            ranked: BTreeSet::new(),
            pending_by_sender: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &TxId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &TxId) -> Option<&Transaction> {
        self.entries.get(id).map(|e| &e.tx)
    }

    /// Amount the sender has committed across its pooled transactions
    pub fn pending_spend(&self, sender: &Address) -> Amount {
        self.pending_by_sender
            .get(sender)
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    /// Admit a transaction after full validation.
    ///
    /// When the pool is full, the lowest-fee entry is evicted if the newcomer
    /// pays strictly more; otherwise the newcomer is rejected.
    pub fn add(&mut self, tx: Transaction, ctx: &Admission<'_>) -> Result<TxId, MempoolError> {
        let id = tx.id();
        if self.entries.contains_key(&id) {
            return Err(MempoolError::Duplicate(id));
        }
        if (ctx.is_confirmed)(&id) {
            return Err(MempoolError::AlreadyConfirmed(id));
        }

        TxValidator::validate(&tx, ctx.verifier, ctx.rules, ctx.now, Some(self.config.max_age_secs))?;
        ctx.ledger.check(&tx)?;

        let sender_debit = Self::sender_debit(&tx)?;
        let committed = self
            .pending_spend(tx.sender())
            .checked_add(sender_debit)
            .ok_or_else(|| LedgerError::InvalidAmount("pending spend overflow".into()))?;
        let available = ctx.ledger.get_balance(tx.sender());
        if committed > available {
            return Err(LedgerError::InsufficientFunds {
                address: tx.sender().clone(),
                required: committed,
                available,
            }
            .into());
        }

        if self.entries.len() >= self.config.max_size {
            let lowest = self.ranked.iter().next_back().cloned();
            match lowest {
                Some((Reverse(lowest_fee), _, lowest_id)) if tx.fee() > lowest_fee => {
                    debug!(evicted = %lowest_id, fee = %lowest_fee, "mempool full, evicting lowest fee");
                    self.remove(&lowest_id);
                }
                Some((Reverse(lowest_fee), _, _)) => {
                    return Err(MempoolError::PoolFull {
                        fee: tx.fee(),
                        lowest: lowest_fee,
                    });
                }
                None => {}
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.ranked.insert((Reverse(tx.fee()), seq, id));
        *self
            .pending_by_sender
            .entry(tx.sender().clone())
            .or_insert(Amount::ZERO) = committed;
        self.entries.insert(
            id,
            PoolEntry {
                tx,
                seq,
                added_at: ctx.now,
                sender_debit,
            },
        );
        Ok(id)
    }

    /// Up to `limit` transactions, highest fee first. Equal fees keep
    /// arrival order.
    pub fn select(&self, limit: usize) -> Vec<Transaction> {
        self.ranked
            .iter()
            .take(limit)
            .filter_map(|(_, _, id)| self.entries.get(id).map(|e| e.tx.clone()))
            .collect()
    }

    /// Every pooled transaction in rank order
    pub fn transactions(&self) -> Vec<Transaction> {
        self.select(self.entries.len())
    }

    /// Drop transactions that made it into a block
    pub fn remove_confirmed<'a, I: IntoIterator<Item = &'a TxId>>(&mut self, ids: I) -> usize {
        ids.into_iter().filter(|id| self.remove(id).is_some()).count()
    }

    /// Drop transactions older than the configured max age. Returns their ids.
    pub fn expire(&mut self, now: u64) -> Vec<TxId> {
        let max_age = self.config.max_age_secs;
        let expired: Vec<TxId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.tx.timestamp().saturating_add(max_age) < now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.remove(id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired mempool transactions");
        }
        expired
    }

    /// Drop everything that no longer passes a ledger check, e.g. after a
    /// reorganization changed balances.
    pub fn retain_valid(&mut self, ledger: &Ledger) -> usize {
        let mut overlay = ledger.overlay();
        let stale: Vec<TxId> = self
            .select(self.entries.len())
            .into_iter()
            .filter(|tx| overlay.apply(tx).is_err())
            .map(|tx| tx.id())
            .collect();
        for id in &stale {
            self.remove(id);
        }
        stale.len()
    }

    /// When a transaction entered the pool
    pub fn added_at(&self, id: &TxId) -> Option<u64> {
        self.entries.get(id).map(|e| e.added_at)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.ranked.clear();
        self.pending_by_sender.clear();
    }

    fn remove(&mut self, id: &TxId) -> Option<Transaction> {
        let entry = self.entries.remove(id)?;
        self.ranked.remove(&(Reverse(entry.tx.fee()), entry.seq, *id));
        if let Some(pending) = self.pending_by_sender.get_mut(entry.tx.sender()) {
            *pending = pending.saturating_sub(entry.sender_debit);
            if pending.is_zero() {
                self.pending_by_sender.remove(entry.tx.sender());
            }
        }
        Some(entry.tx)
    }

    fn sender_debit(tx: &Transaction) -> Result<Amount, LedgerError> {
        let movements = Movements::of(tx)?;
        Ok(movements
            .debits
            .iter()
            .filter(|(address, _)| address == tx.sender())
            .fold(Amount::ZERO, |acc, (_, amount)| acc.saturating_add(*amount)))
    }
}
