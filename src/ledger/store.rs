use crate::hash::TxId;
use crate::identity::Address;
use crate::ledger::{Account, Journal, LedgerEntry, TxEffects};
use crate::tx::{Amount, Transaction, TxData};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::warn;

/// Errors from ledger operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Insufficient funds: {address} has {available}, needs {required}")]
    InsufficientFunds {
        address: Address,
        required: Amount,
        available: Amount,
    },

    #[error("Unspendable source: {0} can only receive")]
    UnspendableSource(Address),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Transaction {0} is already applied")]
    AlreadyApplied(TxId),

    #[error("Transaction {0} has no journal record and cannot be reverted")]
    NotApplied(TxId),

    #[error("Ledger corrupted: {0}")]
    Corrupted(String),
}

/// Value movements a transaction causes, before they touch any account
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Movements {
    pub debits: Vec<(Address, Amount)>,
    pub credits: Vec<(Address, Amount)>,
    pub minted: Amount,
}

impl Movements {
    /// Work out the movements of `tx`.
    ///
    /// - Transfer: sender pays amount + fee, recipient receives amount
    /// - Stake, Delegate: sender pays amount + fee into escrow
    /// - Unstake, Undelegate, ClaimReward: escrow pays amount out, sender pays fee
    /// - Genesis, MiningReward: amount is minted to the recipient
    ///
    /// Every fee lands in escrow, where it backs the proposer's claimable rewards.
    pub fn of(tx: &Transaction) -> Result<Self, LedgerError> {
        let escrow = Address::escrow();
        let amount = tx.amount();
        let fee = tx.fee();
        let mut m = Movements::default();

        match tx.data() {
            TxData::Genesis { .. } | TxData::MiningReward => {
                m.credits.push((tx.recipient().clone(), amount));
                m.minted = amount;
            }
            TxData::Transfer => {
                let total = tx
                    .total_cost()
                    .ok_or_else(|| LedgerError::InvalidAmount("amount plus fee overflows".into()))?;
                m.debits.push((tx.sender().clone(), total));
                m.credits.push((tx.recipient().clone(), amount));
                m.credits.push((escrow, fee));
            }
            TxData::Stake { .. } | TxData::Delegate { .. } => {
                let total = tx
                    .total_cost()
                    .ok_or_else(|| LedgerError::InvalidAmount("amount plus fee overflows".into()))?;
                m.debits.push((tx.sender().clone(), total));
                m.credits.push((escrow, total));
            }
            TxData::Unstake { .. } | TxData::Undelegate { .. } | TxData::ClaimReward { .. } => {
                m.debits.push((tx.sender().clone(), fee));
                m.debits.push((escrow.clone(), amount));
                m.credits.push((tx.sender().clone(), amount));
                m.credits.push((escrow, fee));
            }
        }

        m.debits.retain(|(_, a)| !a.is_zero());
        m.credits.retain(|(_, a)| !a.is_zero());
        Ok(m)
    }

    /// Every address whose balance this changes
    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.debits.iter().chain(self.credits.iter()).map(|(a, _)| a)
    }
}

/// Balance and unspent-entry ledger for every address.
///
/// Empty accounts are never stored, so two ledgers that hold the same
/// balances compare equal no matter how they got there.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    accounts: BTreeMap<Address, Account>,
    unspendable: Address,
    staking: Address,
    minted: Amount,
    journal: Journal,
}

impl Ledger {
    /// Create an empty ledger with its two flagged genesis addresses
    pub fn new(unspendable: Address, staking: Address) -> Self {
        Self {
            accounts: BTreeMap::new(),
            unspendable,
            staking,
            minted: Amount::ZERO,
            journal: Journal::new(),
        }
    }

    pub fn get_balance(&self, address: &Address) -> Amount {
        self.accounts
            .get(address)
            .map(|a| a.balance())
            .unwrap_or(Amount::ZERO)
    }

    pub fn account(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    /// The address that can only receive
    pub fn is_unspendable(&self, address: &Address) -> bool {
        address == &self.unspendable
    }

    /// The genesis validator address
    pub fn is_staking_address(&self, address: &Address) -> bool {
        address == &self.staking
    }

    pub fn unspendable_address(&self) -> &Address {
        &self.unspendable
    }

    pub fn staking_address(&self) -> &Address {
        &self.staking
    }

    /// Total value ever minted by Genesis and MiningReward transactions
    pub fn minted(&self) -> Amount {
        self.minted
    }

    /// Sum of every balance, escrow and the unspendable address included
    pub fn total_supply(&self) -> Amount {
        self.accounts
            .values()
            .fold(Amount::ZERO, |acc, a| acc.saturating_add(a.balance()))
    }

    /// Supply that can still move: everything except the unspendable balance
    pub fn circulating_supply(&self) -> Amount {
        self.total_supply()
            .saturating_sub(self.get_balance(&self.unspendable))
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Check that `tx` could be applied right now, without applying it
    pub fn check(&self, tx: &Transaction) -> Result<(), LedgerError> {
        if self.journal.contains(&tx.id()) {
            return Err(LedgerError::AlreadyApplied(tx.id()));
        }
        let movements = Movements::of(tx)?;
        self.check_movements(tx, &movements, |a| self.get_balance(a))
    }

    /// Apply a transaction. Validation happens in full before any account
    /// is touched.
    pub fn apply(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
        let id = tx.id();
        if self.journal.contains(&id) {
            return Err(LedgerError::AlreadyApplied(id));
        }
        let movements = Movements::of(tx)?;
        self.check_movements(tx, &movements, |a| self.get_balance(a))?;

        let minted = self
            .minted
            .checked_add(movements.minted)
            .ok_or_else(|| LedgerError::InvalidAmount("minted supply overflow".into()))?;

        let mut effects = TxEffects {
            minted: movements.minted,
            ..TxEffects::default()
        };

        if let Err(e) = self.mutate(id, &movements, &mut effects) {
            warn!(tx = %id, error = %e, "ledger apply failed midway, undoing partial effects");
            self.undo(&effects)?;
            return Err(e);
        }

        self.minted = minted;
        self.journal.record(id, effects);
        Ok(())
    }

    /// Revert a previously applied transaction using its journal record
    pub fn revert(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
        let id = tx.id();
        let effects = self.journal.take(&id).ok_or(LedgerError::NotApplied(id))?;
        self.undo(&effects)?;
        self.minted = self.minted.saturating_sub(effects.minted);
        Ok(())
    }

    /// Release journal records for transactions that are too deep to revert
    pub fn forget<'a, I: IntoIterator<Item = &'a TxId>>(&mut self, ids: I) -> usize {
        self.journal.forget(ids)
    }

    /// Balance-only view for dry-running a sequence of transactions
    pub fn overlay(&self) -> BalanceOverlay<'_> {
        BalanceOverlay {
            ledger: self,
            balances: HashMap::new(),
            applied: HashSet::new(),
        }
    }

    /// Every account sums its entries, and total supply equals minted supply
    pub fn verify_integrity(&self) -> Result<(), LedgerError> {
        for (address, account) in &self.accounts {
            if !account.verify() {
                return Err(LedgerError::Corrupted(format!(
                    "entries of {} do not sum to its balance",
                    address
                )));
            }
        }
        if self.total_supply() != self.minted {
            return Err(LedgerError::Corrupted(format!(
                "total supply {} differs from minted {}",
                self.total_supply(),
                self.minted
            )));
        }
        Ok(())
    }

    fn check_movements<F>(&self, tx: &Transaction, movements: &Movements, balance_of: F) -> Result<(), LedgerError>
    where
        F: Fn(&Address) -> Amount,
    {
        if tx.is_system() {
            if !tx.sender().is_system() {
                return Err(LedgerError::InvalidAmount(format!(
                    "{} must be minted by the system address",
                    tx.kind()
                )));
            }
            return Ok(());
        }

        if tx.sender().is_system() || self.is_unspendable(tx.sender()) {
            return Err(LedgerError::UnspendableSource(tx.sender().clone()));
        }
        if tx.amount().is_zero() {
            return Err(LedgerError::InvalidAmount("amount cannot be zero".into()));
        }

        let mut spent: HashMap<&Address, Amount> = HashMap::new();
        for (address, amount) in &movements.debits {
            let so_far = spent.entry(address).or_insert(Amount::ZERO);
            let required = so_far
                .checked_add(*amount)
                .ok_or_else(|| LedgerError::InvalidAmount("debit overflow".into()))?;
            let available = balance_of(address);
            if available < required {
                return Err(LedgerError::InsufficientFunds {
                    address: address.clone(),
                    required,
                    available,
                });
            }
            *so_far = required;
        }
        Ok(())
    }

    fn mutate(&mut self, id: TxId, movements: &Movements, effects: &mut TxEffects) -> Result<(), LedgerError> {
        for (address, amount) in &movements.debits {
            let account = self
                .accounts
                .get_mut(address)
                .ok_or_else(|| LedgerError::Corrupted(format!("no account for {}", address)))?;
            let record = account.debit(*amount)?;
            if account.is_empty() {
                self.accounts.remove(address);
            }
            effects.debits.push((address.clone(), record));
        }
        for (address, amount) in &movements.credits {
            let entry = LedgerEntry::new(id, *amount);
            self.accounts
                .entry(address.clone())
                .or_default()
                .credit(entry.clone())?;
            effects.credits.push((address.clone(), entry));
        }
        Ok(())
    }

    fn undo(&mut self, effects: &TxEffects) -> Result<(), LedgerError> {
        for (address, entry) in effects.credits.iter().rev() {
            let account = self
                .accounts
                .get_mut(address)
                .ok_or_else(|| LedgerError::Corrupted(format!("no account for {}", address)))?;
            account.remove_entry(entry)?;
            if account.is_empty() {
                self.accounts.remove(address);
            }
        }
        for (address, record) in effects.debits.iter().rev() {
            self.accounts
                .entry(address.clone())
                .or_default()
                .undo_debit(record)?;
        }
        Ok(())
    }
}

/// Balances layered over a ledger. Applying a transaction here updates only
/// the overlay, which is how blocks and candidate blocks are dry-run.
pub struct BalanceOverlay<'a> {
    ledger: &'a Ledger,
    balances: HashMap<Address, Amount>,
    applied: HashSet<TxId>,
}

impl<'a> BalanceOverlay<'a> {
    pub fn balance(&self, address: &Address) -> Amount {
        self.balances
            .get(address)
            .copied()
            .unwrap_or_else(|| self.ledger.get_balance(address))
    }

    /// Check and apply `tx` to the overlay
    pub fn apply(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
        let id = tx.id();
        if self.applied.contains(&id) || self.ledger.journal.contains(&id) {
            return Err(LedgerError::AlreadyApplied(id));
        }
        let movements = Movements::of(tx)?;
        self.ledger
            .check_movements(tx, &movements, |a| self.balance(a))?;

        for (address, amount) in &movements.debits {
            let next = self.balance(address).saturating_sub(*amount);
            self.balances.insert(address.clone(), next);
        }
        for (address, amount) in &movements.credits {
            let next = self
                .balance(address)
                .checked_add(*amount)
                .ok_or_else(|| LedgerError::InvalidAmount("balance overflow".into()))?;
            self.balances.insert(address.clone(), next);
        }
        self.applied.insert(id);
        Ok(())
    }
}
