// Unspent entries and per-address accounts

use crate::hash::TxId;
use crate::ledger::{DebitRecord, LedgerError};
use crate::tx::Amount;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Value received by an address from one transaction and not yet spent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Transaction that produced the value
    pub source: TxId,
    pub amount: Amount,
}

impl LedgerEntry {
    pub fn new(source: TxId, amount: Amount) -> Self {
        Self { source, amount }
    }
}

/// Spend order: largest amount first, ties broken by ascending source id
fn spend_order(a: &LedgerEntry, b: &LedgerEntry) -> Ordering {
    b.amount.cmp(&a.amount).then_with(|| a.source.cmp(&b.source))
}

/// Balance of one address and the entries that make it up.
///
/// Entries are kept sorted in spend order, so consumption always walks from
/// the front and the result does not depend on arrival order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    balance: Amount,
    entries: Vec<LedgerEntry>,
}

impl Account {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    /// Unspent entries in spend order
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.balance.is_zero()
    }

    /// Balance equals the sum of the unspent entries
    pub fn verify(&self) -> bool {
        Amount::checked_sum(self.entries.iter().map(|e| e.amount)) == Some(self.balance)
    }

    pub(crate) fn credit(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        if entry.amount.is_zero() {
            return Ok(());
        }
        self.balance = self
            .balance
            .checked_add(entry.amount)
            .ok_or_else(|| LedgerError::InvalidAmount("balance overflow".into()))?;
        let pos = match self.entries.binary_search_by(|e| spend_order(e, &entry)) {
            Ok(i) | Err(i) => i,
        };
        self.entries.insert(pos, entry);
        Ok(())
    }

    /// Consume `amount` from the front of the entry list. The caller has
    /// already checked the balance; a shortfall here means corrupted state.
    pub(crate) fn debit(&mut self, amount: Amount) -> Result<DebitRecord, LedgerError> {
        if self.balance < amount {
            return Err(LedgerError::Corrupted(format!(
                "debit of {} exceeds balance {}",
                amount, self.balance
            )));
        }

        let mut remaining = amount;
        let mut record = DebitRecord::default();
        while !remaining.is_zero() {
            if self.entries.is_empty() {
                return Err(LedgerError::Corrupted("entries do not cover balance".into()));
            }
            let entry = self.entries.remove(0);
            match entry.amount.checked_sub(remaining) {
                Some(left) if !left.is_zero() => {
                    let remainder = LedgerEntry::new(entry.source, left);
                    record.consumed.push(entry);
                    record.remainder = Some(remainder.clone());
                    let pos = match self.entries.binary_search_by(|e| spend_order(e, &remainder)) {
                        Ok(i) | Err(i) => i,
                    };
                    self.entries.insert(pos, remainder);
                    remaining = Amount::ZERO;
                }
                _ => {
                    remaining = remaining.saturating_sub(entry.amount);
                    record.consumed.push(entry);
                }
            }
        }

        self.balance = self.balance.saturating_sub(amount);
        Ok(record)
    }

    pub(crate) fn undo_debit(&mut self, record: &DebitRecord) -> Result<(), LedgerError> {
        if let Some(remainder) = &record.remainder {
            self.remove_entry(remainder)?;
        }
        for entry in &record.consumed {
            self.credit(entry.clone())?;
        }
        Ok(())
    }

    pub(crate) fn remove_entry(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        if entry.amount.is_zero() {
            return Ok(());
        }
        let pos = self
            .entries
            .iter()
            .position(|e| e == entry)
            .ok_or_else(|| LedgerError::Corrupted(format!("missing entry from {}", entry.source)))?;
        self.entries.remove(pos);
        self.balance = self.balance.saturating_sub(entry.amount);
        Ok(())
    }
}
