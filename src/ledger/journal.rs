// Journal of applied transactions, kept so a block can be reverted exactly

use crate::hash::TxId;
use crate::identity::Address;
use crate::ledger::LedgerEntry;
use crate::tx::Amount;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What one debit took out of an account
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitRecord {
    /// Entries removed, at their full original amount
    pub consumed: Vec<LedgerEntry>,
    /// Leftover of the last consumed entry, put back under the same source
    pub remainder: Option<LedgerEntry>,
}

/// Every ledger mutation made by one transaction
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEffects {
    pub debits: Vec<(Address, DebitRecord)>,
    pub credits: Vec<(Address, LedgerEntry)>,
    pub minted: Amount,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    records: HashMap<TxId, TxEffects>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &TxId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn record(&mut self, id: TxId, effects: TxEffects) {
        self.records.insert(id, effects);
    }

    pub(crate) fn take(&mut self, id: &TxId) -> Option<TxEffects> {
        self.records.remove(id)
    }

    /// Drop records that can no longer be reverted
    pub fn forget<'a, I: IntoIterator<Item = &'a TxId>>(&mut self, ids: I) -> usize {
        ids.into_iter()
            .filter(|id| self.records.remove(id).is_some())
            .count()
    }
}
