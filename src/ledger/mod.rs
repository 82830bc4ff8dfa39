// Ledger module - balances backed by unspent entries, with exact revert

mod entry;
mod journal;
mod store;

pub use entry::{Account, LedgerEntry};
pub use journal::{DebitRecord, Journal, TxEffects};
pub use store::{BalanceOverlay, Ledger, LedgerError, Movements};
