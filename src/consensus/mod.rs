// Consensus module - validator registry, proposer selection, finality and slashing

mod finality;
mod registry;
mod selector;
mod slashing;

pub use finality::{BlockVote, FinalityError, Finalizer, VoteOutcome};
pub use registry::{RegistryError, RegistryUndo, SlashOutcome, Validator, ValidatorRegistry, ValidatorStats};
pub use selector::ValidatorSelector;
pub use slashing::{
    ForkEvidence, SignedHeader, SlashingConfig, SlashingEngine, SlashingError, SlashingEvent, SlashingReason,
};
