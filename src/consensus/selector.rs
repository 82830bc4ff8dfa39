use crate::consensus::ValidatorRegistry;
use crate::hash::{sha256_concat, BlockHash};
use crate::identity::Address;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

const SELECTION_DOMAIN: &[u8] = b"stakechain:select";

/// Deterministic, stake-weighted proposer selection.
///
/// Every node derives the same proposer from `(height, prev_hash)` and the
/// same validator set. The selector reads the registry and never mutates it;
/// `last_selected_height` moves only when the proposer's block is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidatorSelector {
    cooldown_blocks: u64,
}

impl ValidatorSelector {
    /// `cooldown_blocks`: a validator that proposed within this many heights
    /// is skipped, unless skipping would leave nobody eligible
    pub fn new(cooldown_blocks: u64) -> Self {
        Self { cooldown_blocks }
    }

    pub fn cooldown_blocks(&self) -> u64 {
        self.cooldown_blocks
    }

    /// Seed for the selection at `height` on top of `prev_hash`
    pub fn seed(height: u64, prev_hash: &BlockHash) -> [u8; 32] {
        sha256_concat(&[SELECTION_DOMAIN, &height.to_le_bytes(), prev_hash.as_bytes()])
    }

    /// Pick the proposer for `height`. `None` when no validator is eligible.
    pub fn select(
        &self,
        registry: &ValidatorRegistry,
        height: u64,
        prev_hash: &BlockHash,
        now: u64,
    ) -> Option<Address> {
        let eligible = registry.active_validators(now);
        if eligible.is_empty() {
            return None;
        }

        let rested: Vec<_> = eligible
            .iter()
            .filter(|v| {
                v.last_selected_height
                    .map_or(true, |last| height.saturating_sub(last) > self.cooldown_blocks)
            })
            .collect();
        let pool: Vec<_> = if rested.is_empty() {
            eligible.iter().collect()
        } else {
            rested
        };

        // Weight is stake in units of the minimum stake, at least one share
        let unit = registry.min_stake().units().max(1);
        let weights: Vec<u128> = pool
            .iter()
            .map(|v| (v.effective_stake().units() / unit).max(1) as u128)
            .collect();
        let total: u128 = weights.iter().sum();

        let mut rng = ChaCha20Rng::from_seed(Self::seed(height, prev_hash));
        let mut ticket = rng.gen_range(0..total);
        for (validator, weight) in pool.iter().zip(weights) {
            if ticket < weight {
                return Some(validator.address.clone());
            }
            ticket -= weight;
        }
        None
    }
}

impl Default for ValidatorSelector {
    fn default() -> Self {
        Self::new(1)
    }
}
