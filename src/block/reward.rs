use crate::tx::Amount;
use serde::{Deserialize, Serialize};

/// Halving block reward schedule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSchedule {
    pub initial_reward: Amount,
    pub halving_interval: u64,
}

impl Default for RewardSchedule {
    fn default() -> Self {
        Self {
            initial_reward: Amount::from_coins(50),
            halving_interval: 210_000,
        }
    }
}

impl RewardSchedule {
    pub fn new(initial_reward: Amount, halving_interval: u64) -> Self {
        Self {
            initial_reward,
            halving_interval,
        }
    }

    /// Number of halvings in effect at `height`
    pub fn halvings(&self, height: u64) -> u64 {
        height / self.halving_interval.max(1)
    }

    /// `initial / 2^halvings`, zero from the 64th halving on
    pub fn reward_at(&self, height: u64) -> Amount {
        let halvings = self.halvings(height);
        if halvings >= 64 {
            return Amount::ZERO;
        }
        self.initial_reward.halved(halvings as u32)
    }
}

/// Block reward under the default schedule
pub fn block_reward(height: u64) -> Amount {
    RewardSchedule::default().reward_at(height)
}
