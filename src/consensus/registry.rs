use crate::identity::Address;
use crate::tx::{Amount, Transaction, TxData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from validator registry operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Insufficient stake for {address}: minimum {minimum}, got {got}")]
    InsufficientStake {
        address: Address,
        minimum: Amount,
        got: Amount,
    },

    #[error("Validator {0} is already registered")]
    AlreadyRegistered(Address),

    #[error("Unknown validator {0}")]
    UnknownValidator(Address),

    #[error("Stake decrease of {requested} exceeds withdrawable stake {available} of {address}")]
    StakeUnderflow {
        address: Address,
        requested: Amount,
        available: Amount,
    },

    #[error("Delegation of {got} to {validator} is below the minimum {minimum}")]
    DelegationTooSmall {
        validator: Address,
        minimum: Amount,
        got: Amount,
    },

    #[error("{delegator} has delegated {available} to {validator}, cannot withdraw {requested}")]
    DelegationUnderflow {
        validator: Address,
        delegator: Address,
        requested: Amount,
        available: Amount,
    },

    #[error("{address} has {available} unclaimed rewards, cannot claim {requested}")]
    InsufficientRewards {
        address: Address,
        requested: Amount,
        available: Amount,
    },

    #[error("Validator {address} is jailed until {until}")]
    StillJailed { address: Address, until: u64 },

    #[error("Stake arithmetic overflow")]
    Overflow,
}

/// Cumulative validator statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorStats {
    pub blocks_proposed: u64,
    pub blocks_signed: u64,
    pub blocks_missed: u64,
    pub total_rewards: Amount,
    pub last_active: u64,
}

/// A validator and the stake behind it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    /// Own stake, locked part included
    pub stake: Amount,
    /// Part of `stake` that can never be withdrawn (the genesis allocation)
    pub locked_stake: Amount,
    pub delegations: BTreeMap<Address, Amount>,
    pub active: bool,
    pub jailed_until: Option<u64>,
    pub stats: ValidatorStats,
    pub unclaimed_rewards: Amount,
    pub last_selected_height: Option<u64>,
    pub registered_at: u64,
}

impl Validator {
    fn new(address: Address, stake: Amount, now: u64) -> Self {
        Self {
            address,
            stake,
            locked_stake: Amount::ZERO,
            delegations: BTreeMap::new(),
            active: true,
            jailed_until: None,
            stats: ValidatorStats {
                last_active: now,
                ..ValidatorStats::default()
            },
            unclaimed_rewards: Amount::ZERO,
            last_selected_height: None,
            registered_at: now,
        }
    }

    pub fn total_delegated(&self) -> Amount {
        self.delegations
            .values()
            .fold(Amount::ZERO, |acc, a| acc.saturating_add(*a))
    }

    /// Own stake plus every delegation
    pub fn effective_stake(&self) -> Amount {
        self.stake.saturating_add(self.total_delegated())
    }

    pub fn is_jailed(&self, now: u64) -> bool {
        self.jailed_until.is_some_and(|until| now < until)
    }

    /// Active and out of jail
    pub fn is_eligible(&self, now: u64) -> bool {
        self.active && !self.is_jailed(now)
    }

    /// Own stake that an Unstake may release
    pub fn withdrawable_stake(&self) -> Amount {
        self.stake.saturating_sub(self.locked_stake)
    }
}

/// Inverse of one registry mutation, recorded so block application can be undone
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryUndo {
    Registered(Address),
    StakeAdded { validator: Address, amount: Amount },
    StakeRemoved { validator: Address, amount: Amount },
    DelegationAdded { validator: Address, delegator: Address, amount: Amount },
    DelegationRemoved { validator: Address, delegator: Address, amount: Amount },
    RewardsCredited { validator: Address, amount: Amount },
    RewardsClaimed { validator: Address, amount: Amount },
    Proposed {
        validator: Address,
        prev_last_selected: Option<u64>,
        prev_last_active: u64,
    },
}

impl RegistryUndo {
    pub fn validator(&self) -> &Address {
        match self {
            RegistryUndo::Registered(validator)
            | RegistryUndo::StakeAdded { validator, .. }
            | RegistryUndo::StakeRemoved { validator, .. }
            | RegistryUndo::DelegationAdded { validator, .. }
            | RegistryUndo::DelegationRemoved { validator, .. }
            | RegistryUndo::RewardsCredited { validator, .. }
            | RegistryUndo::RewardsClaimed { validator, .. }
            | RegistryUndo::Proposed { validator, .. } => validator,
        }
    }
}

/// Outcome of a stake penalty
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlashOutcome {
    /// Stake actually removed
    pub deducted: Amount,
    /// The validator fell below the minimum and was dropped
    pub removed: bool,
}

/// Registry of validators and their stake
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRegistry {
    validators: BTreeMap<Address, Validator>,
    min_stake: Amount,
    min_delegation: Amount,
}

impl ValidatorRegistry {
    pub fn new(min_stake: Amount, min_delegation: Amount) -> Self {
        Self {
            validators: BTreeMap::new(),
            min_stake,
            min_delegation,
        }
    }

    pub fn min_stake(&self) -> Amount {
        self.min_stake
    }

    pub fn get(&self, address: &Address) -> Option<&Validator> {
        self.validators.get(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.validators.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// All validators ordered by address
    pub fn validators(&self) -> impl Iterator<Item = &Validator> {
        self.validators.values()
    }

    /// Validators that may propose and vote at `now`, ordered by address
    pub fn active_validators(&self, now: u64) -> Vec<&Validator> {
        self.validators
            .values()
            .filter(|v| v.is_eligible(now))
            .collect()
    }

    pub fn is_active(&self, address: &Address, now: u64) -> bool {
        self.validators
            .get(address)
            .is_some_and(|v| v.is_eligible(now))
    }

    /// Effective stake summed over eligible validators
    pub fn total_active_stake(&self, now: u64) -> Amount {
        self.active_validators(now)
            .iter()
            .fold(Amount::ZERO, |acc, v| acc.saturating_add(v.effective_stake()))
    }

    // ========================================================================
    // STAKE ACCOUNTING
    // ========================================================================

    /// Register a new validator with its initial stake
    pub fn register(&mut self, address: Address, stake: Amount, now: u64) -> Result<RegistryUndo, RegistryError> {
        if self.validators.contains_key(&address) {
            return Err(RegistryError::AlreadyRegistered(address));
        }
        if stake < self.min_stake {
            return Err(RegistryError::InsufficientStake {
                address,
                minimum: self.min_stake,
                got: stake,
            });
        }
        info!(validator = %address, stake = %stake, "validator registered");
        self.validators
            .insert(address.clone(), Validator::new(address.clone(), stake, now));
        Ok(RegistryUndo::Registered(address))
    }

    /// Register the genesis validator. Its stake is locked for good.
    pub fn register_locked(&mut self, address: Address, stake: Amount, now: u64) -> Result<(), RegistryError> {
        self.register(address.clone(), stake, now)?;
        if let Some(v) = self.validators.get_mut(&address) {
            v.locked_stake = stake;
        }
        Ok(())
    }

    /// Raise or lower a validator's own stake
    pub fn update_stake(
        &mut self,
        address: &Address,
        delta: Amount,
        is_addition: bool,
    ) -> Result<RegistryUndo, RegistryError> {
        let min_stake = self.min_stake;
        let v = self
            .validators
            .get_mut(address)
            .ok_or_else(|| RegistryError::UnknownValidator(address.clone()))?;

        if is_addition {
            v.stake = v.stake.checked_add(delta).ok_or(RegistryError::Overflow)?;
        } else {
            let available = v.withdrawable_stake();
            if delta > available {
                return Err(RegistryError::StakeUnderflow {
                    address: address.clone(),
                    requested: delta,
                    available,
                });
            }
            v.stake = v.stake.saturating_sub(delta);
        }
        Self::refresh(v, min_stake);

        Ok(if is_addition {
            RegistryUndo::StakeAdded {
                validator: address.clone(),
                amount: delta,
            }
        } else {
            RegistryUndo::StakeRemoved {
                validator: address.clone(),
                amount: delta,
            }
        })
    }

    pub fn add_delegation(
        &mut self,
        validator: &Address,
        delegator: &Address,
        amount: Amount,
    ) -> Result<RegistryUndo, RegistryError> {
        if amount < self.min_delegation {
            return Err(RegistryError::DelegationTooSmall {
                validator: validator.clone(),
                minimum: self.min_delegation,
                got: amount,
            });
        }
        let min_stake = self.min_stake;
        let v = self
            .validators
            .get_mut(validator)
            .ok_or_else(|| RegistryError::UnknownValidator(validator.clone()))?;
        let slot = v.delegations.entry(delegator.clone()).or_insert(Amount::ZERO);
        *slot = slot.checked_add(amount).ok_or(RegistryError::Overflow)?;
        Self::refresh(v, min_stake);
        Ok(RegistryUndo::DelegationAdded {
            validator: validator.clone(),
            delegator: delegator.clone(),
            amount,
        })
    }

    pub fn remove_delegation(
        &mut self,
        validator: &Address,
        delegator: &Address,
        amount: Amount,
    ) -> Result<RegistryUndo, RegistryError> {
        let min_stake = self.min_stake;
        let v = self
            .validators
            .get_mut(validator)
            .ok_or_else(|| RegistryError::UnknownValidator(validator.clone()))?;
        let available = v.delegations.get(delegator).copied().unwrap_or(Amount::ZERO);
        if amount > available {
            return Err(RegistryError::DelegationUnderflow {
                validator: validator.clone(),
                delegator: delegator.clone(),
                requested: amount,
                available,
            });
        }
        let left = available.saturating_sub(amount);
        if left.is_zero() {
            v.delegations.remove(delegator);
        } else {
            v.delegations.insert(delegator.clone(), left);
        }
        Self::refresh(v, min_stake);
        Ok(RegistryUndo::DelegationRemoved {
            validator: validator.clone(),
            delegator: delegator.clone(),
            amount,
        })
    }

    // ========================================================================
    // REWARDS AND STATISTICS
    // ========================================================================

    /// Add block fees to a validator's claimable rewards
    pub fn credit_rewards(&mut self, address: &Address, amount: Amount) -> Result<RegistryUndo, RegistryError> {
        let v = self
            .validators
            .get_mut(address)
            .ok_or_else(|| RegistryError::UnknownValidator(address.clone()))?;
        v.unclaimed_rewards = v.unclaimed_rewards.checked_add(amount).ok_or(RegistryError::Overflow)?;
        v.stats.total_rewards = v.stats.total_rewards.saturating_add(amount);
        Ok(RegistryUndo::RewardsCredited {
            validator: address.clone(),
            amount,
        })
    }

    pub fn claim_rewards(&mut self, address: &Address, amount: Amount) -> Result<RegistryUndo, RegistryError> {
        let v = self
            .validators
            .get_mut(address)
            .ok_or_else(|| RegistryError::UnknownValidator(address.clone()))?;
        if amount > v.unclaimed_rewards {
            return Err(RegistryError::InsufficientRewards {
                address: address.clone(),
                requested: amount,
                available: v.unclaimed_rewards,
            });
        }
        v.unclaimed_rewards = v.unclaimed_rewards.saturating_sub(amount);
        Ok(RegistryUndo::RewardsClaimed {
            validator: address.clone(),
            amount,
        })
    }

    /// Note that `address` proposed the block at `height`
    pub fn record_proposal(&mut self, address: &Address, height: u64, now: u64) -> Result<RegistryUndo, RegistryError> {
        let v = self
            .validators
            .get_mut(address)
            .ok_or_else(|| RegistryError::UnknownValidator(address.clone()))?;
        let undo = RegistryUndo::Proposed {
            validator: address.clone(),
            prev_last_selected: v.last_selected_height,
            prev_last_active: v.stats.last_active,
        };
        v.last_selected_height = Some(height);
        v.stats.blocks_proposed += 1;
        v.stats.last_active = v.stats.last_active.max(now);
        Ok(undo)
    }

    /// Note an accepted vote. Statistics only; not part of block undo.
    pub fn record_vote(&mut self, address: &Address, now: u64) {
        if let Some(v) = self.validators.get_mut(address) {
            v.stats.blocks_signed += 1;
            v.stats.last_active = v.stats.last_active.max(now);
        }
    }

    /// Note a slot the selected validator failed to fill
    pub fn record_missed(&mut self, address: &Address) {
        if let Some(v) = self.validators.get_mut(address) {
            v.stats.blocks_missed += 1;
        }
    }

    // ========================================================================
    // JAIL AND PENALTIES
    // ========================================================================

    pub fn jail(&mut self, address: &Address, until: u64) -> Result<(), RegistryError> {
        let v = self
            .validators
            .get_mut(address)
            .ok_or_else(|| RegistryError::UnknownValidator(address.clone()))?;
        v.active = false;
        v.jailed_until = Some(until);
        info!(validator = %address, until, "validator jailed");
        Ok(())
    }

    /// Leave jail once the cooldown is over and stake still meets the minimum
    pub fn unjail(&mut self, address: &Address, now: u64) -> Result<(), RegistryError> {
        let min_stake = self.min_stake;
        let v = self
            .validators
            .get_mut(address)
            .ok_or_else(|| RegistryError::UnknownValidator(address.clone()))?;
        if let Some(until) = v.jailed_until {
            if now < until {
                return Err(RegistryError::StillJailed {
                    address: address.clone(),
                    until,
                });
            }
        }
        if v.effective_stake() < min_stake {
            return Err(RegistryError::InsufficientStake {
                address: address.clone(),
                minimum: min_stake,
                got: v.effective_stake(),
            });
        }
        v.jailed_until = None;
        v.active = true;
        v.stats.last_active = v.stats.last_active.max(now);
        Ok(())
    }

    /// Deduct `penalty` from own stake first, then from delegations in
    /// delegator order. A validator left below the minimum is removed.
    pub fn slash(&mut self, address: &Address, penalty: Amount) -> Result<SlashOutcome, RegistryError> {
        let v = self
            .validators
            .get_mut(address)
            .ok_or_else(|| RegistryError::UnknownValidator(address.clone()))?;

        let mut remaining = penalty.min(v.effective_stake());
        let deducted = remaining;

        let from_own = remaining.min(v.stake);
        v.stake = v.stake.saturating_sub(from_own);
        v.locked_stake = v.locked_stake.min(v.stake);
        remaining = remaining.saturating_sub(from_own);

        if !remaining.is_zero() {
            let delegators: Vec<Address> = v.delegations.keys().cloned().collect();
            for delegator in delegators {
                if remaining.is_zero() {
                    break;
                }
                let held = v.delegations.get(&delegator).copied().unwrap_or(Amount::ZERO);
                let cut = remaining.min(held);
                remaining = remaining.saturating_sub(cut);
                let left = held.saturating_sub(cut);
                if left.is_zero() {
                    v.delegations.remove(&delegator);
                } else {
                    v.delegations.insert(delegator, left);
                }
            }
        }

        let removed = v.effective_stake() < self.min_stake;
        if removed {
            self.validators.remove(address);
            info!(validator = %address, penalty = %deducted, "validator removed after slashing");
        } else {
            debug!(validator = %address, penalty = %deducted, "validator stake reduced");
        }
        Ok(SlashOutcome { deducted, removed })
    }

    // ========================================================================
    // BLOCK-LEVEL APPLICATION
    // ========================================================================

    /// Apply the registry side of a staking transaction
    pub fn apply_transaction(&mut self, tx: &Transaction, now: u64) -> Result<Option<RegistryUndo>, RegistryError> {
        let sender = tx.sender();
        let undo = match tx.data() {
            TxData::Stake { .. } => {
                if self.contains(sender) {
                    self.update_stake(sender, tx.amount(), true)?
                } else {
                    self.register(sender.clone(), tx.amount(), now)?
                }
            }
            TxData::Unstake { .. } => self.update_stake(sender, tx.amount(), false)?,
            TxData::Delegate { validator } => self.add_delegation(validator, sender, tx.amount())?,
            TxData::Undelegate { validator, .. } => self.remove_delegation(validator, sender, tx.amount())?,
            TxData::ClaimReward { .. } => self.claim_rewards(sender, tx.amount())?,
            TxData::Transfer | TxData::Genesis { .. } | TxData::MiningReward => return Ok(None),
        };
        Ok(Some(undo))
    }

    /// Reverse one recorded mutation. A validator removed by slashing since
    /// the mutation was recorded stays removed.
    pub fn undo(&mut self, undo: &RegistryUndo) -> Result<(), RegistryError> {
        let min_stake = self.min_stake;
        if !self.contains(undo.validator()) {
            debug!(validator = %undo.validator(), "skipping undo for removed validator");
            return Ok(());
        }
        match undo {
            RegistryUndo::Registered(address) => {
                self.validators.remove(address);
            }
            RegistryUndo::StakeAdded { validator, amount } => {
                let v = self.validator_mut(validator)?;
                v.stake = v.stake.saturating_sub(*amount);
                Self::refresh(v, min_stake);
            }
            RegistryUndo::StakeRemoved { validator, amount } => {
                let v = self.validator_mut(validator)?;
                v.stake = v.stake.checked_add(*amount).ok_or(RegistryError::Overflow)?;
                Self::refresh(v, min_stake);
            }
            RegistryUndo::DelegationAdded {
                validator,
                delegator,
                amount,
            } => {
                let v = self.validator_mut(validator)?;
                let held = v.delegations.get(delegator).copied().unwrap_or(Amount::ZERO);
                let left = held.saturating_sub(*amount);
                if left.is_zero() {
                    v.delegations.remove(delegator);
                } else {
                    v.delegations.insert(delegator.clone(), left);
                }
                Self::refresh(v, min_stake);
            }
            RegistryUndo::DelegationRemoved {
                validator,
                delegator,
                amount,
            } => {
                let v = self.validator_mut(validator)?;
                let slot = v.delegations.entry(delegator.clone()).or_insert(Amount::ZERO);
                *slot = slot.checked_add(*amount).ok_or(RegistryError::Overflow)?;
                Self::refresh(v, min_stake);
            }
            RegistryUndo::RewardsCredited { validator, amount } => {
                let v = self.validator_mut(validator)?;
                v.unclaimed_rewards = v.unclaimed_rewards.saturating_sub(*amount);
                v.stats.total_rewards = v.stats.total_rewards.saturating_sub(*amount);
            }
            RegistryUndo::RewardsClaimed { validator, amount } => {
                let v = self.validator_mut(validator)?;
                v.unclaimed_rewards = v.unclaimed_rewards.checked_add(*amount).ok_or(RegistryError::Overflow)?;
            }
            RegistryUndo::Proposed {
                validator,
                prev_last_selected,
                prev_last_active,
            } => {
                let v = self.validator_mut(validator)?;
                v.last_selected_height = *prev_last_selected;
                v.stats.last_active = *prev_last_active;
                v.stats.blocks_proposed = v.stats.blocks_proposed.saturating_sub(1);
            }
        }
        Ok(())
    }

    fn validator_mut(&mut self, address: &Address) -> Result<&mut Validator, RegistryError> {
        self.validators
            .get_mut(address)
            .ok_or_else(|| RegistryError::UnknownValidator(address.clone()))
    }

    /// Deactivate below the minimum; reactivate above it unless jailed
    fn refresh(v: &mut Validator, min_stake: Amount) {
        if v.effective_stake() < min_stake {
            if v.active {
                debug!(validator = %v.address, "validator deactivated below minimum stake");
            }
            v.active = false;
        } else if v.jailed_until.is_none() {
            v.active = true;
        }
    }
}
