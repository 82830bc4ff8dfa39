// Fixed-point coin amounts

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of decimal places an amount carries
pub const DECIMALS: u32 = 8;

/// Base units in one whole coin
pub const UNITS_PER_COIN: u64 = 100_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid amount '{0}'")]
    Invalid(String),

    #[error("Too many decimal places in '{0}' (max {DECIMALS})")]
    TooPrecise(String),

    #[error("Amount overflow")]
    Overflow,
}

/// Non-negative coin amount stored as an integer count of base units.
///
/// Arithmetic is checked; ledger code never wraps or saturates silently.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    pub const fn from_units(units: u64) -> Self {
        Self(units)
    }

    /// Whole coins. Saturates at `Amount::MAX`.
    pub const fn from_coins(coins: u64) -> Self {
        Self(coins.saturating_mul(UNITS_PER_COIN))
    }

    pub const fn units(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Halve `n` times (used by the reward schedule)
    pub fn halved(self, n: u32) -> Self {
        if n >= 64 {
            Self::ZERO
        } else {
            Self(self.0 >> n)
        }
    }

    /// `self * numerator / denominator`, rounded down, computed in 128 bits
    pub fn mul_ratio(self, numerator: u64, denominator: u64) -> Self {
        if denominator == 0 {
            return Self::ZERO;
        }
        let scaled = (self.0 as u128) * (numerator as u128) / (denominator as u128);
        Self(scaled.min(u64::MAX as u128) as u64)
    }

    /// Sum a sequence, failing on overflow
    pub fn checked_sum<I: IntoIterator<Item = Amount>>(iter: I) -> Option<Self> {
        iter.into_iter()
            .try_fold(Self::ZERO, |acc, amount| acc.checked_add(amount))
    }

    /// Parse a decimal string such as "150", "0.0001" or "12.5"
    pub fn parse(s: &str) -> Result<Self, AmountError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountError::Invalid(s.to_string()));
        }

        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(AmountError::Invalid(s.to_string()));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(AmountError::Invalid(s.to_string()));
        }
        if frac.len() > DECIMALS as usize {
            return Err(AmountError::TooPrecise(s.to_string()));
        }

        let whole_units = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<u64>()
                .map_err(|_| AmountError::Overflow)?
                .checked_mul(UNITS_PER_COIN)
                .ok_or(AmountError::Overflow)?
        };

        let frac_units = if frac.is_empty() {
            0
        } else {
            let padded = format!("{:0<width$}", frac, width = DECIMALS as usize);
            padded.parse::<u64>().map_err(|_| AmountError::Invalid(s.to_string()))?
        };

        whole_units
            .checked_add(frac_units)
            .map(Self)
            .ok_or(AmountError::Overflow)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / UNITS_PER_COIN;
        let frac = self.0 % UNITS_PER_COIN;
        if frac == 0 {
            return write!(f, "{}", whole);
        }
        let digits = format!("{:0width$}", frac, width = DECIMALS as usize);
        write!(f, "{}.{}", whole, digits.trim_end_matches('0'))
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
