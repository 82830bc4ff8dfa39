use crate::identity::{KeypairError, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Sender of minted value (genesis allocations and block rewards)
const SYSTEM: &str = "0";
/// Pool holding staked, delegated and fee funds
const ESCROW: &str = "0:stake-escrow";
/// Receives the genesis burn allocation; nobody holds its key
const UNSPENDABLE: &str = "0:unspendable";

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("Invalid address format: {0}")]
    InvalidFormat(String),

    #[error("Invalid base58 encoding: {0}")]
    InvalidBase58(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(#[from] KeypairError),

    #[error("Address {0} is reserved and has no public key")]
    Reserved(String),
}

/// Ledger address: the base58 text of an Ed25519 public key, or one of the
/// reserved protocol addresses.
///
/// Reserved addresses contain characters outside the base58 alphabet, so they
/// can never collide with a key-derived address and can never produce a
/// valid signature.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Derive the address of a public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(public_key.to_base58())
    }

    /// Parse and validate an address string
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        if s.is_empty() {
            return Err(AddressError::InvalidFormat("address cannot be empty".into()));
        }
        if matches!(s, SYSTEM | ESCROW | UNSPENDABLE) {
            return Ok(Self(s.to_string()));
        }

        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| AddressError::InvalidBase58(e.to_string()))?;
        PublicKey::from_bytes(&bytes)?;

        Ok(Self(s.to_string()))
    }

    pub fn system() -> Self {
        Self(SYSTEM.to_string())
    }

    pub fn escrow() -> Self {
        Self(ESCROW.to_string())
    }

    pub fn unspendable() -> Self {
        Self(UNSPENDABLE.to_string())
    }

    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM
    }

    pub fn is_escrow(&self) -> bool {
        self.0 == ESCROW
    }

    /// True for any protocol address that no key controls
    pub fn is_reserved(&self) -> bool {
        matches!(self.0.as_str(), SYSTEM | ESCROW | UNSPENDABLE)
    }

    /// Recover the public key this address was derived from
    pub fn public_key(&self) -> Result<PublicKey, AddressError> {
        if self.is_reserved() {
            return Err(AddressError::Reserved(self.0.clone()));
        }
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| AddressError::InvalidBase58(e.to_string()))?;
        Ok(PublicKey::from_bytes(&bytes)?)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First characters of the address, for log lines
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}
