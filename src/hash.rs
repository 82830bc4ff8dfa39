// Content hashes - 32-byte SHA-256 digests used as transaction ids and block hashes

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hash arbitrary bytes with SHA-256
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Hash the concatenation of several byte slices
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

macro_rules! digest_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name([u8; 32]);

        impl $name {
            /// The all-zero value
            pub const ZERO: Self = Self([0u8; 32]);

            /// Create from raw bytes
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Digest arbitrary content
            pub fn digest(bytes: &[u8]) -> Self {
                Self(sha256(bytes))
            }

            /// Get the raw bytes
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Lowercase hex encoding
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from a 64-character hex string
            pub fn from_hex(s: &str) -> Result<Self, HashParseError> {
                let bytes = hex::decode(s).map_err(|e| HashParseError::InvalidHex(e.to_string()))?;
                if bytes.len() != 32 {
                    return Err(HashParseError::InvalidLength(bytes.len()));
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }

            /// Abbreviated form for log lines
            pub fn short(&self) -> String {
                hex::encode(&self.0[..6])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_hex())
                } else {
                    self.0.serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    Self::from_hex(&s).map_err(serde::de::Error::custom)
                } else {
                    let bytes = <[u8; 32]>::deserialize(deserializer)?;
                    Ok(Self(bytes))
                }
            }
        }
    };
}

/// Errors from parsing a hex-encoded digest
#[derive(thiserror::Error, Debug)]
pub enum HashParseError {
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Invalid digest length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

digest_type!(
    /// Transaction id - SHA-256 over the transaction content
    TxId
);

digest_type!(
    /// Block hash - SHA-256 over the block header
    BlockHash
);

digest_type!(
    /// Merkle root over the transaction ids of a block
    MerkleRoot
);
