use crate::identity::{Address, SignatureVerifier};
use crate::tx::{Amount, Transaction, TxData, TxKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when validating a transaction on its own,
/// before any ledger state is consulted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing signature: {0} transactions must be signed")]
    MissingSignature(TxKind),

    #[error("Invalid signature: signature does not match the transaction content")]
    InvalidSignature,

    #[error("Unexpected signature: {0} transactions are never signed")]
    UnexpectedSignature(TxKind),

    #[error("Invalid sender {sender}: {reason}")]
    InvalidSender { sender: Address, reason: String },

    #[error("Invalid recipient {recipient}: {reason}")]
    InvalidRecipient { recipient: Address, reason: String },

    #[error("Self-transfer not allowed: sender and recipient cannot be the same")]
    SelfTransfer,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Fee too low: required {required}, got {got}")]
    FeeTooLow { required: Amount, got: Amount },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{kind} below minimum: minimum {minimum}, got {got}")]
    BelowMinimum {
        kind: TxKind,
        minimum: Amount,
        got: Amount,
    },

    #[error("Future timestamp: {timestamp} is more than {tolerance}s ahead of {now}")]
    FutureTimestamp { timestamp: u64, now: u64, tolerance: u64 },

    #[error("Expired: transaction from {timestamp} is older than {max_age}s")]
    Expired { timestamp: u64, max_age: u64 },

    #[error("{0} transactions are only valid inside blocks")]
    SystemTransaction(TxKind),
}

/// Stateless admission rules for transactions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRules {
    /// Minimum absolute fee for user transactions
    pub min_fee: Amount,
    /// Minimum fee per serialized byte, in base units
    pub min_fee_per_byte: u64,
    /// Smallest delegation accepted
    pub min_delegation: Amount,
    /// How far ahead of local time a timestamp may be
    pub future_tolerance_secs: u64,
}

impl Default for TxRules {
    fn default() -> Self {
        Self {
            min_fee: Amount::from_units(10_000),
            min_fee_per_byte: 1,
            min_delegation: Amount::from_coins(10),
            future_tolerance_secs: 300,
        }
    }
}

impl TxRules {
    /// Fee a transaction of this size must at least carry
    pub fn required_fee(&self, tx: &Transaction) -> Amount {
        let by_size = Amount::from_units(self.min_fee_per_byte.saturating_mul(tx.encoded_size() as u64));
        self.min_fee.max(by_size)
    }
}

/// Validator for individual transactions
pub struct TxValidator;

impl TxValidator {
    /// Shape and kind-specific rules. Does not check the signature.
    pub fn validate_structure(tx: &Transaction, rules: &TxRules) -> Result<(), ValidationError> {
        let kind = tx.kind();

        if kind.is_system() {
            return Self::validate_system(tx);
        }

        if tx.sender().is_reserved() {
            return Err(ValidationError::InvalidSender {
                sender: tx.sender().clone(),
                reason: "reserved addresses cannot send".into(),
            });
        }

        if tx.amount().is_zero() {
            return Err(ValidationError::InvalidAmount("amount cannot be zero".into()));
        }
        if tx.total_cost().is_none() {
            return Err(ValidationError::InvalidAmount("amount plus fee overflows".into()));
        }

        let required = rules.required_fee(tx);
        if tx.fee() < required {
            return Err(ValidationError::FeeTooLow {
                required,
                got: tx.fee(),
            });
        }

        match tx.data() {
            TxData::Transfer => {
                if tx.sender() == tx.recipient() {
                    return Err(ValidationError::SelfTransfer);
                }
                if tx.recipient().is_system() || tx.recipient().is_escrow() {
                    return Err(ValidationError::InvalidRecipient {
                        recipient: tx.recipient().clone(),
                        reason: "protocol address cannot receive transfers".into(),
                    });
                }
            }
            TxData::Stake { validator } => {
                Self::expect_self_validator(tx, validator)?;
                Self::expect_recipient(tx, &Address::escrow())?;
            }
            TxData::Unstake { validator, .. } | TxData::ClaimReward { validator } => {
                Self::expect_self_validator(tx, validator)?;
                Self::expect_recipient(tx, tx.sender())?;
            }
            TxData::Delegate { validator } => {
                Self::expect_foreign_validator(tx, validator)?;
                Self::expect_recipient(tx, &Address::escrow())?;
                if tx.amount() < rules.min_delegation {
                    return Err(ValidationError::BelowMinimum {
                        kind,
                        minimum: rules.min_delegation,
                        got: tx.amount(),
                    });
                }
            }
            TxData::Undelegate { validator, .. } => {
                Self::expect_foreign_validator(tx, validator)?;
                Self::expect_recipient(tx, tx.sender())?;
            }
            TxData::Genesis { .. } | TxData::MiningReward => {
                return Err(ValidationError::SystemTransaction(kind));
            }
        }

        Ok(())
    }

    /// Signature presence and validity
    pub fn verify_signature(tx: &Transaction, verifier: &dyn SignatureVerifier) -> Result<(), ValidationError> {
        let kind = tx.kind();
        if kind.is_system() {
            if tx.is_signed() {
                return Err(ValidationError::UnexpectedSignature(kind));
            }
            return Ok(());
        }
        if !tx.is_signed() {
            return Err(ValidationError::MissingSignature(kind));
        }
        if !tx.verify_signature(verifier) {
            return Err(ValidationError::InvalidSignature);
        }
        Ok(())
    }

    /// Clock skew and age checks. `max_age_secs` of `None` skips the age check.
    pub fn validate_time(
        tx: &Transaction,
        now: u64,
        rules: &TxRules,
        max_age_secs: Option<u64>,
    ) -> Result<(), ValidationError> {
        if tx.timestamp() > now.saturating_add(rules.future_tolerance_secs) {
            return Err(ValidationError::FutureTimestamp {
                timestamp: tx.timestamp(),
                now,
                tolerance: rules.future_tolerance_secs,
            });
        }
        if let Some(max_age) = max_age_secs {
            if tx.timestamp().saturating_add(max_age) < now {
                return Err(ValidationError::Expired {
                    timestamp: tx.timestamp(),
                    max_age,
                });
            }
        }
        Ok(())
    }

    /// Full stateless validation of a user transaction
    ///
    /// This performs:
    /// - Rejection of protocol-minted kinds
    /// - Structure and kind-specific payload rules
    /// - Signature verification
    /// - Timestamp skew and age checks
    pub fn validate(
        tx: &Transaction,
        verifier: &dyn SignatureVerifier,
        rules: &TxRules,
        now: u64,
        max_age_secs: Option<u64>,
    ) -> Result<(), ValidationError> {
        if tx.is_system() {
            return Err(ValidationError::SystemTransaction(tx.kind()));
        }
        Self::validate_structure(tx, rules)?;
        Self::verify_signature(tx, verifier)?;
        Self::validate_time(tx, now, rules, max_age_secs)
    }

    fn validate_system(tx: &Transaction) -> Result<(), ValidationError> {
        if !tx.sender().is_system() {
            return Err(ValidationError::InvalidSender {
                sender: tx.sender().clone(),
                reason: format!("{} must come from the system address", tx.kind()),
            });
        }
        if !tx.fee().is_zero() {
            return Err(ValidationError::InvalidAmount(format!("{} carries no fee", tx.kind())));
        }
        if tx.amount().is_zero() && tx.kind() == TxKind::Genesis {
            return Err(ValidationError::InvalidAmount("genesis allocation cannot be zero".into()));
        }
        if tx.recipient().is_system() || tx.recipient().is_escrow() {
            return Err(ValidationError::InvalidRecipient {
                recipient: tx.recipient().clone(),
                reason: "protocol address cannot receive minted value".into(),
            });
        }
        Ok(())
    }

    fn expect_self_validator(tx: &Transaction, validator: &Address) -> Result<(), ValidationError> {
        if validator != tx.sender() {
            return Err(ValidationError::InvalidPayload(format!(
                "{} must name the sender as validator, got {}",
                tx.kind(),
                validator
            )));
        }
        Ok(())
    }

    fn expect_foreign_validator(tx: &Transaction, validator: &Address) -> Result<(), ValidationError> {
        if validator.is_reserved() {
            return Err(ValidationError::InvalidPayload(format!(
                "{} cannot target reserved address {}",
                tx.kind(),
                validator
            )));
        }
        if validator == tx.sender() {
            return Err(ValidationError::InvalidPayload(
                "validators stake directly instead of delegating to themselves".into(),
            ));
        }
        Ok(())
    }

    fn expect_recipient(tx: &Transaction, expected: &Address) -> Result<(), ValidationError> {
        if tx.recipient() != expected {
            return Err(ValidationError::InvalidRecipient {
                recipient: tx.recipient().clone(),
                reason: format!("{} must pay {}", tx.kind(), expected),
            });
        }
        Ok(())
    }
}
