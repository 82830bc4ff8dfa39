use crate::identity::{Address, SigningService};
use crate::tx::{Amount, Transaction, TxData};
use rand::Rng;
use thiserror::Error;

/// Fee attached when the caller does not choose one (0.0001 coin)
pub const DEFAULT_FEE: Amount = Amount::from_units(10_000);

/// Errors that can occur when building or signing a transaction
#[derive(Error, Debug)]
pub enum TxError {
    #[error("Missing signer: the sender's signing service is required")]
    MissingSigner,

    #[error("Missing recipient: transfer recipient is required")]
    MissingRecipient,

    #[error("Missing amount: transaction amount is required")]
    MissingAmount,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Self-transfer not allowed: sender and recipient cannot be the same")]
    SelfTransfer,

    #[error("{0} transactions are minted by the protocol and cannot be built by a wallet")]
    SystemKind(crate::tx::TxKind),

    #[error("Transaction is already signed")]
    AlreadySigned,

    #[error("Signer does not own the sender address")]
    SignerMismatch,
}

/// Builder for signed user transactions.
///
/// The recipient of staking kinds is implied: Stake and Delegate pay into the
/// stake escrow, Unstake, Undelegate and ClaimReward pay back to the sender.
pub struct TxBuilder<'a> {
    signer: Option<&'a dyn SigningService>,
    recipient: Option<Address>,
    amount: Option<Amount>,
    fee: Option<Amount>,
    nonce: Option<u64>,
    timestamp: Option<u64>,
    data: TxData,
}

impl<'a> TxBuilder<'a> {
    pub fn new() -> Self {
        Self {
            signer: None,
            recipient: None,
            amount: None,
            fee: None,
            nonce: None,
            timestamp: None,
            data: TxData::Transfer,
        }
    }

    /// Set the signing service of the sender (required)
    pub fn signer(mut self, signer: &'a dyn SigningService) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Set the transfer recipient (required for transfers)
    pub fn recipient(mut self, recipient: Address) -> Self {
        self.recipient = Some(recipient);
        self
    }

    /// Set the amount (required)
    pub fn amount(mut self, amount: Amount) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Set the fee (optional - `DEFAULT_FEE` otherwise)
    pub fn fee(mut self, fee: Amount) -> Self {
        self.fee = Some(fee);
        self
    }

    /// Set the nonce (optional - random otherwise)
    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Set the timestamp (optional - current time otherwise)
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the kind and payload explicitly
    pub fn data(mut self, data: TxData) -> Self {
        self.data = data;
        self
    }

    /// Stake the sender's own funds
    pub fn stake(self, signer: &'a dyn SigningService, amount: Amount) -> Self {
        let validator = signer.address();
        self.signer(signer).amount(amount).data(TxData::Stake { validator })
    }

    /// Withdraw part of the sender's own stake
    pub fn unstake(self, signer: &'a dyn SigningService, amount: Amount) -> Self {
        let validator = signer.address();
        self.signer(signer).amount(amount).data(TxData::Unstake {
            validator,
            unbonding_time: None,
        })
    }

    /// Delegate to `validator`
    pub fn delegate(self, signer: &'a dyn SigningService, validator: Address, amount: Amount) -> Self {
        self.signer(signer).amount(amount).data(TxData::Delegate { validator })
    }

    /// Withdraw a delegation from `validator`
    pub fn undelegate(self, signer: &'a dyn SigningService, validator: Address, amount: Amount) -> Self {
        self.signer(signer).amount(amount).data(TxData::Undelegate {
            validator,
            unbonding_time: None,
        })
    }

    /// Claim fee rewards accumulated by the signer's validator
    pub fn claim_reward(self, signer: &'a dyn SigningService, amount: Amount) -> Self {
        let validator = signer.address();
        self.signer(signer).amount(amount).data(TxData::ClaimReward { validator })
    }

    /// Build and sign the transaction
    pub fn build(self) -> Result<Transaction, TxError> {
        let signer = self.signer.ok_or(TxError::MissingSigner)?;
        let amount = self.amount.ok_or(TxError::MissingAmount)?;
        if amount.is_zero() {
            return Err(TxError::InvalidAmount("amount cannot be zero".to_string()));
        }

        let kind = self.data.kind();
        if kind.is_system() {
            return Err(TxError::SystemKind(kind));
        }

        let sender = signer.address();
        let recipient = match &self.data {
            TxData::Transfer => self.recipient.ok_or(TxError::MissingRecipient)?,
            TxData::Stake { .. } | TxData::Delegate { .. } => Address::escrow(),
            _ => sender.clone(),
        };

        if kind == crate::tx::TxKind::Transfer && sender == recipient {
            return Err(TxError::SelfTransfer);
        }

        let nonce = self.nonce.unwrap_or_else(|| rand::thread_rng().gen::<u64>());
        let timestamp = self
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp().max(0) as u64);
        let fee = self.fee.unwrap_or(DEFAULT_FEE);

        let mut tx = Transaction::new(sender, recipient, amount, fee, timestamp, nonce, self.data);
        tx.sign_with(signer)?;
        Ok(tx)
    }
}

impl<'a> Default for TxBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}
