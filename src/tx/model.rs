use crate::hash::TxId;
use crate::identity::{Address, Signature, SignatureVerifier, SigningService};
use crate::tx::{Amount, TxError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain separator mixed into every transaction signature
const SIGNING_DOMAIN: &[u8] = b"stakechain:tx:v1";

/// Transaction kind and its kind-specific payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxData {
    /// Move value between two accounts
    Transfer,
    /// Lock the sender's own funds as validator stake
    Stake { validator: Address },
    /// Release the sender's own validator stake
    Unstake {
        validator: Address,
        unbonding_time: Option<u64>,
    },
    /// Lock funds behind another validator
    Delegate { validator: Address },
    /// Withdraw a delegation
    Undelegate {
        validator: Address,
        unbonding_time: Option<u64>,
    },
    /// Pay out accumulated fee rewards to a validator
    ClaimReward { validator: Address },
    /// Initial allocation in the genesis block
    Genesis { message: Option<String> },
    /// Block reward minted to the proposer
    MiningReward,
}

/// Fieldless view of `TxData`, used in errors and logs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    Transfer,
    Stake,
    Unstake,
    Delegate,
    Undelegate,
    ClaimReward,
    Genesis,
    MiningReward,
}

impl TxKind {
    fn tag(&self) -> u8 {
        match self {
            TxKind::Transfer => 0,
            TxKind::Stake => 1,
            TxKind::Unstake => 2,
            TxKind::Delegate => 3,
            TxKind::Undelegate => 4,
            TxKind::ClaimReward => 5,
            TxKind::Genesis => 6,
            TxKind::MiningReward => 7,
        }
    }

    /// Minted by the protocol rather than signed by a user
    pub fn is_system(&self) -> bool {
        matches!(self, TxKind::Genesis | TxKind::MiningReward)
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxKind::Transfer => "transfer",
            TxKind::Stake => "stake",
            TxKind::Unstake => "unstake",
            TxKind::Delegate => "delegate",
            TxKind::Undelegate => "undelegate",
            TxKind::ClaimReward => "claim_reward",
            TxKind::Genesis => "genesis",
            TxKind::MiningReward => "mining_reward",
        };
        f.write_str(name)
    }
}

impl TxData {
    pub fn kind(&self) -> TxKind {
        match self {
            TxData::Transfer => TxKind::Transfer,
            TxData::Stake { .. } => TxKind::Stake,
            TxData::Unstake { .. } => TxKind::Unstake,
            TxData::Delegate { .. } => TxKind::Delegate,
            TxData::Undelegate { .. } => TxKind::Undelegate,
            TxData::ClaimReward { .. } => TxKind::ClaimReward,
            TxData::Genesis { .. } => TxKind::Genesis,
            TxData::MiningReward => TxKind::MiningReward,
        }
    }

    /// The validator a staking transaction targets
    pub fn validator(&self) -> Option<&Address> {
        match self {
            TxData::Stake { validator }
            | TxData::Unstake { validator, .. }
            | TxData::Delegate { validator }
            | TxData::Undelegate { validator, .. }
            | TxData::ClaimReward { validator } => Some(validator),
            _ => None,
        }
    }

    fn write_payload(&self, bytes: &mut Vec<u8>) {
        match self {
            TxData::Transfer | TxData::MiningReward => {}
            TxData::Stake { validator }
            | TxData::Delegate { validator }
            | TxData::ClaimReward { validator } => write_str(bytes, validator.as_str()),
            TxData::Unstake {
                validator,
                unbonding_time,
            }
            | TxData::Undelegate {
                validator,
                unbonding_time,
            } => {
                write_str(bytes, validator.as_str());
                match unbonding_time {
                    Some(t) => {
                        bytes.push(1);
                        bytes.extend_from_slice(&t.to_le_bytes());
                    }
                    None => bytes.push(0),
                }
            }
            TxData::Genesis { message } => match message {
                Some(m) => {
                    bytes.push(1);
                    write_str(bytes, m);
                }
                None => bytes.push(0),
            },
        }
    }
}

fn write_str(bytes: &mut Vec<u8>, s: &str) {
    bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
    bytes.extend_from_slice(s.as_bytes());
}

/// A ledger transaction. Content is fixed at construction; the only later
/// mutation is attaching the signature, exactly once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    sender: Address,
    recipient: Address,
    amount: Amount,
    fee: Amount,
    timestamp: u64,
    nonce: u64,
    data: TxData,
    signature: Option<Signature>,
}

impl Transaction {
    /// Create an unsigned transaction
    pub fn new(
        sender: Address,
        recipient: Address,
        amount: Amount,
        fee: Amount,
        timestamp: u64,
        nonce: u64,
        data: TxData,
    ) -> Self {
        Self {
            sender,
            recipient,
            amount,
            fee,
            timestamp,
            nonce,
            data,
            signature: None,
        }
    }

    /// Genesis allocation minted from the system address
    pub fn genesis(recipient: Address, amount: Amount, message: Option<String>, timestamp: u64) -> Self {
        Self::new(
            Address::system(),
            recipient,
            amount,
            Amount::ZERO,
            timestamp,
            0,
            TxData::Genesis { message },
        )
    }

    /// Block reward for `height`. The height doubles as the nonce so every
    /// reward has a distinct id.
    pub fn mining_reward(recipient: Address, amount: Amount, height: u64, timestamp: u64) -> Self {
        Self::new(
            Address::system(),
            recipient,
            amount,
            Amount::ZERO,
            timestamp,
            height,
            TxData::MiningReward,
        )
    }

    pub fn sender(&self) -> &Address {
        &self.sender
    }

    pub fn recipient(&self) -> &Address {
        &self.recipient
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn data(&self) -> &TxData {
        &self.data
    }

    pub fn kind(&self) -> TxKind {
        self.data.kind()
    }

    pub fn is_system(&self) -> bool {
        self.kind().is_system()
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Content hash. Two transactions with identical content share an id.
    pub fn id(&self) -> TxId {
        TxId::digest(&self.to_signing_bytes())
    }

    /// Deterministic byte layout covered by the id and the signature
    pub fn to_signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(160);
        bytes.extend_from_slice(SIGNING_DOMAIN);
        bytes.push(self.kind().tag());
        write_str(&mut bytes, self.sender.as_str());
        write_str(&mut bytes, self.recipient.as_str());
        bytes.extend_from_slice(&self.amount.units().to_le_bytes());
        bytes.extend_from_slice(&self.fee.units().to_le_bytes());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        self.data.write_payload(&mut bytes);
        bytes
    }

    /// Serialized size used for fee-per-byte and block size accounting
    pub fn encoded_size(&self) -> usize {
        let signature_len = if self.signature.is_some() { 64 } else { 0 };
        self.to_signing_bytes().len() + signature_len
    }

    /// amount + fee, or `None` on overflow
    pub fn total_cost(&self) -> Option<Amount> {
        self.amount.checked_add(self.fee)
    }

    /// Attach the signature. Fails if one is already present.
    pub fn set_signature(&mut self, signature: Signature) -> Result<(), TxError> {
        if self.signature.is_some() {
            return Err(TxError::AlreadySigned);
        }
        self.signature = Some(signature);
        Ok(())
    }

    /// Sign with the given service. The service must own the sender address.
    pub fn sign_with(&mut self, signer: &dyn SigningService) -> Result<(), TxError> {
        if signer.address() != self.sender {
            return Err(TxError::SignerMismatch);
        }
        let signature = signer.sign(&self.to_signing_bytes());
        self.set_signature(signature)
    }

    /// Check the signature against the key embedded in the sender address
    pub fn verify_signature(&self, verifier: &dyn SignatureVerifier) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        match self.sender.public_key() {
            Ok(public_key) => verifier.verify(&self.to_signing_bytes(), signature, &public_key),
            Err(_) => false,
        }
    }
}
