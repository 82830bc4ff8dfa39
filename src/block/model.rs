use crate::block::merkle_root;
use crate::consensus::SignedHeader;
use crate::hash::{BlockHash, MerkleRoot, TxId};
use crate::identity::{Address, Signature, SignatureVerifier, SigningService};
use crate::tx::{Amount, Transaction, TxData};
use serde::{Deserialize, Serialize};

/// Current block format version
pub const BLOCK_VERSION: u32 = 1;

const HEADER_DOMAIN: &[u8] = b"stakechain:block:v1";
const PROPOSAL_DOMAIN: &[u8] = b"stakechain:proposal:v1";

/// A block of ordered transactions.
///
/// `merkle_root`, `hash` and `size` are derived from the other fields at
/// construction; `verify_integrity` recomputes them so tampering shows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub version: u32,
    pub height: u64,
    pub prev_hash: BlockHash,
    pub timestamp: u64,
    /// Absent only for genesis
    pub proposer: Option<Address>,
    pub transactions: Vec<Transaction>,
    pub merkle_root: MerkleRoot,
    pub hash: BlockHash,
    /// Header plus transaction bytes
    pub size: u64,
    /// Proposer's signature over the hash and height
    pub signature: Option<Signature>,
}

impl Block {
    pub fn new(
        height: u64,
        prev_hash: BlockHash,
        transactions: Vec<Transaction>,
        timestamp: u64,
        proposer: Option<Address>,
    ) -> Self {
        let mut block = Self {
            version: BLOCK_VERSION,
            height,
            prev_hash,
            timestamp,
            proposer,
            transactions,
            merkle_root: MerkleRoot::ZERO,
            hash: BlockHash::ZERO,
            size: 0,
            signature: None,
        };
        block.merkle_root = block.compute_merkle_root();
        block.hash = block.compute_hash();
        block.size = block.compute_size();
        block
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    pub fn tx_ids(&self) -> Vec<TxId> {
        self.transactions.iter().map(|tx| tx.id()).collect()
    }

    pub fn compute_merkle_root(&self) -> MerkleRoot {
        merkle_root(&self.tx_ids())
    }

    fn header_bytes(&self) -> Vec<u8> {
        let proposer = self.proposer.as_ref().map_or("", |p| p.as_str());
        let mut bytes = Vec::with_capacity(HEADER_DOMAIN.len() + 140);
        bytes.extend_from_slice(HEADER_DOMAIN);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(self.prev_hash.as_bytes());
        bytes.extend_from_slice(self.merkle_root.as_bytes());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&(proposer.len() as u32).to_le_bytes());
        bytes.extend_from_slice(proposer.as_bytes());
        bytes
    }

    /// Hash over the header fields, merkle root included
    pub fn compute_hash(&self) -> BlockHash {
        BlockHash::digest(&self.header_bytes())
    }

    pub fn compute_size(&self) -> u64 {
        let txs: usize = self.transactions.iter().map(|tx| tx.encoded_size()).sum();
        (self.header_bytes().len() + txs) as u64
    }

    /// Stored merkle root, hash and size all match the content
    pub fn verify_integrity(&self) -> bool {
        self.merkle_root == self.compute_merkle_root()
            && self.hash == self.compute_hash()
            && self.size == self.compute_size()
    }

    /// Sum of the fees carried by user transactions
    pub fn total_fees(&self) -> Amount {
        self.transactions
            .iter()
            .fold(Amount::ZERO, |acc, tx| acc.saturating_add(tx.fee()))
    }

    /// The MiningReward transactions of this block
    pub fn rewards(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions
            .iter()
            .filter(|tx| matches!(tx.data(), TxData::MiningReward))
    }

    // ========================================================================
    // PROPOSER SIGNATURE
    // ========================================================================

    /// Bytes a proposer signs for the block `hash` at `height`
    pub fn proposal_bytes(hash: &BlockHash, height: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PROPOSAL_DOMAIN.len() + 40);
        bytes.extend_from_slice(PROPOSAL_DOMAIN);
        bytes.extend_from_slice(hash.as_bytes());
        bytes.extend_from_slice(&height.to_le_bytes());
        bytes
    }

    /// Sign as proposer. Replaces any earlier signature.
    pub fn sign(&mut self, signer: &dyn SigningService) {
        self.signature = Some(signer.sign(&Self::proposal_bytes(&self.hash, self.height)));
    }

    /// The proposer signature is present and valid. Genesis carries none.
    pub fn verify_signature(&self, verifier: &dyn SignatureVerifier) -> bool {
        let (Some(proposer), Some(signature)) = (&self.proposer, &self.signature) else {
            return false;
        };
        match proposer.public_key() {
            Ok(public_key) => verifier.verify(
                &Self::proposal_bytes(&self.hash, self.height),
                signature,
                &public_key,
            ),
            Err(_) => false,
        }
    }

    /// Header and signature, as used in fork evidence
    pub fn signed_header(&self) -> Option<SignedHeader> {
        self.signature.as_ref().map(|signature| SignedHeader {
            height: self.height,
            block_hash: self.hash,
            signature: signature.clone(),
        })
    }
}
