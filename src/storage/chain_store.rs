use crate::block::Block;
use crate::chain::Checkpoint;
use crate::hash::{BlockHash, TxId};
use crate::identity::{Address, Keypair};
use crate::storage::{BatchOp, KvStore, StoreError};
use crate::tx::Amount;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Key layout
mod keys {
    pub const BLOCK: &str = "block:";
    pub const TX: &str = "tx:";
    pub const HEIGHT: &str = "height:";
    pub const CHECKPOINT: &str = "checkpoint:";
    pub const BALANCE: &str = "balance:";
    pub const HEAD: &[u8] = b"chain:head";
    pub const NODE_KEYPAIR: &[u8] = b"node:keypair";
}

fn block_key(hash: &BlockHash) -> Vec<u8> {
    format!("{}{}", keys::BLOCK, hash.to_hex()).into_bytes()
}

fn tx_key(id: &TxId) -> Vec<u8> {
    format!("{}{}", keys::TX, id.to_hex()).into_bytes()
}

fn height_key(height: u64) -> Vec<u8> {
    format!("{}{:020}", keys::HEIGHT, height).into_bytes()
}

fn checkpoint_key(height: u64) -> Vec<u8> {
    format!("{}{:020}", keys::CHECKPOINT, height).into_bytes()
}

fn balance_key(address: &Address) -> Vec<u8> {
    format!("{}{}", keys::BALANCE, address).into_bytes()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(postcard::to_allocvec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    postcard::from_bytes(bytes).map_err(|e| StoreError::DeserializationFailed(e.to_string()))
}

/// Tip of the stored canonical chain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub height: u64,
    pub hash: BlockHash,
}

/// Where a confirmed transaction lives
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLocation {
    pub block_hash: BlockHash,
    pub height: u64,
}

/// Chain objects mapped onto a `KvStore`.
///
/// Block bodies are kept under `block:` even after they leave the canonical
/// chain; `height:` and `tx:` index only canonical blocks.
pub struct ChainStore<S: KvStore> {
    store: S,
}

impl<S: KvStore> ChainStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.store.flush()
    }

    // ========================================================================
    // BLOCKS
    // ========================================================================

    /// Write a canonical block, its index entries, the touched balances and
    /// the new head in one batch
    pub fn commit_block(&self, block: &Block, balances: &[(Address, Amount)]) -> Result<(), StoreError> {
        let mut ops = vec![
            BatchOp::put(block_key(&block.hash), encode(block)?),
            BatchOp::put(height_key(block.height), block.hash.as_bytes().to_vec()),
            BatchOp::put(
                keys::HEAD,
                encode(&ChainHead {
                    height: block.height,
                    hash: block.hash,
                })?,
            ),
        ];
        let location = encode(&TxLocation {
            block_hash: block.hash,
            height: block.height,
        })?;
        for tx in &block.transactions {
            ops.push(BatchOp::put(tx_key(&tx.id()), location.clone()));
        }
        ops.extend(Self::balance_ops(balances));
        self.store.batch(ops)
    }

    /// Take a block off the canonical index and move the head to its parent
    pub fn uncommit_block(&self, block: &Block, balances: &[(Address, Amount)]) -> Result<(), StoreError> {
        let mut ops = vec![BatchOp::delete(height_key(block.height))];
        for tx in &block.transactions {
            ops.push(BatchOp::delete(tx_key(&tx.id())));
        }
        if let Some(parent) = block.height.checked_sub(1) {
            ops.push(BatchOp::put(
                keys::HEAD,
                encode(&ChainHead {
                    height: parent,
                    hash: block.prev_hash,
                })?,
            ));
        } else {
            ops.push(BatchOp::delete(keys::HEAD));
        }
        ops.extend(Self::balance_ops(balances));
        self.store.batch(ops)
    }

    /// Overwrite the stored balances of the given addresses
    pub fn put_balances(&self, balances: &[(Address, Amount)]) -> Result<(), StoreError> {
        if balances.is_empty() {
            return Ok(());
        }
        self.store.batch(Self::balance_ops(balances))
    }

    fn balance_ops(balances: &[(Address, Amount)]) -> Vec<BatchOp> {
        balances
            .iter()
            .map(|(address, amount)| {
                if amount.is_zero() {
                    BatchOp::delete(balance_key(address))
                } else {
                    BatchOp::put(balance_key(address), amount.units().to_le_bytes().to_vec())
                }
            })
            .collect()
    }

    pub fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>, StoreError> {
        self.store
            .get(&block_key(hash))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn get_block_at(&self, height: u64) -> Result<Option<Block>, StoreError> {
        match self.hash_at(height)? {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }

    pub fn hash_at(&self, height: u64) -> Result<Option<BlockHash>, StoreError> {
        let Some(bytes) = self.store.get(&height_key(height))? else {
            return Ok(None);
        };
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::DeserializationFailed("block hash must be 32 bytes".into()))?;
        Ok(Some(BlockHash::from_bytes(arr)))
    }

    pub fn tx_location(&self, id: &TxId) -> Result<Option<TxLocation>, StoreError> {
        self.store
            .get(&tx_key(id))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn head(&self) -> Result<Option<ChainHead>, StoreError> {
        self.store
            .get(keys::HEAD)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn balance(&self, address: &Address) -> Result<Amount, StoreError> {
        let Some(bytes) = self.store.get(&balance_key(address))? else {
            return Ok(Amount::ZERO);
        };
        let arr: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::DeserializationFailed("balance must be 8 bytes".into()))?;
        Ok(Amount::from_units(u64::from_le_bytes(arr)))
    }

    /// Drop block bodies and their transaction index below
    /// `head - keep_recent`, except at `protected` heights. Returns the number
    /// of blocks removed.
    pub fn prune_blocks(&self, keep_recent: u64, protected: &BTreeSet<u64>) -> Result<usize, StoreError> {
        let Some(head) = self.head()? else {
            return Ok(0);
        };
        let cutoff = head.height.saturating_sub(keep_recent);
        let mut pruned = 0;

        // Genesis is never pruned
        for height in 1..cutoff {
            if protected.contains(&height) {
                continue;
            }
            let Some(block) = self.get_block_at(height)? else {
                continue;
            };
            let mut ops = vec![
                BatchOp::delete(block_key(&block.hash)),
                BatchOp::delete(height_key(height)),
            ];
            for tx in &block.transactions {
                ops.push(BatchOp::delete(tx_key(&tx.id())));
            }
            self.store.batch(ops)?;
            pruned += 1;
        }
        if pruned > 0 {
            debug!(pruned, cutoff, "pruned stored blocks");
        }
        Ok(pruned)
    }

    // ========================================================================
    // CHECKPOINTS
    // ========================================================================

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.store
            .put(&checkpoint_key(checkpoint.height), &encode(checkpoint)?)
    }

    pub fn load_checkpoint(&self, height: u64) -> Result<Option<Checkpoint>, StoreError> {
        self.store
            .get(&checkpoint_key(height))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn delete_checkpoint(&self, height: u64) -> Result<(), StoreError> {
        self.store.delete(&checkpoint_key(height))
    }

    /// Heights of stored checkpoints, ascending
    pub fn checkpoint_heights(&self) -> Result<Vec<u64>, StoreError> {
        let prefix = keys::CHECKPOINT.as_bytes();
        self.store
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(key, _)| {
                std::str::from_utf8(&key[prefix.len()..])
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| StoreError::DeserializationFailed("malformed checkpoint key".into()))
            })
            .collect()
    }

    // ========================================================================
    // NODE IDENTITY
    // ========================================================================

    /// Save the node keypair
    pub fn save_keypair(&self, keypair: &Keypair) -> Result<(), StoreError> {
        self.store.put(keys::NODE_KEYPAIR, &keypair.to_bytes())
    }

    /// Load the node keypair
    pub fn load_keypair(&self) -> Result<Option<Keypair>, StoreError> {
        match self.store.get(keys::NODE_KEYPAIR)? {
            Some(bytes) => {
                let keypair = Keypair::from_bytes(&bytes)
                    .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?;
                Ok(Some(keypair))
            }
            None => Ok(None),
        }
    }

    /// Load the node keypair, generating and saving one on first use
    pub fn get_or_create_keypair(&self) -> Result<Keypair, StoreError> {
        if let Some(keypair) = self.load_keypair()? {
            return Ok(keypair);
        }
        let keypair = Keypair::generate();
        self.save_keypair(&keypair)?;
        Ok(keypair)
    }
}
