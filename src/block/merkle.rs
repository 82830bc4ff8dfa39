use crate::hash::{sha256, sha256_concat, MerkleRoot, TxId};

/// Merkle root over transaction ids.
///
/// Pairs are hashed level by level; an odd level repeats its last node. A
/// single id is its own root and an empty list hashes the empty string.
pub fn merkle_root(ids: &[TxId]) -> MerkleRoot {
    if ids.is_empty() {
        return MerkleRoot::from_bytes(sha256(b""));
    }

    let mut level: Vec<[u8; 32]> = ids.iter().map(|id| *id.as_bytes()).collect();
    while level.len() > 1 {
        if level.len() % 2 != 0 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| sha256_concat(&[&pair[0], &pair[1]]))
            .collect();
    }
    MerkleRoot::from_bytes(level[0])
}
