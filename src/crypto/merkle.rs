//! Merkle root over transaction ids
//!
//! Commits the block header to the ordered list of transactions it carries.

use super::hash::sha256;

/// Calculate the merkle root from a list of leaf hashes.
///
/// An odd node at any level is paired with itself. An empty list hashes to
/// `sha256("")`.
pub fn calculate_merkle_root(hashes: &[Vec<u8>]) -> Vec<u8> {
    if hashes.is_empty() {
        return sha256(b"");
    }

    let mut level: Vec<Vec<u8>> = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                let mut data = pair[0].clone();
                data.extend_from_slice(right);
                sha256(&data)
            })
            .collect();
    }

    level.remove(0)
}

/// Merkle root of hex-encoded transaction ids, hex-encoded.
///
/// Ids that fail to decode are hashed as their raw bytes so that a tampered
/// id still changes the root.
pub fn merkle_root_of_ids<'a, I>(ids: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let leaves: Vec<Vec<u8>> = ids
        .into_iter()
        .map(|id| hex::decode(id).unwrap_or_else(|_| sha256(id.as_bytes())))
        .collect();
    hex::encode(calculate_merkle_root(&leaves))
}
