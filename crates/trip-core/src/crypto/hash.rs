//! SHA-256 block hashing and Merkle aggregation for breadcrumb chains.

use sha2::{Digest, Sha256};

/// Size of a SHA-256 hash in bytes.
pub const HASH_SIZE: usize = 32;

/// A 32-byte SHA-256 digest.
pub type Hash = [u8; HASH_SIZE];

/// The explicit null predecessor value carried by a genesis breadcrumb.
///
/// On the wire this is CBOR `null`, never a zero-filled hash; the constant
/// exists so in-memory code has a single sentinel to compare against.
pub const GENESIS_PREV: Option<Hash> = None;

/// Computes the block hash of a breadcrumb: SHA-256 over the canonical
/// encoding of all fields including the signature.
#[must_use]
pub fn block_hash(canonical_bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes);
    hasher.finalize().into()
}

/// Computes the Merkle root over breadcrumb block hashes in their natural
/// (index) order.
///
/// Binary SHA-256 tree with canonical left-right ordering: each parent is
/// `SHA-256(left || right)`. A level with an odd node count promotes the
/// final node unchanged to the next level. An empty slice yields the hash
/// of the empty string so that the root is always defined.
#[must_use]
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return block_hash(&[]);
    }

    let mut level: Vec<Hash> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            if let [left, right] = pair {
                let mut hasher = Sha256::new();
                hasher.update(left);
                hasher.update(right);
                next.push(hasher.finalize().into());
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }
    level[0]
}
