//! Ordered-proof Merkle tree over manifest routes.
//!
//! Sibling order matters: every proof step carries an explicit direction bit
//! saying which side the sibling hashes in on, and leaf/node hashing is
//! domain-separated. Sorted-pair trees accept a proof for a leaf at the
//! wrong index; this construction does not.

use serde::{Deserialize, Serialize};

use crate::core::error::ForgeError;
use crate::core::hash::{Address, Digest, Selector, sha256_concat, LEAF_TAG, NODE_TAG};

/// Which side of the node hash the sibling occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sibling hashes in on the left: `node = H(tag ++ sibling ++ acc)`.
    Left,
    /// Sibling hashes in on the right: `node = H(tag ++ acc ++ sibling)`.
    Right,
}

/// Membership proof for one route: sibling digests from leaf level upward,
/// with one direction bit per sibling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteProof {
    pub siblings: Vec<Digest>,
    pub directions: Vec<Direction>,
}

/// Canonical leaf encoding: `H(LEAF_TAG ++ selector ++ address ++ code_hash)`.
pub fn leaf_hash(selector: &Selector, address: &Address, code_hash: &Digest) -> Digest {
    sha256_concat(&[
        LEAF_TAG,
        selector.as_bytes(),
        address.as_bytes(),
        code_hash.as_bytes(),
    ])
}

fn node_hash(left: &Digest, right: &Digest) -> Digest {
    sha256_concat(&[NODE_TAG, left.as_bytes(), right.as_bytes()])
}

/// Folds `proof` over `leaf` using the direction bits and compares against
/// `root`.
///
/// A length mismatch between siblings and direction bits is malformed input
/// (`Err(Validation)`), distinct from a well-formed proof that simply does
/// not reach `root` (`Ok(false)`).
pub fn verify(leaf: &Digest, proof: &RouteProof, root: &Digest) -> Result<bool, ForgeError> {
    if proof.siblings.len() != proof.directions.len() {
        return Err(ForgeError::Validation(format!(
            "malformed proof: {} siblings but {} direction bits",
            proof.siblings.len(),
            proof.directions.len()
        )));
    }

    let mut acc = *leaf;
    for (sibling, direction) in proof.siblings.iter().zip(proof.directions.iter()) {
        acc = match direction {
            Direction::Left => node_hash(sibling, &acc),
            Direction::Right => node_hash(&acc, sibling),
        };
    }
    Ok(acc == *root)
}

/// Full tree built from ordered leaves. Used by the manifest tooling to
/// compute roots and emit per-route proofs; the router only ever verifies.
pub struct MerkleTree {
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Build from ordered leaf digests. Odd-sized levels duplicate their last
    /// node.
    pub fn build(leaves: Vec<Digest>) -> Result<Self, ForgeError> {
        if leaves.is_empty() {
            return Err(ForgeError::Validation(
                "cannot build a Merkle tree with no leaves".to_string(),
            ));
        }

        let mut levels = vec![leaves];
        while levels.last().map(|l| l.len()).unwrap_or(0) > 1 {
            let mut current = levels.last().cloned().unwrap_or_default();
            if current.len() % 2 == 1 {
                let last = *current.last().ok_or_else(|| {
                    ForgeError::Validation("empty Merkle level".to_string())
                })?;
                current.push(last);
            }
            let mut next = Vec::with_capacity(current.len() / 2);
            for pair in current.chunks(2) {
                next.push(node_hash(&pair[0], &pair[1]));
            }
            // Replace the working level with its padded form so proofs can
            // reference the duplicated sibling.
            let depth = levels.len();
            levels[depth - 1] = current;
            levels.push(next);
        }

        Ok(Self { levels })
    }

    pub fn root(&self) -> Digest {
        self.levels
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or(Digest([0u8; 32]))
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(|l| l.len()).unwrap_or(0)
    }

    /// Membership proof for the leaf at `index`.
    pub fn prove(&self, index: usize) -> Result<RouteProof, ForgeError> {
        if index >= self.leaf_count() {
            return Err(ForgeError::NotFound(format!(
                "leaf index {} out of range ({} leaves)",
                index,
                self.leaf_count()
            )));
        }

        let mut siblings = Vec::new();
        let mut directions = Vec::new();
        let mut i = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = i ^ 1;
            // Padded levels always contain the sibling slot.
            let sibling = level.get(sibling_index).copied().unwrap_or_else(|| level[i]);
            siblings.push(sibling);
            directions.push(if sibling_index < i {
                Direction::Left
            } else {
                Direction::Right
            });
            i /= 2;
        }

        Ok(RouteProof {
            siblings,
            directions,
        })
    }
}
