//! Merkle roots for stage receipts.
//!
//! Leaves are hashed from their canonical JSON. Each level pairs adjacent
//! nodes and hashes the concatenation; an odd level duplicates its last node
//! before pairing. The single surviving node is the root.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{ContentHasher, Hash, parse_hash_hex};

/// Errors that can occur while building or checking a tree.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MerkleError {
    /// A tree needs at least one leaf.
    #[error("cannot build a Merkle tree from zero leaves")]
    Empty,

    /// Leaves must be listed in index order starting at zero.
    #[error("leaf at position {position} has index {index}")]
    OutOfOrder {
        /// Position in the list.
        position: usize,
        /// Index carried by the leaf.
        index: u64,
    },

    /// A leaf could not be canonicalized.
    #[error("leaf canonicalization failed: {0}")]
    Canonicalization(String),
}

/// One task's evidence inside a stage receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageLeaf {
    /// Position of the task within the stage.
    pub index: u64,
    /// Hex SHA-256 of the task output.
    pub output_hash: String,
    /// Hex digest identifying the task definition.
    pub task_hash: String,
    /// Hex digest of the produced artifact.
    pub artifact_hash: String,
}

impl StageLeaf {
    /// Builds a leaf by hashing the raw task output.
    #[must_use]
    pub fn from_output(
        index: u64,
        output: &[u8],
        task_hash: impl Into<String>,
        artifact_hash: impl Into<String>,
    ) -> Self {
        Self {
            index,
            output_hash: ContentHasher::hash_hex(output),
            task_hash: task_hash.into(),
            artifact_hash: artifact_hash.into(),
        }
    }

    /// Digest of this leaf's canonical JSON.
    ///
    /// # Errors
    ///
    /// Returns [`MerkleError::Canonicalization`] if serialization fails.
    pub fn digest(&self) -> Result<Hash, MerkleError> {
        let canonical =
            serde_jcs::to_vec(self).map_err(|e| MerkleError::Canonicalization(e.to_string()))?;
        Ok(ContentHasher::hash(&canonical))
    }
}

/// A fully materialized tree, level by level from the leaves up.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Builds a tree over leaf digests.
    ///
    /// # Errors
    ///
    /// Returns [`MerkleError::Empty`] when `leaves` is empty.
    pub fn build(leaves: &[Hash]) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::Empty);
        }
        let mut levels = vec![leaves.to_vec()];
        while levels.last().is_some_and(|level| level.len() > 1) {
            let current = levels.last().map_or(&[][..], Vec::as_slice);
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            let mut nodes = current.iter();
            while let Some(left) = nodes.next() {
                // An odd node out is paired with itself.
                let right = nodes.next().unwrap_or(left);
                next.push(ContentHasher::hash_pair(left, right));
            }
            levels.push(next);
        }
        Ok(Self { levels })
    }

    /// Builds a tree over stage leaves, checking their ordering.
    ///
    /// # Errors
    ///
    /// Returns an error for empty or out-of-order leaves.
    pub fn from_stage_leaves(leaves: &[StageLeaf]) -> Result<Self, MerkleError> {
        let digests = leaves
            .iter()
            .enumerate()
            .map(|(position, leaf)| {
                if leaf.index != position as u64 {
                    return Err(MerkleError::OutOfOrder {
                        position,
                        index: leaf.index,
                    });
                }
                leaf.digest()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::build(&digests)
    }

    /// Returns the root digest.
    #[must_use]
    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or([0u8; 32])
    }

    /// Returns the root digest as lowercase hex.
    #[must_use]
    pub fn root_hex(&self) -> String {
        hex::encode(self.root())
    }

    /// Number of leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// Generates an inclusion proof for the leaf at `index`.
    #[must_use]
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        let leaf = *self.levels.first()?.get(index)?;
        let mut siblings = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            // An odd level pairs its last node with itself.
            let sibling = level.get(sibling_idx).unwrap_or(&level[idx]);
            siblings.push(ProofStep {
                hash: hex::encode(sibling),
                sibling_on_right: idx % 2 == 0,
            });
            idx /= 2;
        }
        Some(MerkleProof {
            leaf_index: index,
            leaf_hash: hex::encode(leaf),
            siblings,
        })
    }
}

/// Computes the hex root of a stage receipt's leaves.
///
/// # Errors
///
/// Returns an error for empty or out-of-order leaves.
pub fn stage_root_hex(leaves: &[StageLeaf]) -> Result<String, MerkleError> {
    MerkleTree::from_stage_leaves(leaves).map(|tree| tree.root_hex())
}

/// One sibling along a proof path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Hex digest of the sibling node.
    pub hash: String,
    /// Whether the sibling sits to the right of the running hash.
    pub sibling_on_right: bool,
}

/// Inclusion proof for a single leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Index of the proven leaf.
    pub leaf_index: usize,
    /// Hex digest of the leaf.
    pub leaf_hash: String,
    /// Path from the leaf to the root.
    pub siblings: Vec<ProofStep>,
}

impl MerkleProof {
    /// Recomputes the root implied by this proof.
    ///
    /// Returns `None` if any digest in the proof is malformed.
    #[must_use]
    pub fn compute_root(&self) -> Option<Hash> {
        let mut current = parse_hash_hex(&self.leaf_hash).ok()?;
        for step in &self.siblings {
            let sibling = parse_hash_hex(&step.hash).ok()?;
            current = if step.sibling_on_right {
                ContentHasher::hash_pair(&current, &sibling)
            } else {
                ContentHasher::hash_pair(&sibling, &current)
            };
        }
        Some(current)
    }

    /// Checks the proof against a hex root.
    #[must_use]
    pub fn verify(&self, root_hex: &str) -> bool {
        match (self.compute_root(), parse_hash_hex(root_hex)) {
            (Some(computed), Ok(root)) => computed == root,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn leaves(n: usize) -> Vec<StageLeaf> {
        (0..n)
            .map(|i| {
                StageLeaf::from_output(
                    i as u64,
                    format!("output-{i}").as_bytes(),
                    ContentHasher::hash_hex(format!("task-{i}").as_bytes()),
                    ContentHasher::hash_hex(format!("artifact-{i}").as_bytes()),
                )
            })
            .collect()
    }

    #[test]
    fn test_single_leaf_root_is_leaf_digest() {
        let leaves = leaves(1);
        let tree = MerkleTree::from_stage_leaves(&leaves).unwrap();
        assert_eq!(tree.root(), leaves[0].digest().unwrap());
    }

    #[test]
    fn test_odd_level_duplicates_last_node() {
        let leaves = leaves(3);
        let d: Vec<Hash> = leaves.iter().map(|l| l.digest().unwrap()).collect();
        let left = ContentHasher::hash_pair(&d[0], &d[1]);
        let right = ContentHasher::hash_pair(&d[2], &d[2]);
        let expected = ContentHasher::hash_pair(&left, &right);
        assert_eq!(MerkleTree::from_stage_leaves(&leaves).unwrap().root(), expected);
    }

    #[test]
    fn test_six_leaves_duplicate_per_level_not_padded() {
        let leaves = leaves(6);
        let d: Vec<Hash> = leaves.iter().map(|l| l.digest().unwrap()).collect();
        let ab = ContentHasher::hash_pair(&d[0], &d[1]);
        let cd = ContentHasher::hash_pair(&d[2], &d[3]);
        let ef = ContentHasher::hash_pair(&d[4], &d[5]);
        let abcd = ContentHasher::hash_pair(&ab, &cd);
        let efef = ContentHasher::hash_pair(&ef, &ef);
        let expected = ContentHasher::hash_pair(&abcd, &efef);
        assert_eq!(MerkleTree::from_stage_leaves(&leaves).unwrap().root(), expected);
    }

    #[test]
    fn test_odd_node_on_consecutive_levels() {
        let leaves = leaves(5);
        let d: Vec<Hash> = leaves.iter().map(|l| l.digest().unwrap()).collect();
        let ab = ContentHasher::hash_pair(&d[0], &d[1]);
        let cd = ContentHasher::hash_pair(&d[2], &d[3]);
        let ee = ContentHasher::hash_pair(&d[4], &d[4]);
        let abcd = ContentHasher::hash_pair(&ab, &cd);
        let eeee = ContentHasher::hash_pair(&ee, &ee);
        let expected = ContentHasher::hash_pair(&abcd, &eeee);

        let tree = MerkleTree::build(&d).unwrap();
        assert_eq!(tree.root(), expected);
        assert!(tree.proof(4).unwrap().verify(&tree.root_hex()));
    }

    #[test]
    fn test_empty_and_out_of_order_rejected() {
        assert_eq!(MerkleTree::build(&[]).unwrap_err(), MerkleError::Empty);
        let mut leaves = leaves(2);
        leaves.swap(0, 1);
        assert!(matches!(
            MerkleTree::from_stage_leaves(&leaves),
            Err(MerkleError::OutOfOrder { position: 0, index: 1 })
        ));
    }

    #[test]
    fn test_changing_any_leaf_changes_root() {
        let original = leaves(5);
        let root = stage_root_hex(&original).unwrap();
        for i in 0..original.len() {
            let mut tampered = original.clone();
            tampered[i].artifact_hash = ContentHasher::hash_hex(b"tampered");
            assert_ne!(stage_root_hex(&tampered).unwrap(), root, "leaf {i}");
        }
    }

    proptest! {
        #[test]
        fn prop_root_is_reproducible(n in 1usize..40) {
            let leaves = leaves(n);
            let first = stage_root_hex(&leaves).unwrap();
            let second = stage_root_hex(&leaves).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_every_proof_verifies(n in 1usize..40) {
            let leaves = leaves(n);
            let tree = MerkleTree::from_stage_leaves(&leaves).unwrap();
            let root = tree.root_hex();
            for i in 0..n {
                let proof = tree.proof(i).unwrap();
                prop_assert!(proof.verify(&root));
            }
            prop_assert!(tree.proof(n).is_none());
        }
    }
}
