//! Merkle tree over transaction ids.
//!
//! Odd nodes pair with themselves, which makes the root malleable for
//! duplicated trailing txids (the classic mutation). `merkle_root_and_mutation`
//! reports that case so the validator can reject the block instead of caching
//! its hash as permanently bad.

use umbra_consensus::Hash256;

use crate::hash::sha256d;

pub const ZERO_HASH: Hash256 = [0u8; 32];

pub fn merkle_hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left);
    data[32..].copy_from_slice(right);
    sha256d(&data)
}

/// Computes the merkle root and whether the leaf list is a known mutation of
/// a shorter list (two identical siblings anywhere in the tree).
pub fn merkle_root_and_mutation(leaves: &[Hash256]) -> (Hash256, bool) {
    let mut mutated = false;
    let mut level: Vec<Hash256> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            if pair.len() == 2 && pair[0] == pair[1] {
                mutated = true;
            }
            next.push(merkle_hash_pair(&left, &right));
        }
        level = next;
    }
    (level.pop().unwrap_or(ZERO_HASH), mutated)
}

/// Full tree with every layer cached, for producing branches.
pub struct MerkleTree {
    layers: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    pub fn from_leaves(leaves: &[Hash256]) -> Self {
        let mut layers = vec![leaves.to_vec()];
        while layers
            .last()
            .map(|layer| layer.len() > 1)
            .unwrap_or(false)
        {
            let current = &layers[layers.len() - 1];
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = pair[0];
                let right = if pair.len() == 2 { pair[1] } else { pair[0] };
                next.push(merkle_hash_pair(&left, &right));
            }
            layers.push(next);
        }
        Self { layers }
    }

    pub fn leaf_count(&self) -> usize {
        self.layers.first().map(Vec::len).unwrap_or(0)
    }

    pub fn root(&self) -> Hash256 {
        self.layers
            .last()
            .and_then(|layer| layer.first().copied())
            .unwrap_or(ZERO_HASH)
    }

    /// Sibling path from leaf `index` up to the root, or `None` when out of
    /// range. An odd node's sibling is itself.
    pub fn branch(&self, index: usize) -> Option<Vec<Hash256>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut branch = Vec::with_capacity(self.layers.len().saturating_sub(1));
        let mut position = index;
        for layer in &self.layers {
            if layer.len() == 1 {
                break;
            }
            let sibling = (position ^ 1).min(layer.len() - 1);
            branch.push(layer[sibling]);
            position >>= 1;
        }
        Some(branch)
    }
}

/// Folds a branch back up to a root; compare against the header to verify.
pub fn check_merkle_branch(leaf: Hash256, branch: &[Hash256], index: usize) -> Hash256 {
    let mut hash = leaf;
    let mut position = index;
    for sibling in branch {
        if position & 1 == 1 {
            hash = merkle_hash_pair(sibling, &hash);
        } else {
            hash = merkle_hash_pair(&hash, sibling);
        }
        position >>= 1;
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(count: usize) -> Vec<Hash256> {
        (0..count).map(|i| sha256d(&[i as u8])).collect()
    }

    #[test]
    fn empty_tree_has_zero_root() {
        let tree = MerkleTree::from_leaves(&[]);
        assert_eq!(tree.root(), ZERO_HASH);
        assert_eq!(tree.branch(0), None);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = sha256d(b"only");
        let tree = MerkleTree::from_leaves(&[leaf]);
        assert_eq!(tree.root(), leaf);
        assert_eq!(tree.branch(0), Some(Vec::new()));
    }

    #[test]
    fn branch_reconstructs_root_for_every_index() {
        for count in 1..=8 {
            let leaves = leaves(count);
            let tree = MerkleTree::from_leaves(&leaves);
            let root = tree.root();
            for (index, leaf) in leaves.iter().enumerate() {
                let branch = tree.branch(index).expect("index in range");
                assert_eq!(
                    check_merkle_branch(*leaf, &branch, index),
                    root,
                    "count {count} index {index}"
                );
            }
            assert_eq!(tree.branch(count), None);
        }
    }

    #[test]
    fn root_matches_streaming_computation() {
        for count in 1..=8 {
            let leaves = leaves(count);
            let tree = MerkleTree::from_leaves(&leaves);
            let (root, mutated) = merkle_root_and_mutation(&leaves);
            assert_eq!(root, tree.root());
            assert!(!mutated);
        }
    }

    #[test]
    fn duplicated_tail_is_flagged_as_mutation() {
        let mut list = leaves(3);
        let (root_odd, _) = merkle_root_and_mutation(&list);
        list.push(list[2]);
        let (root_dup, mutated) = merkle_root_and_mutation(&list);
        assert_eq!(root_odd, root_dup);
        assert!(mutated);
    }
}
