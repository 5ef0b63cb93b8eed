//! In-memory tree of block index nodes.
//!
//! Nodes live in a hash-keyed arena; parent and child links are hashes
//! resolved through the arena, so forks never create ownership cycles. The
//! best chain is a cached path from genesis to the highest-trust tip, and
//! `next` links exist only along it.

use std::collections::HashMap;

use primitive_types::U256;
use umbra_consensus::Hash256;

use crate::flatfiles::FileLocation;

#[derive(Clone, Debug)]
pub struct BlockIndexNode {
    pub hash: Hash256,
    pub prev: Hash256,
    pub height: i32,
    pub time: u32,
    pub bits: u32,
    /// Cumulative trust from genesis through this block.
    pub trust: U256,
    pub proof_of_stake: bool,
    pub stake_modifier: u64,
    pub proof_hash: Hash256,
    pub location: Option<FileLocation>,
    /// Main-chain successor; `None` off the best chain and at the tip.
    pub next: Option<Hash256>,
}

/// Result of promoting a new best tip: the hashes leaving the main chain
/// (tip first) and the hashes joining it (fork side first).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Reorg {
    pub disconnected: Vec<Hash256>,
    pub connected: Vec<Hash256>,
}

#[derive(Default)]
pub struct ChainTree {
    nodes: HashMap<Hash256, BlockIndexNode>,
    children: HashMap<Hash256, Vec<Hash256>>,
    /// Best path, indexed by height. Entry 0 is genesis.
    main: Vec<Hash256>,
}

impl ChainTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn node(&self, hash: &Hash256) -> Option<&BlockIndexNode> {
        self.nodes.get(hash)
    }

    pub fn node_mut(&mut self, hash: &Hash256) -> Option<&mut BlockIndexNode> {
        self.nodes.get_mut(hash)
    }

    pub fn children(&self, hash: &Hash256) -> &[Hash256] {
        self.children.get(hash).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn best_hash(&self) -> Option<Hash256> {
        self.main.last().copied()
    }

    pub fn best_node(&self) -> Option<&BlockIndexNode> {
        self.main.last().and_then(|hash| self.nodes.get(hash))
    }

    pub fn best_height(&self) -> i32 {
        self.main.len() as i32 - 1
    }

    pub fn genesis_hash(&self) -> Option<Hash256> {
        self.main.first().copied()
    }

    pub fn main_chain_hash(&self, height: i32) -> Option<Hash256> {
        if height < 0 {
            return None;
        }
        self.main.get(height as usize).copied()
    }

    pub fn is_main_chain(&self, hash: &Hash256) -> bool {
        let Some(node) = self.nodes.get(hash) else {
            return false;
        };
        self.main_chain_hash(node.height) == Some(*hash)
    }

    /// Inserts a node, linking it under its parent. Idempotent: re-inserting
    /// an already-known hash leaves the tree unchanged.
    pub fn insert(&mut self, node: BlockIndexNode) {
        if self.nodes.contains_key(&node.hash) {
            return;
        }
        let hash = node.hash;
        let prev = node.prev;
        let is_genesis = node.height == 0;
        self.nodes.insert(hash, node);
        if !is_genesis {
            self.children.entry(prev).or_default().push(hash);
        } else if self.main.is_empty() {
            self.main.push(hash);
        }
    }

    /// Walks up from `hash` to its ancestor at `height`.
    pub fn ancestor(&self, hash: &Hash256, height: i32) -> Option<&BlockIndexNode> {
        let mut node = self.nodes.get(hash)?;
        if height > node.height || height < 0 {
            return None;
        }
        while node.height > height {
            node = self.nodes.get(&node.prev)?;
        }
        Some(node)
    }

    /// Last common ancestor of two nodes, found by walking the deeper chain
    /// down to equal height and then both in lockstep.
    pub fn find_fork(&self, a: &Hash256, b: &Hash256) -> Option<Hash256> {
        let node_a = self.nodes.get(a)?;
        let node_b = self.nodes.get(b)?;
        let shared = node_a.height.min(node_b.height);
        let mut walk_a = self.ancestor(a, shared)?;
        let mut walk_b = self.ancestor(b, shared)?;
        while walk_a.hash != walk_b.hash {
            walk_a = self.nodes.get(&walk_a.prev)?;
            walk_b = self.nodes.get(&walk_b.prev)?;
        }
        Some(walk_a.hash)
    }

    /// Exponentially sparse ancestor list from `from` back to genesis: the
    /// first ten entries step by one, then the step doubles each entry.
    pub fn locator(&self, from: &Hash256) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(32);
        let Some(mut node) = self.nodes.get(from) else {
            if let Some(genesis) = self.genesis_hash() {
                hashes.push(genesis);
            }
            return hashes;
        };
        let mut step = 1i32;
        loop {
            hashes.push(node.hash);
            if node.height == 0 {
                break;
            }
            if hashes.len() > 10 {
                step = step.saturating_mul(2);
            }
            let target = (node.height - step).max(0);
            match self.ancestor(&node.hash, target) {
                Some(ancestor) => node = ancestor,
                None => break,
            }
        }
        hashes
    }

    /// Promotes `tip` to best, rewriting the main path from the fork point.
    /// Returns which hashes left and joined the main chain so the caller can
    /// make the change durable.
    pub fn set_best(&mut self, tip: &Hash256) -> Option<Reorg> {
        let tip_node = self.nodes.get(tip)?;
        let tip_height = tip_node.height;

        // New main path segment, from the fork point (exclusive) to the tip.
        let fork_height = match self.best_hash() {
            Some(best) => {
                let fork = self.find_fork(&best, tip)?;
                self.nodes.get(&fork)?.height
            }
            None => -1,
        };

        let mut connected = Vec::with_capacity((tip_height - fork_height).max(0) as usize);
        let mut walk = *tip;
        while let Some(node) = self.nodes.get(&walk) {
            if node.height <= fork_height {
                break;
            }
            connected.push(node.hash);
            walk = node.prev;
        }
        connected.reverse();

        let disconnected: Vec<Hash256> = self
            .main
            .drain((fork_height + 1) as usize..)
            .rev()
            .collect();

        for hash in &disconnected {
            if let Some(node) = self.nodes.get_mut(hash) {
                node.next = None;
            }
        }
        if fork_height >= 0 {
            let fork_hash = self.main[fork_height as usize];
            if let Some(node) = self.nodes.get_mut(&fork_hash) {
                node.next = connected.first().copied();
            }
        }
        for (position, hash) in connected.iter().enumerate() {
            self.main.push(*hash);
            if let Some(node) = self.nodes.get_mut(hash) {
                node.next = connected.get(position + 1).copied();
            }
        }

        Some(Reorg {
            disconnected,
            connected,
        })
    }

    /// All tips (nodes without children), for diagnostics.
    pub fn tips(&self) -> Vec<Hash256> {
        self.nodes
            .keys()
            .filter(|hash| self.children(hash).is_empty())
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(hash: u8, prev: u8, height: i32, trust: u64) -> BlockIndexNode {
        BlockIndexNode {
            hash: [hash; 32],
            prev: [prev; 32],
            height,
            time: 1_000_000 + height as u32 * 150,
            bits: 0x1e0fffff,
            trust: U256::from(trust),
            proof_of_stake: false,
            stake_modifier: 0,
            proof_hash: [hash; 32],
            location: None,
            next: None,
        }
    }

    fn linear_tree(length: i32) -> ChainTree {
        let mut tree = ChainTree::new();
        let mut genesis = node(1, 0, 0, 1);
        genesis.prev = [0; 32];
        tree.insert(genesis);
        for height in 1..length {
            tree.insert(node(height as u8 + 1, height as u8, height, height as u64 + 1));
        }
        let tip = [length as u8; 32];
        tree.set_best(&tip).expect("tip known");
        tree
    }

    #[test]
    fn insert_is_idempotent() {
        let mut tree = linear_tree(3);
        let before = tree.len();
        tree.insert(node(2, 1, 1, 99));
        assert_eq!(tree.len(), before);
        // The original trust survives the duplicate insert.
        assert_eq!(tree.node(&[2; 32]).expect("node").trust, U256::from(2u64));
    }

    #[test]
    fn trust_increases_along_the_main_chain() {
        let tree = linear_tree(6);
        let mut walk = tree.genesis_hash().expect("genesis");
        loop {
            let current = tree.node(&walk).expect("node");
            let Some(next) = current.next else { break };
            assert!(tree.node(&next).expect("next").trust > current.trust);
            walk = next;
        }
    }

    #[test]
    fn fork_point_is_the_common_ancestor() {
        let mut tree = linear_tree(4);
        // Side branch off height 1.
        tree.insert(node(0x51, 2, 2, 10));
        tree.insert(node(0x52, 0x51, 3, 11));
        let fork = tree
            .find_fork(&[4; 32], &[0x52; 32])
            .expect("fork exists");
        assert_eq!(fork, [2; 32]);
    }

    #[test]
    fn reorg_rewrites_main_chain_and_next_links() {
        let mut tree = linear_tree(4);
        tree.insert(node(0x51, 2, 2, 50));
        tree.insert(node(0x52, 0x51, 3, 60));
        tree.insert(node(0x53, 0x52, 4, 70));

        let reorg = tree.set_best(&[0x53; 32]).expect("reorg");
        assert_eq!(reorg.disconnected, vec![[4; 32], [3; 32]]);
        assert_eq!(reorg.connected, vec![[0x51; 32], [0x52; 32], [0x53; 32]]);

        assert_eq!(tree.best_hash(), Some([0x53; 32]));
        assert_eq!(tree.best_height(), 4);
        assert!(tree.is_main_chain(&[0x52; 32]));
        assert!(!tree.is_main_chain(&[3; 32]));
        assert_eq!(tree.node(&[3; 32]).expect("stale").next, None);
        assert_eq!(tree.node(&[2; 32]).expect("fork").next, Some([0x51; 32]));
    }

    #[test]
    fn locator_steps_double_after_ten_entries() {
        let tree = linear_tree(101);
        let tip = tree.best_hash().expect("tip");
        let locator = tree.locator(&tip);
        // 1-by-1 for the first ten, then doubling, always ending at genesis.
        assert_eq!(locator[0], tip);
        assert_eq!(*locator.last().expect("genesis"), tree.genesis_hash().expect("genesis"));
        let height_of = |hash: &Hash256| tree.node(hash).expect("node").height;
        for window in locator.windows(2).take(10) {
            assert_eq!(height_of(&window[0]) - height_of(&window[1]), 1);
        }
        assert!(locator.len() < 25);
    }

    #[test]
    fn ancestor_walks_to_exact_height() {
        let tree = linear_tree(8);
        let tip = tree.best_hash().expect("tip");
        let ancestor = tree.ancestor(&tip, 3).expect("ancestor");
        assert_eq!(ancestor.height, 3);
        assert!(tree.ancestor(&tip, 99).is_none());
    }
}
