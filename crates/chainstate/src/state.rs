//! The accept-block pipeline and its shared chain state.
//!
//! One coarse lock guards the tree and the best-tip decision, so "check tip,
//! then promote tip" is atomic against concurrent acceptance from other
//! peers. The block-file append is the durability boundary: a validation
//! failure aborts before it, and everything written after it (index rows,
//! height map, tx index) is derived and rebuildable.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use primitive_types::U256;
use umbra_consensus::{ChainParams, Hash256};
use umbra_log::{log_debug, log_info, log_warn};
use umbra_primitives::block::Block;
use umbra_primitives::encoding::DecodeError;
use umbra_primitives::transaction::{Transaction, TxOut};
use umbra_pow::{block_proof, check_proof_of_work, next_target_required, HeaderSample};
use umbra_stake::{
    check_block_signature, check_stake_kernel, check_stake_timestamps, next_stake_modifier,
    StakeSource,
};
use umbra_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockindex::{BlockIndexEntry, FLAG_HAVE_DATA, FLAG_PROOF_OF_STAKE};
use crate::flatfiles::{BlockFileStore, FileLocation, FlatFileError};
use crate::tree::{BlockIndexNode, ChainTree, Reorg};
use crate::txindex::{self, TxIndexEntry};
use crate::validation::{
    check_block_structure, check_checkpoint, check_coinbase_height, check_proof_gating,
    check_timestamps, is_final_tx, Rejection,
};

const META_BEST_BLOCK_KEY: &[u8] = b"best_block";
const META_FILE_CURSOR_KEY: &[u8] = b"block_file_cursor";

const MAX_BLOCK_FILE_SIZE: u64 = 16 * 1024 * 1024;
const MAX_ORPHAN_BLOCKS: usize = 64;
/// Upper bound on hashes returned for one get-blocks request.
pub const GETBLOCKS_LIMIT: usize = 500;

#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    File(FlatFileError),
    Decode(DecodeError),
    /// A rule violation with its misbehavior score. Pre-persistence only.
    Rejected(Rejection),
    Corrupt(&'static str),
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::File(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::Rejected(rejection) => write!(f, "{rejection}"),
            ChainStateError::Corrupt(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::File(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

impl From<Rejection> for ChainStateError {
    fn from(rejection: Rejection) -> Self {
        ChainStateError::Rejected(rejection)
    }
}

impl ChainStateError {
    /// Misbehavior score to charge the submitting peer, zero for local
    /// faults like a full disk.
    pub fn dos_score(&self) -> u8 {
        match self {
            ChainStateError::Rejected(rejection) => rejection.dos,
            ChainStateError::Decode(_) => 100,
            _ => 0,
        }
    }
}

/// Terminal state of one trip through the pipeline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AcceptOutcome {
    Accepted {
        hash: Hash256,
        height: i32,
        /// Whether this block became the best tip and should be relayed.
        new_best: bool,
        /// Orphans that this block (transitively) connected.
        unorphaned: Vec<Hash256>,
    },
    AlreadyKnown {
        hash: Hash256,
    },
    /// Parent unknown: held pending, caller should request ancestors.
    Orphan {
        hash: Hash256,
        missing: Hash256,
    },
}

struct OrphanEntry {
    prev: Hash256,
    peer: Option<u64>,
}

#[derive(Default)]
struct OrphanPool {
    entries: HashMap<Hash256, OrphanEntry>,
    by_prev: HashMap<Hash256, Vec<Hash256>>,
    order: VecDeque<Hash256>,
}

impl OrphanPool {
    fn remove(&mut self, hash: &Hash256) -> Option<OrphanEntry> {
        let entry = self.entries.remove(hash)?;
        if let Some(siblings) = self.by_prev.get_mut(&entry.prev) {
            siblings.retain(|sibling| sibling != hash);
            if siblings.is_empty() {
                self.by_prev.remove(&entry.prev);
            }
        }
        self.order.retain(|pending| pending != hash);
        Some(entry)
    }
}

pub struct ChainState<S> {
    store: Arc<S>,
    params: ChainParams,
    blocks: BlockFileStore,
    tree: Mutex<ChainTree>,
    orphans: Mutex<OrphanPool>,
}

impl<S: KeyValueStore> ChainState<S> {
    /// Opens the chain state, rebuilding the in-memory tree from the durable
    /// index entries and restoring the best-tip pointer.
    pub fn open(
        store: Arc<S>,
        params: ChainParams,
        blocks_dir: impl AsRef<Path>,
    ) -> Result<Self, ChainStateError> {
        let blocks = BlockFileStore::open(blocks_dir.as_ref(), params.magic, MAX_BLOCK_FILE_SIZE)?;
        let mut tree = ChainTree::new();

        let mut entries: Vec<(Hash256, BlockIndexEntry)> = Vec::new();
        for (key, value) in store.scan_prefix(Column::BlockIndex, &[])? {
            if key.len() != 32 {
                return Err(ChainStateError::Corrupt("bad block index key"));
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key);
            let entry = BlockIndexEntry::decode(&value)
                .ok_or(ChainStateError::Corrupt("bad block index entry"))?;
            entries.push((hash, entry));
        }
        // Parents first so child links resolve as we go.
        entries.sort_by_key(|(_, entry)| entry.height);
        for (hash, entry) in entries {
            tree.insert(node_from_entry(hash, &entry));
        }

        if let Some(bytes) = store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            if bytes.len() != 32 {
                return Err(ChainStateError::Corrupt("bad best block pointer"));
            }
            let mut best = [0u8; 32];
            best.copy_from_slice(&bytes);
            if tree.set_best(&best).is_none() {
                return Err(ChainStateError::Corrupt("best block not in index"));
            }
        }

        if !tree.is_empty() {
            log_info!(
                "chain index loaded: {} blocks, best height {}",
                tree.len(),
                tree.best_height()
            );
        }

        Ok(Self {
            store,
            params,
            blocks,
            tree: Mutex::new(tree),
            orphans: Mutex::new(OrphanPool::default()),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Installs the genesis block. A no-op when the index already has it.
    pub fn install_genesis(&self, block: &Block) -> Result<(), ChainStateError> {
        let hash = block.hash();
        if hash != self.params.genesis_hash {
            return Err(ChainStateError::Corrupt("genesis hash mismatch"));
        }
        let mut tree = self.tree.lock().expect("chain lock");
        if tree.contains(&hash) {
            return Ok(());
        }

        let location = self.blocks.append(&block.consensus_encode())?;
        let trust = block_proof(block.header.bits)
            .map_err(|_| ChainStateError::Corrupt("genesis bits malformed"))?;
        let node = BlockIndexNode {
            hash,
            prev: [0u8; 32],
            height: 0,
            time: block.header.time,
            bits: block.header.bits,
            trust,
            proof_of_stake: false,
            stake_modifier: 0,
            proof_hash: hash,
            location: Some(location),
            next: None,
        };

        let mut batch = WriteBatch::new();
        self.persist_node(&mut batch, &node);
        batch.put(Column::HeightIndex, 0i32.to_le_bytes(), hash);
        batch.put(Column::Meta, META_BEST_BLOCK_KEY, hash);
        self.note_file_append(&mut batch, location)?;
        self.connect_transactions(&mut batch, block, &hash, location)?;

        tree.insert(node);
        let _ = tree.set_best(&hash);
        self.store.write_batch(&batch)?;
        log_info!("genesis installed: {}", short_hash(&hash));
        Ok(())
    }

    /// Runs one block through the full pipeline. `now` is the local clock in
    /// unix seconds; `from_peer` attributes any later orphan eviction.
    pub fn accept_block(
        &self,
        block: &Block,
        now: i64,
        from_peer: Option<u64>,
    ) -> Result<AcceptOutcome, ChainStateError> {
        let first = self.accept_one(block, now, from_peer)?;
        let AcceptOutcome::Accepted {
            hash,
            height,
            mut new_best,
            ..
        } = first
        else {
            return Ok(first);
        };

        // Reconsider orphans now connectable, breadth-first.
        let mut unorphaned = Vec::new();
        let mut parents = VecDeque::from([hash]);
        while let Some(parent) = parents.pop_front() {
            for (orphan_hash, bytes) in self.take_orphan_children(&parent)? {
                let orphan = match Block::consensus_decode(&bytes) {
                    Ok(block) => block,
                    Err(err) => {
                        log_warn!("corrupt orphan body {}: {err}", short_hash(&orphan_hash));
                        continue;
                    }
                };
                match self.accept_one(&orphan, now, None) {
                    Ok(AcceptOutcome::Accepted {
                        hash, new_best: became_best, ..
                    }) => {
                        unorphaned.push(hash);
                        new_best |= became_best;
                        parents.push_back(hash);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        log_debug!("orphan {} rejected: {err}", short_hash(&orphan_hash));
                    }
                }
            }
        }

        Ok(AcceptOutcome::Accepted {
            hash,
            height,
            new_best,
            unorphaned,
        })
    }

    fn accept_one(
        &self,
        block: &Block,
        now: i64,
        from_peer: Option<u64>,
    ) -> Result<AcceptOutcome, ChainStateError> {
        let hash = block.hash();

        // Shape rules need no chain context and run before the lock.
        check_block_structure(block)?;

        let mut tree = self.tree.lock().expect("chain lock");
        if tree.contains(&hash) {
            return Ok(AcceptOutcome::AlreadyKnown { hash });
        }

        let Some(prev) = tree.node(&block.header.prev_block).cloned() else {
            drop(tree);
            self.hold_orphan(&hash, block, from_peer)?;
            return Ok(AcceptOutcome::Orphan {
                hash,
                missing: block.header.prev_block,
            });
        };

        let height = prev.height + 1;
        let proof_of_stake = block.is_proof_of_stake();

        check_proof_gating(proof_of_stake, height, &self.params)?;
        let proof_hash = self.verify_proof(&tree, block, &hash, proof_of_stake, height)?;
        check_timestamps(
            block.header.time,
            prev.time,
            now,
            self.params.future_drift_secs,
        )?;
        for tx in &block.transactions {
            if !is_final_tx(tx, height, i64::from(block.header.time)) {
                return Err(Rejection::new("non-final transaction", 10).into());
            }
        }
        check_checkpoint(&self.params, height, &hash)?;
        if let Some(checkpoint) = self.params.last_checkpoint() {
            if height <= checkpoint.height && tree.main_chain_hash(height).is_some() {
                return Err(Rejection::new("fork below last checkpoint", 100).into());
            }
        }
        check_coinbase_height(block, height)?;

        // All rules passed; cross the durability boundary.
        let location = self.blocks.append(&block.consensus_encode())?;

        let proof = block_proof(block.header.bits)
            .map_err(|_| Rejection::new("malformed target bits", 100))?;
        let node = BlockIndexNode {
            hash,
            prev: prev.hash,
            height,
            time: block.header.time,
            bits: block.header.bits,
            trust: prev.trust + proof,
            proof_of_stake,
            stake_modifier: next_stake_modifier(prev.stake_modifier, &hash),
            proof_hash,
            location: Some(location),
            next: None,
        };

        let mut batch = WriteBatch::new();
        self.persist_node(&mut batch, &node);
        self.note_file_append(&mut batch, location)?;

        let best_trust = tree.best_node().map(|best| best.trust).unwrap_or_default();
        let new_best = node.trust > best_trust;
        let node_trust = node.trust;
        tree.insert(node);

        if new_best {
            let reorg = tree
                .set_best(&hash)
                .ok_or(ChainStateError::Corrupt("new tip vanished"))?;
            self.apply_reorg(&mut batch, &tree, &reorg, block, &hash, location)?;
            batch.put(Column::Meta, META_BEST_BLOCK_KEY, hash);
            log_info!(
                "new best block {} height {} trust {}",
                short_hash(&hash),
                height,
                node_trust
            );
        } else {
            log_debug!(
                "side chain block {} height {} accepted",
                short_hash(&hash),
                height
            );
        }

        self.store.write_batch(&batch)?;
        Ok(AcceptOutcome::Accepted {
            hash,
            height,
            new_best,
            unorphaned: Vec::new(),
        })
    }

    /// Proof verification: the target inequality for work blocks, the stake
    /// kernel plus signature and timestamp policy for stake blocks. The
    /// grandfathered legacy hashes skip only the target check.
    fn verify_proof(
        &self,
        tree: &ChainTree,
        block: &Block,
        hash: &Hash256,
        proof_of_stake: bool,
        height: i32,
    ) -> Result<Hash256, ChainStateError> {
        let exempt = self.params.is_proof_exception(hash);

        self.check_required_bits(tree, block, proof_of_stake)?;

        if !proof_of_stake {
            if !exempt {
                check_proof_of_work(hash, block.header.bits, &self.params.pow_limit)
                    .map_err(|_| Rejection::new("proof of work failed", 50))?;
            }
            return Ok(*hash);
        }

        check_stake_timestamps(block, self.params.future_drift_secs)
            .map_err(|_| Rejection::new("coinstake timestamp violation", 50))?;
        check_block_signature(block).map_err(|_| Rejection::new("bad block signature", 100))?;

        let coinstake = &block.transactions[1];
        let source = self.stake_source(tree, coinstake, height)?;
        if exempt {
            return Ok(*hash);
        }
        let kernel = check_stake_kernel(
            block.header.bits,
            &source,
            coinstake.time,
            &self.params.stake,
            &self.params.pos_limit,
        )
        .map_err(|_| Rejection::new("stake kernel check failed", 100))?;
        Ok(kernel)
    }

    /// Difficulty retarget: the claimed bits must match the continuous
    /// schedule over the last two blocks of the same proof type. With fewer
    /// than two on record the proof limit applies.
    fn check_required_bits(
        &self,
        tree: &ChainTree,
        block: &Block,
        proof_of_stake: bool,
    ) -> Result<(), ChainStateError> {
        let mut samples = Vec::with_capacity(2);
        let mut walk = tree.node(&block.header.prev_block);
        while let Some(node) = walk {
            if node.proof_of_stake == proof_of_stake {
                samples.push(HeaderSample {
                    time: i64::from(node.time),
                    bits: node.bits,
                });
                if samples.len() == 2 {
                    break;
                }
            }
            if node.height == 0 {
                break;
            }
            walk = tree.node(&node.prev);
        }

        let (limit, spacing) = if proof_of_stake {
            (&self.params.pos_limit, self.params.pos_target_spacing)
        } else {
            (&self.params.pow_limit, self.params.pow_target_spacing)
        };
        let last_two = match samples.as_slice() {
            [prev, prev_prev] => Some((prev, prev_prev)),
            _ => None,
        };
        let expected =
            next_target_required(last_two, limit, spacing, self.params.target_timespan_secs)
                .map_err(|_| Rejection::new("malformed target bits", 100))?;
        if block.header.bits != expected {
            return Err(Rejection::new("incorrect proof target", 100).into());
        }
        Ok(())
    }

    /// Resolves the staked output of a coinstake against the tx index and
    /// the block files, enforcing maturity and unspentness.
    fn stake_source(
        &self,
        tree: &ChainTree,
        coinstake: &Transaction,
        height: i32,
    ) -> Result<StakeSource, ChainStateError> {
        let prevout = coinstake.vin[0].prevout;
        let entry = txindex::get(self.store.as_ref(), &prevout.hash)?
            .ok_or(Rejection::new("stake source not found", 10))?;
        if entry.is_spent(prevout.index) {
            return Err(Rejection::new("stake source already spent", 100).into());
        }
        let source_node = tree
            .node(&entry.block_hash)
            .ok_or(ChainStateError::Corrupt("tx index points off the tree"))?;
        if height - source_node.height < self.params.stake.min_confirmations {
            return Err(Rejection::new("stake source immature", 100).into());
        }

        let body = self.blocks.read(entry.location)?;
        let source_block = Block::consensus_decode(&body)?;
        let source_tx = source_block
            .transactions
            .get(entry.tx_index as usize)
            .ok_or(ChainStateError::Corrupt("tx index out of block range"))?;
        let output = source_tx
            .vout
            .get(prevout.index as usize)
            .ok_or(Rejection::new("stake source output missing", 100))?;

        Ok(StakeSource {
            block_time: source_node.time,
            block_modifier: source_node.stake_modifier,
            tx_time: source_tx.time,
            amount: output.value,
            prevout,
        })
    }

    fn persist_node(&self, batch: &mut WriteBatch, node: &BlockIndexNode) {
        let mut flags = 0u8;
        if node.proof_of_stake {
            flags |= FLAG_PROOF_OF_STAKE;
        }
        if node.location.is_some() {
            flags |= FLAG_HAVE_DATA;
        }
        let entry = BlockIndexEntry {
            prev_hash: node.prev,
            height: node.height,
            time: node.time,
            bits: node.bits,
            trust: node.trust.to_big_endian(),
            flags,
            stake_modifier: node.stake_modifier,
            proof_hash: node.proof_hash,
            location: node.location,
        };
        batch.put(Column::BlockIndex, node.hash, entry.encode());
    }

    fn note_file_append(
        &self,
        batch: &mut WriteBatch,
        location: FileLocation,
    ) -> Result<(), ChainStateError> {
        let key = location.file_id.to_le_bytes();
        let (mut count, mut bytes) = match self.store.get(Column::FileInfo, &key)? {
            Some(existing) if existing.len() == 12 => (
                u32::from_le_bytes(existing[0..4].try_into().expect("4 bytes")),
                u64::from_le_bytes(existing[4..12].try_into().expect("8 bytes")),
            ),
            _ => (0, 0),
        };
        count += 1;
        bytes += u64::from(location.len) + 8;
        let mut value = [0u8; 12];
        value[0..4].copy_from_slice(&count.to_le_bytes());
        value[4..12].copy_from_slice(&bytes.to_le_bytes());
        batch.put(Column::FileInfo, key, value);

        let (file, len) = self.blocks.cursor();
        let mut cursor = [0u8; 12];
        cursor[0..4].copy_from_slice(&file.to_le_bytes());
        cursor[4..12].copy_from_slice(&len.to_le_bytes());
        batch.put(Column::Meta, META_FILE_CURSOR_KEY, cursor);
        Ok(())
    }

    /// Makes a best-path change durable: height map rows and the tx index
    /// follow the main chain.
    fn apply_reorg(
        &self,
        batch: &mut WriteBatch,
        tree: &ChainTree,
        reorg: &Reorg,
        new_block: &Block,
        new_hash: &Hash256,
        new_location: FileLocation,
    ) -> Result<(), ChainStateError> {
        if !reorg.disconnected.is_empty() {
            log_info!(
                "reorg: {} blocks disconnected, {} connected",
                reorg.disconnected.len(),
                reorg.connected.len()
            );
        }

        for hash in &reorg.disconnected {
            let node = tree
                .node(hash)
                .ok_or(ChainStateError::Corrupt("disconnected node missing"))?;
            batch.delete(Column::HeightIndex, node.height.to_le_bytes());
            let location = node
                .location
                .ok_or(ChainStateError::Corrupt("main-chain block without data"))?;
            let body = self.blocks.read(location)?;
            let block = Block::consensus_decode(&body)?;
            self.disconnect_transactions(batch, &block)?;
        }

        for hash in &reorg.connected {
            let node = tree
                .node(hash)
                .ok_or(ChainStateError::Corrupt("connected node missing"))?;
            batch.put(Column::HeightIndex, node.height.to_le_bytes(), *hash);
            if hash == new_hash {
                self.connect_transactions(batch, new_block, hash, new_location)?;
            } else {
                let location = node
                    .location
                    .ok_or(ChainStateError::Corrupt("main-chain block without data"))?;
                let body = self.blocks.read(location)?;
                let block = Block::consensus_decode(&body)?;
                self.connect_transactions(batch, &block, hash, location)?;
            }
        }
        Ok(())
    }

    fn connect_transactions(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        block_hash: &Hash256,
        location: FileLocation,
    ) -> Result<(), ChainStateError> {
        // Entries touched by this block, including in-block spends.
        let mut touched: HashMap<Hash256, TxIndexEntry> = HashMap::new();
        for (position, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();
            touched.insert(
                txid,
                TxIndexEntry::new(*block_hash, location, position as u32, tx.vout.len()),
            );
            for input in &tx.vin {
                if input.prevout.is_null() {
                    continue;
                }
                let funding = match touched.get_mut(&input.prevout.hash) {
                    Some(entry) => Some(entry),
                    None => {
                        if let Some(entry) =
                            txindex::get(self.store.as_ref(), &input.prevout.hash)?
                        {
                            touched.insert(input.prevout.hash, entry);
                            touched.get_mut(&input.prevout.hash)
                        } else {
                            None
                        }
                    }
                };
                match funding {
                    Some(entry) => {
                        if let Some(slot) = entry.spenders.get_mut(input.prevout.index as usize) {
                            *slot = Some(txid);
                        }
                    }
                    None => {
                        log_debug!(
                            "input {} of {} not in tx index",
                            input.prevout.index,
                            short_hash(&input.prevout.hash)
                        );
                    }
                }
            }
        }
        for (txid, entry) in &touched {
            txindex::put(batch, txid, entry);
        }
        Ok(())
    }

    fn disconnect_transactions(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
    ) -> Result<(), ChainStateError> {
        for tx in block.transactions.iter().rev() {
            txindex::delete(batch, &tx.txid());
            for input in &tx.vin {
                if input.prevout.is_null() {
                    continue;
                }
                if let Some(mut entry) = txindex::get(self.store.as_ref(), &input.prevout.hash)? {
                    if let Some(slot) = entry.spenders.get_mut(input.prevout.index as usize) {
                        *slot = None;
                    }
                    txindex::put(batch, &input.prevout.hash, &entry);
                }
            }
        }
        Ok(())
    }

    fn hold_orphan(
        &self,
        hash: &Hash256,
        block: &Block,
        from_peer: Option<u64>,
    ) -> Result<(), ChainStateError> {
        let mut orphans = self.orphans.lock().expect("orphan lock");
        if orphans.entries.contains_key(hash) {
            return Ok(());
        }
        while orphans.entries.len() >= MAX_ORPHAN_BLOCKS {
            let Some(oldest) = orphans.order.front().copied() else {
                break;
            };
            orphans.remove(&oldest);
            self.store.delete(Column::OrphanBlock, &oldest)?;
            log_debug!("orphan pool full, evicted {}", short_hash(&oldest));
        }
        self.store
            .put(Column::OrphanBlock, hash, &block.consensus_encode())?;
        orphans.entries.insert(
            *hash,
            OrphanEntry {
                prev: block.header.prev_block,
                peer: from_peer,
            },
        );
        orphans
            .by_prev
            .entry(block.header.prev_block)
            .or_default()
            .push(*hash);
        orphans.order.push_back(*hash);
        log_info!(
            "orphan block {} held, missing parent {}",
            short_hash(hash),
            short_hash(&block.header.prev_block)
        );
        Ok(())
    }

    fn take_orphan_children(
        &self,
        parent: &Hash256,
    ) -> Result<Vec<(Hash256, Vec<u8>)>, ChainStateError> {
        let hashes = {
            let mut orphans = self.orphans.lock().expect("orphan lock");
            let Some(children) = orphans.by_prev.remove(parent) else {
                return Ok(Vec::new());
            };
            for child in &children {
                orphans.entries.remove(child);
                orphans.order.retain(|pending| pending != child);
            }
            children
        };
        let mut bodies = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(bytes) = self.store.get(Column::OrphanBlock, &hash)? {
                bodies.push((hash, bytes));
            }
            self.store.delete(Column::OrphanBlock, &hash)?;
        }
        Ok(bodies)
    }

    /// Drops orphans attributed to a disconnecting peer.
    pub fn forget_peer_orphans(&self, peer: u64) -> Result<(), ChainStateError> {
        let removed: Vec<Hash256> = {
            let mut orphans = self.orphans.lock().expect("orphan lock");
            let hashes: Vec<Hash256> = orphans
                .entries
                .iter()
                .filter(|(_, entry)| entry.peer == Some(peer))
                .map(|(hash, _)| *hash)
                .collect();
            for hash in &hashes {
                orphans.remove(hash);
            }
            hashes
        };
        for hash in &removed {
            self.store.delete(Column::OrphanBlock, hash)?;
        }
        Ok(())
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().expect("orphan lock").entries.len()
    }

    pub fn best_hash(&self) -> Option<Hash256> {
        self.tree.lock().expect("chain lock").best_hash()
    }

    pub fn best_height(&self) -> i32 {
        self.tree.lock().expect("chain lock").best_height()
    }

    pub fn is_known(&self, hash: &Hash256) -> bool {
        self.tree.lock().expect("chain lock").contains(hash)
    }

    pub fn main_chain_hash(&self, height: i32) -> Option<Hash256> {
        self.tree.lock().expect("chain lock").main_chain_hash(height)
    }

    /// Locator for the current best tip, for get-blocks requests.
    pub fn best_locator(&self) -> Vec<Hash256> {
        let tree = self.tree.lock().expect("chain lock");
        match tree.best_hash() {
            Some(best) => tree.locator(&best),
            None => Vec::new(),
        }
    }

    /// Answers a get-blocks request: main-chain hashes after the first
    /// locator entry we recognize, up to the stop hash or the batch limit.
    pub fn blocks_after_locator(&self, locator: &[Hash256], stop: &Hash256) -> Vec<Hash256> {
        let tree = self.tree.lock().expect("chain lock");
        let mut start_height = 0;
        for hash in locator {
            if tree.is_main_chain(hash) {
                if let Some(node) = tree.node(hash) {
                    start_height = node.height;
                    break;
                }
            }
        }
        let mut inventory = Vec::new();
        let mut height = start_height + 1;
        while inventory.len() < GETBLOCKS_LIMIT {
            let Some(hash) = tree.main_chain_hash(height) else {
                break;
            };
            inventory.push(hash);
            if hash == *stop {
                break;
            }
            height += 1;
        }
        inventory
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        let location = {
            let tree = self.tree.lock().expect("chain lock");
            match tree.node(hash).and_then(|node| node.location) {
                Some(location) => location,
                None => return Ok(None),
            }
        };
        let body = self.blocks.read(location)?;
        Ok(Some(Block::consensus_decode(&body)?))
    }

    /// Looks up an output by outpoint, reading the funding transaction back
    /// out of the block files.
    pub fn output(
        &self,
        txid: &Hash256,
        index: u32,
    ) -> Result<Option<TxOut>, ChainStateError> {
        let Some(entry) = txindex::get(self.store.as_ref(), txid)? else {
            return Ok(None);
        };
        let body = self.blocks.read(entry.location)?;
        let block = Block::consensus_decode(&body)?;
        let Some(tx) = block.transactions.get(entry.tx_index as usize) else {
            return Err(ChainStateError::Corrupt("tx index out of block range"));
        };
        Ok(tx.vout.get(index as usize).cloned())
    }

    /// Whether an outpoint exists on the main chain and is unspent.
    pub fn is_spendable(&self, txid: &Hash256, index: u32) -> Result<bool, ChainStateError> {
        match txindex::get(self.store.as_ref(), txid)? {
            Some(entry) => Ok(!entry.is_spent(index)),
            None => Ok(false),
        }
    }
}

fn node_from_entry(hash: Hash256, entry: &BlockIndexEntry) -> BlockIndexNode {
    BlockIndexNode {
        hash,
        prev: entry.prev_hash,
        height: entry.height,
        time: entry.time,
        bits: entry.bits,
        trust: U256::from_big_endian(&entry.trust),
        proof_of_stake: entry.is_proof_of_stake(),
        stake_modifier: entry.stake_modifier,
        proof_hash: entry.proof_hash,
        location: entry.location,
        next: None,
    }
}

/// First eight display-order hex digits, for logs.
fn short_hash(hash: &Hash256) -> String {
    let mut out = String::with_capacity(8);
    for byte in hash.iter().rev().take(4) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
