//! Key-value storage abstraction shared by the chain and masternode layers.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    /// Singleton pointers: best tip hash, block file cursor.
    Meta,
    /// Hash-keyed block index entries (the durable copy of the tree).
    BlockIndex,
    /// Main-chain height to block hash, rewritten on reorg.
    HeightIndex,
    /// Txid to location and per-output spend info.
    TxIndex,
    /// Raw bodies of blocks whose parent is still unknown.
    OrphanBlock,
    /// Per block-file record counts and byte sizes.
    FileInfo,
    /// Masternode records keyed by collateral outpoint.
    Masternode,
}

impl Column {
    pub const ALL: [Column; 7] = [
        Column::Meta,
        Column::BlockIndex,
        Column::HeightIndex,
        Column::TxIndex,
        Column::OrphanBlock,
        Column::FileInfo,
        Column::Masternode,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Meta => "meta",
            Column::BlockIndex => "block_index",
            Column::HeightIndex => "height_index",
            Column::TxIndex => "tx_index",
            Column::OrphanBlock => "orphan_block",
            Column::FileInfo => "file_info",
            Column::Masternode => "masternode",
        }
    }
}

/// Owned byte buffer with a stack-allocated fast path for the short keys
/// and values batches are mostly made of.
#[derive(Clone, Debug)]
pub struct StackBytes<const CAP: usize>(SmallVec<[u8; CAP]>);

impl<const CAP: usize> StackBytes<CAP> {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.into_vec()
    }
}

impl<const CAP: usize> AsRef<[u8]> for StackBytes<CAP> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const CAP: usize> From<Vec<u8>> for StackBytes<CAP> {
    fn from(bytes: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(bytes))
    }
}

impl<const CAP: usize> From<&[u8]> for StackBytes<CAP> {
    fn from(bytes: &[u8]) -> Self {
        Self(SmallVec::from_slice(bytes))
    }
}

impl<const CAP: usize, const N: usize> From<[u8; N]> for StackBytes<CAP> {
    fn from(bytes: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&bytes))
    }
}

impl<const CAP: usize, const N: usize> From<&[u8; N]> for StackBytes<CAP> {
    fn from(bytes: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(bytes))
    }
}

/// Keys are almost always a hash or a hash plus a small discriminant.
pub type WriteKey = StackBytes<40>;
pub type WriteValue = StackBytes<64>;

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

/// Ordered set of mutations committed atomically by `write_batch`.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}
