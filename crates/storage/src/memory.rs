//! In-memory store used by tests and non-persistent runs.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn visit_prefix<F>(&self, column: Column, prefix: &[u8], mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&[u8], &[u8]) -> Result<(), StoreError>,
    {
        let guard = self.inner.read().expect("memory store lock");
        let start = Bound::Included((column, prefix.to_vec()));
        for ((entry_column, key), value) in guard.range((start, Bound::Unbounded)) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            f(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut results = Vec::new();
        self.visit_prefix(column, prefix, |key, value| {
            results.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        Ok(results)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert(
                        (*column, key.as_slice().to_vec()),
                        value.as_slice().to_vec(),
                    );
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_stays_in_column() {
        let store = MemoryStore::new();
        store.put(Column::TxIndex, b"aa1", b"one").expect("put");
        store.put(Column::TxIndex, b"aa2", b"two").expect("put");
        store.put(Column::TxIndex, b"ab1", b"other").expect("put");
        store.put(Column::OrphanBlock, b"aa9", b"wrong").expect("put");

        let hits = store.scan_prefix(Column::TxIndex, b"aa").expect("scan");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, b"aa1".to_vec());
        assert_eq!(hits[1].1, b"two".to_vec());
    }

    #[test]
    fn batch_applies_puts_and_deletes() {
        let store = MemoryStore::new();
        store.put(Column::Meta, b"gone", b"x").expect("put");

        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"tip".to_vec(), b"hash".to_vec());
        batch.delete(Column::Meta, b"gone".to_vec());
        store.write_batch(&batch).expect("batch");

        assert_eq!(
            store.get(Column::Meta, b"tip").expect("get"),
            Some(b"hash".to_vec())
        );
        assert_eq!(store.get(Column::Meta, b"gone").expect("get"), None);
    }
}
