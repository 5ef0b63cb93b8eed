//! Persistent store backed by fjall, one partition per column.

use std::path::Path;
use std::time::Instant;

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use umbra_log::log_warn;

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

const SLOW_COMMIT_MILLIS: u128 = 500;

pub struct FjallStore {
    keyspace: Keyspace,
    // Indexed by Column::index().
    partitions: Vec<PartitionHandle>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let keyspace = Config::new(path).open().map_err(backend)?;
        let partitions = Column::ALL
            .iter()
            .map(|column| {
                keyspace.open_partition(column.as_str(), PartitionCreateOptions::default())
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        Ok(Self {
            keyspace,
            partitions,
        })
    }

    fn partition(&self, column: Column) -> &PartitionHandle {
        &self.partitions[column.index()]
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let found = self.partition(column).get(key).map_err(backend)?;
        Ok(found.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column).insert(key, value).map_err(backend)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column).remove(key).map_err(backend)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.partition(column)
            .prefix(prefix)
            .map(|entry| {
                entry
                    .map(|(key, value)| (key.to_vec(), value.to_vec()))
                    .map_err(backend)
            })
            .collect()
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut staged = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(PersistMode::Buffer));
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    staged.insert(self.partition(*column), key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    staged.remove(self.partition(*column), key.as_slice());
                }
            }
        }

        let started = Instant::now();
        let op_count = batch.len();
        staged.commit().map_err(backend)?;
        let elapsed = started.elapsed().as_millis();
        if elapsed >= SLOW_COMMIT_MILLIS {
            log_warn!("slow store commit: {elapsed}ms for {op_count} op(s)");
        }
        Ok(())
    }
}

fn backend(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
