//! Transaction index: txid to block location plus per-output spend marks.
//!
//! Maintained only for main-chain blocks. The spend marks let the mixing
//! coordinator answer "is this outpoint still spendable" without a full
//! UTXO set.

use umbra_consensus::Hash256;
use umbra_primitives::encoding::{Decoder, Encoder};
use umbra_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::flatfiles::FileLocation;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIndexEntry {
    /// Block this transaction was connected in.
    pub block_hash: Hash256,
    /// Location of the containing block's body.
    pub location: FileLocation,
    /// Position within the block's transaction list.
    pub tx_index: u32,
    /// For each output, the txid that spent it, if any.
    pub spenders: Vec<Option<Hash256>>,
}

impl TxIndexEntry {
    pub fn new(block_hash: Hash256, location: FileLocation, tx_index: u32, outputs: usize) -> Self {
        Self {
            block_hash,
            location,
            tx_index,
            spenders: vec![None; outputs],
        }
    }

    pub fn is_spent(&self, output_index: u32) -> bool {
        self.spenders
            .get(output_index as usize)
            .map(Option::is_some)
            .unwrap_or(true)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash_le(&self.block_hash);
        encoder.write_bytes(&self.location.encode());
        encoder.write_u32_le(self.tx_index);
        encoder.write_varint(self.spenders.len() as u64);
        for spender in &self.spenders {
            match spender {
                Some(txid) => {
                    encoder.write_u8(1);
                    encoder.write_hash_le(txid);
                }
                None => encoder.write_u8(0),
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut decoder = Decoder::new(bytes);
        let block_hash = decoder.read_hash_le().ok()?;
        let location = FileLocation::decode(&decoder.read_fixed::<16>().ok()?)?;
        let tx_index = decoder.read_u32_le().ok()?;
        let count = decoder.read_varint().ok()?;
        let count = usize::try_from(count).ok()?;
        let mut spenders = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let spender = match decoder.read_u8().ok()? {
                0 => None,
                _ => Some(decoder.read_hash_le().ok()?),
            };
            spenders.push(spender);
        }
        if !decoder.is_empty() {
            return None;
        }
        Some(Self {
            block_hash,
            location,
            tx_index,
            spenders,
        })
    }
}

pub fn get<S: KeyValueStore>(store: &S, txid: &Hash256) -> Result<Option<TxIndexEntry>, StoreError> {
    let Some(bytes) = store.get(Column::TxIndex, txid)? else {
        return Ok(None);
    };
    TxIndexEntry::decode(&bytes)
        .ok_or_else(|| StoreError::Backend("corrupt tx index entry".to_string()))
        .map(Some)
}

pub fn put(batch: &mut WriteBatch, txid: &Hash256, entry: &TxIndexEntry) {
    batch.put(Column::TxIndex, txid, entry.encode());
}

pub fn delete(batch: &mut WriteBatch, txid: &Hash256) {
    batch.delete(Column::TxIndex, txid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips() {
        let entry = TxIndexEntry {
            block_hash: [7; 32],
            location: FileLocation {
                file_id: 1,
                offset: 2048,
                len: 300,
            },
            tx_index: 4,
            spenders: vec![None, Some([9; 32]), None],
        };
        assert_eq!(TxIndexEntry::decode(&entry.encode()), Some(entry));
    }

    #[test]
    fn spend_marks_answer_spendability() {
        let mut entry = TxIndexEntry::new([1; 32], FileLocation { file_id: 0, offset: 0, len: 1 }, 0, 2);
        assert!(!entry.is_spent(0));
        entry.spenders[0] = Some([2; 32]);
        assert!(entry.is_spent(0));
        // Out-of-range outputs read as spent, never as free money.
        assert!(entry.is_spent(5));
    }
}
