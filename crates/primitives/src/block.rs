//! Block and header types.
//!
//! The block identity is the double-SHA256 of the 80-byte header. The block
//! signature that proof-of-stake blocks carry after the transaction list is
//! outside the hash domain, so re-signing a block does not change its hash.

use umbra_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        <Self as Encodable>::consensus_encode(self, &mut encoder);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        crate::encoding::decode(bytes)
    }

    /// Block identity and, for proof-of-work blocks, the proof hash.
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Staker's signature over the block hash. Empty on proof-of-work blocks.
    pub signature: Vec<u8>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
            signature: Vec::new(),
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// A block stakes if its second transaction is a coinstake. The first is
    /// always the coinbase; the remainder are user transactions.
    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    pub fn is_proof_of_work(&self) -> bool {
        !self.is_proof_of_stake()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        crate::encoding::encode(self)
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        crate::encoding::decode(bytes)
    }

    pub fn serialized_size(&self) -> usize {
        self.consensus_encode().len()
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        <BlockHeader as Encodable>::consensus_encode(&self.header, encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            <Transaction as Encodable>::consensus_encode(tx, encoder);
        }
        encoder.write_var_bytes(&self.signature);
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = <BlockHeader as Decodable>::consensus_decode(decoder)?;

        let tx_count = decoder.read_varint()?;
        let tx_count = usize::try_from(tx_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut transactions = Vec::with_capacity(tx_count.min(1024));
        for _ in 0..tx_count {
            transactions.push(Transaction::decode_from(decoder)?);
        }

        let signature = decoder.read_var_bytes()?;
        Ok(Self {
            header,
            transactions,
            signature,
        })
    }
}
