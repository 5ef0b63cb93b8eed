//! Durable form of a chain-tree node, one entry per known block.
//!
//! The in-memory tree is rebuilt from these entries at startup; parent and
//! child links are resolved by hash, never stored.

use umbra_consensus::Hash256;
use umbra_primitives::encoding::{Decoder, Encoder};

use crate::flatfiles::FileLocation;

pub const FLAG_PROOF_OF_STAKE: u8 = 1 << 0;
pub const FLAG_HAVE_DATA: u8 = 1 << 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockIndexEntry {
    pub prev_hash: Hash256,
    pub height: i32,
    pub time: u32,
    pub bits: u32,
    /// Cumulative trust in big-endian bytes, comparable as raw bytes.
    pub trust: [u8; 32],
    pub flags: u8,
    pub stake_modifier: u64,
    /// Kernel hash for stake blocks, header hash for work blocks.
    pub proof_hash: Hash256,
    pub location: Option<FileLocation>,
}

impl BlockIndexEntry {
    pub fn is_proof_of_stake(&self) -> bool {
        (self.flags & FLAG_PROOF_OF_STAKE) != 0
    }

    pub fn has_data(&self) -> bool {
        (self.flags & FLAG_HAVE_DATA) != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash_le(&self.prev_hash);
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_bytes(&self.trust);
        encoder.write_u8(self.flags);
        encoder.write_u64_le(self.stake_modifier);
        encoder.write_hash_le(&self.proof_hash);
        match self.location {
            Some(location) => {
                encoder.write_u8(1);
                encoder.write_bytes(&location.encode());
            }
            None => encoder.write_u8(0),
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut decoder = Decoder::new(bytes);
        let prev_hash = decoder.read_hash_le().ok()?;
        let height = decoder.read_i32_le().ok()?;
        let time = decoder.read_u32_le().ok()?;
        let bits = decoder.read_u32_le().ok()?;
        let trust = decoder.read_fixed::<32>().ok()?;
        let flags = decoder.read_u8().ok()?;
        let stake_modifier = decoder.read_u64_le().ok()?;
        let proof_hash = decoder.read_hash_le().ok()?;
        let location = match decoder.read_u8().ok()? {
            0 => None,
            _ => Some(FileLocation::decode(&decoder.read_fixed::<16>().ok()?)?),
        };
        if !decoder.is_empty() {
            return None;
        }
        Some(Self {
            prev_hash,
            height,
            time,
            bits,
            trust,
            flags,
            stake_modifier,
            proof_hash,
            location,
        })
    }
}
