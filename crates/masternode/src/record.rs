//! Durable masternode record, keyed by collateral outpoint.

use umbra_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use umbra_primitives::outpoint::OutPoint;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MasternodeState {
    PreEnabled,
    Enabled,
    Expired,
    Removed,
}

impl MasternodeState {
    pub fn as_u8(self) -> u8 {
        match self {
            MasternodeState::PreEnabled => 0,
            MasternodeState::Enabled => 1,
            MasternodeState::Expired => 2,
            MasternodeState::Removed => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MasternodeState::PreEnabled),
            1 => Some(MasternodeState::Enabled),
            2 => Some(MasternodeState::Expired),
            3 => Some(MasternodeState::Removed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MasternodeRecord {
    /// The locked deposit that backs the node's identity.
    pub collateral: OutPoint,
    /// Compressed secp256k1 key the node signs announcements with.
    pub pubkey: Vec<u8>,
    /// Advertised reachable address, `host:port`.
    pub address: String,
    pub protocol_version: i32,
    pub registered_height: u32,
    /// Unix time of the last message seen from this node.
    pub last_seen: i64,
    pub state: MasternodeState,
    /// Queue counter value at this node's last queue announcement.
    pub last_queue_seq: u64,
}

impl MasternodeRecord {
    pub fn is_enabled(&self) -> bool {
        self.state == MasternodeState::Enabled
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.collateral.consensus_encode(&mut encoder);
        encoder.write_var_bytes(&self.pubkey);
        encoder.write_var_str(&self.address);
        encoder.write_i32_le(self.protocol_version);
        encoder.write_u32_le(self.registered_height);
        encoder.write_i64_le(self.last_seen);
        encoder.write_u8(self.state.as_u8());
        encoder.write_u64_le(self.last_queue_seq);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let collateral = OutPoint::consensus_decode(&mut decoder)?;
        let pubkey = decoder.read_var_bytes()?;
        let address = decoder.read_var_str()?;
        let protocol_version = decoder.read_i32_le()?;
        let registered_height = decoder.read_u32_le()?;
        let last_seen = decoder.read_i64_le()?;
        let state = MasternodeState::from_u8(decoder.read_u8()?)
            .ok_or(DecodeError::InvalidData("unknown masternode state"))?;
        let last_queue_seq = decoder.read_u64_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            collateral,
            pubkey,
            address,
            protocol_version,
            registered_height,
            last_seen,
            state,
            last_queue_seq,
        })
    }

    /// Storage key: the 36-byte serialized collateral outpoint.
    pub fn storage_key(collateral: &OutPoint) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(36);
        collateral.consensus_encode(&mut encoder);
        encoder.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MasternodeRecord {
        MasternodeRecord {
            collateral: OutPoint::new([5; 32], 1),
            pubkey: vec![0x02; 33],
            address: "203.0.113.7:9637".to_string(),
            protocol_version: 70_054,
            registered_height: 1200,
            last_seen: 1_700_000_000,
            state: MasternodeState::Enabled,
            last_queue_seq: 42,
        }
    }

    #[test]
    fn record_round_trips() {
        let record = sample();
        let decoded = MasternodeRecord::decode(&record.encode()).expect("decode");
        assert_eq!(decoded, record);
        assert!(decoded.is_enabled());
    }

    #[test]
    fn unknown_state_is_rejected() {
        let mut bytes = sample().encode();
        let state_offset = bytes.len() - 9;
        bytes[state_offset] = 9;
        assert!(MasternodeRecord::decode(&bytes).is_err());
    }

    #[test]
    fn truncated_record_is_rejected() {
        let bytes = sample().encode();
        assert!(MasternodeRecord::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
