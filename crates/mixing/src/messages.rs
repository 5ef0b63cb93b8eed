//! Mixing wire payloads. Framing and command dispatch live in the node.

use umbra_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::transaction::{Transaction, TxIn, TxOut};

use crate::error::PoolError;
use crate::session::PoolState;

pub const CMD_JOIN: &str = "dsa";
pub const CMD_QUEUE: &str = "dsq";
pub const CMD_ENTRY: &str = "dsi";
pub const CMD_STATUS: &str = "dssu";
pub const CMD_SIGNATURES: &str = "dss";
pub const CMD_FINAL_TX: &str = "dsf";
pub const CMD_COMPLETE: &str = "dsc";

fn decode_all<T>(bytes: &[u8], parse: impl FnOnce(&mut Decoder) -> Result<T, DecodeError>) -> Result<T, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let value = parse(&mut decoder)?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(value)
}

fn write_error(encoder: &mut Encoder, error: Option<PoolError>) {
    match error {
        Some(error) => {
            encoder.write_u8(1);
            encoder.write_u8(error.as_code());
        }
        None => encoder.write_u8(0),
    }
}

fn read_error(decoder: &mut Decoder) -> Result<Option<PoolError>, DecodeError> {
    if decoder.read_u8()? == 0 {
        return Ok(None);
    }
    let code = decoder.read_u8()?;
    PoolError::from_code(code)
        .map(Some)
        .ok_or(DecodeError::InvalidData("unknown pool error code"))
}

/// `dsa`: ask a coordinator for a seat in a round.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinRequest {
    pub denomination: u32,
    pub collateral: Transaction,
}

impl JoinRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.denomination);
        Encodable::consensus_encode(&self.collateral, &mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_all(bytes, |decoder| {
            Ok(Self {
                denomination: decoder.read_u32_le()?,
                collateral: Transaction::decode_from(decoder)?,
            })
        })
    }
}

/// `dsq`: a coordinator advertises (or readies) a round.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueAnnounce {
    pub denomination: u32,
    /// Collateral outpoint identifying the announcing masternode.
    pub coordinator: OutPoint,
    pub time: i64,
    /// Set once the round has enough joiners and wants entries now.
    pub ready: bool,
    pub signature: Vec<u8>,
}

impl QueueAnnounce {
    /// Bytes the masternode signs: everything except the signature itself.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.denomination);
        self.coordinator.consensus_encode(&mut encoder);
        encoder.write_i64_le(self.time);
        encoder.write_u8(u8::from(self.ready));
        encoder.into_inner()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.denomination);
        self.coordinator.consensus_encode(&mut encoder);
        encoder.write_i64_le(self.time);
        encoder.write_u8(u8::from(self.ready));
        encoder.write_var_bytes(&self.signature);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_all(bytes, |decoder| {
            Ok(Self {
                denomination: decoder.read_u32_le()?,
                coordinator: OutPoint::consensus_decode(decoder)?,
                time: decoder.read_i64_le()?,
                ready: decoder.read_u8()? != 0,
                signature: decoder.read_var_bytes()?,
            })
        })
    }
}

/// `dsi`: a client's inputs and outputs for the round.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitEntry {
    pub inputs: Vec<TxIn>,
    pub amount: i64,
    pub collateral: Transaction,
    pub outputs: Vec<TxOut>,
}

impl SubmitEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.consensus_encode(&mut encoder);
        }
        encoder.write_i64_le(self.amount);
        Encodable::consensus_encode(&self.collateral, &mut encoder);
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.consensus_encode(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_all(bytes, |decoder| {
            let input_count = decoder.read_varint()?;
            let input_count = usize::try_from(input_count).map_err(|_| DecodeError::SizeTooLarge)?;
            let mut inputs = Vec::with_capacity(input_count.min(64));
            for _ in 0..input_count {
                inputs.push(TxIn::consensus_decode(decoder)?);
            }
            let amount = decoder.read_i64_le()?;
            let collateral = Transaction::decode_from(decoder)?;
            let output_count = decoder.read_varint()?;
            let output_count =
                usize::try_from(output_count).map_err(|_| DecodeError::SizeTooLarge)?;
            let mut outputs = Vec::with_capacity(output_count.min(64));
            for _ in 0..output_count {
                outputs.push(TxOut::consensus_decode(decoder)?);
            }
            Ok(Self {
                inputs,
                amount,
                collateral,
                outputs,
            })
        })
    }
}

/// `dssu`: coordinator progress feedback.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    pub session_id: u32,
    pub state: PoolState,
    pub entry_count: u32,
    pub accepted: bool,
    pub error: Option<PoolError>,
}

impl StatusUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.session_id);
        encoder.write_u8(self.state.as_u8());
        encoder.write_u32_le(self.entry_count);
        encoder.write_u8(u8::from(self.accepted));
        write_error(&mut encoder, self.error);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_all(bytes, |decoder| {
            Ok(Self {
                session_id: decoder.read_u32_le()?,
                state: PoolState::from_u8(decoder.read_u8()?)
                    .ok_or(DecodeError::InvalidData("unknown pool state"))?,
                entry_count: decoder.read_u32_le()?,
                accepted: decoder.read_u8()? != 0,
                error: read_error(decoder)?,
            })
        })
    }
}

/// `dss`: signed inputs, matched to entries by prevout.
#[derive(Clone, Debug, PartialEq)]
pub struct SignatureShare {
    pub session_id: u32,
    pub inputs: Vec<TxIn>,
}

impl SignatureShare {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.session_id);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.consensus_encode(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_all(bytes, |decoder| {
            let session_id = decoder.read_u32_le()?;
            let count = decoder.read_varint()?;
            let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
            let mut inputs = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                inputs.push(TxIn::consensus_decode(decoder)?);
            }
            Ok(Self { session_id, inputs })
        })
    }
}

/// `dsf`: the joint transaction to co-sign.
#[derive(Clone, Debug, PartialEq)]
pub struct FinalTransaction {
    pub session_id: u32,
    pub tx: Transaction,
}

impl FinalTransaction {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.session_id);
        Encodable::consensus_encode(&self.tx, &mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_all(bytes, |decoder| {
            Ok(Self {
                session_id: decoder.read_u32_le()?,
                tx: Transaction::decode_from(decoder)?,
            })
        })
    }
}

/// `dsc`: round outcome.
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub session_id: u32,
    pub error: Option<PoolError>,
}

impl Completion {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.session_id);
        write_error(&mut encoder, self.error);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_all(bytes, |decoder| {
            Ok(Self {
                session_id: decoder.read_u32_le()?,
                error: read_error(decoder)?,
            })
        })
    }
}
