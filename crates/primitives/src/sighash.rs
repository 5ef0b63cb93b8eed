//! Signature hashing for transaction inputs.
//!
//! Only the ALL type exists on this chain: every signature commits to the
//! whole transaction, with the signed input's script slot holding the output
//! script it spends and every other script slot empty.

use umbra_consensus::Hash256;

use crate::encoding::{Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const SIGHASH_ALL: u32 = 0x01;

#[derive(Debug, Eq, PartialEq)]
pub enum SighashError {
    InputIndexOutOfRange,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
        }
    }
}

impl std::error::Error for SighashError {}

pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_pubkey: &[u8],
    hash_type: u32,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);
    encoder.write_u32_le(tx.time);
    encoder.write_varint(tx.vin.len() as u64);
    for (index, input) in tx.vin.iter().enumerate() {
        input.prevout.consensus_encode(&mut encoder);
        if index == input_index {
            encoder.write_var_bytes(script_pubkey);
        } else {
            encoder.write_var_bytes(&[]);
        }
        encoder.write_u32_le(input.sequence);
    }
    encoder.write_varint(tx.vout.len() as u64);
    for output in &tx.vout {
        output.consensus_encode(&mut encoder);
    }
    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(hash_type);

    Ok(sha256d(&encoder.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outpoint::OutPoint;
    use crate::transaction::{TxIn, TxOut};

    fn two_input_tx() -> Transaction {
        Transaction {
            version: 1,
            time: 1_700_000_000,
            vin: vec![
                TxIn::new(OutPoint::new([1u8; 32], 0), vec![0xaa]),
                TxIn::new(OutPoint::new([2u8; 32], 1), vec![0xbb]),
            ],
            vout: vec![TxOut::new(50_000, vec![0x51])],
            lock_time: 0,
        }
    }

    #[test]
    fn script_sig_contents_do_not_affect_the_hash() {
        let tx = two_input_tx();
        let mut stripped = tx.clone();
        stripped.vin[0].script_sig.clear();
        stripped.vin[1].script_sig = vec![0xff; 40];

        let script = [0x51];
        let a = signature_hash(&tx, 0, &script, SIGHASH_ALL).expect("hash");
        let b = signature_hash(&stripped, 0, &script, SIGHASH_ALL).expect("hash");
        assert_eq!(a, b);
    }

    #[test]
    fn each_input_signs_a_distinct_message() {
        let tx = two_input_tx();
        let script = [0x51];
        let a = signature_hash(&tx, 0, &script, SIGHASH_ALL).expect("hash");
        let b = signature_hash(&tx, 1, &script, SIGHASH_ALL).expect("hash");
        assert_ne!(a, b);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let tx = two_input_tx();
        assert_eq!(
            signature_hash(&tx, 2, &[], SIGHASH_ALL),
            Err(SighashError::InputIndexOutOfRange)
        );
    }
}
