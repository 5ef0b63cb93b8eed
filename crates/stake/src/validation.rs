//! Block signature and coinstake timestamp rules.

use std::sync::OnceLock;

use umbra_primitives::block::Block;
use umbra_primitives::script::extract_pubkey;

use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

fn secp256k1_verify() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1_VERIFY.get_or_init(Secp256k1::verification_only)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    InvalidBlock(&'static str),
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::InvalidBlock(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Work blocks must be unsigned. Stake blocks must carry a DER signature over
/// the block hash by the key the coinstake pays, in pay-to-pubkey form.
pub fn check_block_signature(block: &Block) -> Result<(), SignatureError> {
    if block.is_proof_of_work() {
        if block.signature.is_empty() {
            return Ok(());
        }
        return Err(SignatureError::InvalidBlock("work block carries signature"));
    }

    if block.signature.is_empty() {
        return Err(SignatureError::InvalidBlock("stake block missing signature"));
    }

    let coinstake = &block.transactions[1];
    let paying = coinstake
        .vout
        .get(1)
        .ok_or(SignatureError::InvalidBlock("coinstake missing staker output"))?;
    let pubkey_bytes = extract_pubkey(&paying.script_pubkey).ok_or(SignatureError::InvalidBlock(
        "staker output is not pay-to-pubkey",
    ))?;

    let pubkey = PublicKey::from_slice(pubkey_bytes)
        .map_err(|_| SignatureError::InvalidBlock("invalid staker pubkey"))?;
    let sig = Signature::from_der(&block.signature)
        .map_err(|_| SignatureError::InvalidBlock("malformed block signature"))?;
    let msg = Message::from_digest_slice(&block.hash())
        .map_err(|_| SignatureError::InvalidBlock("invalid block hash"))?;
    secp256k1_verify()
        .verify_ecdsa(&msg, &sig, &pubkey)
        .map_err(|_| SignatureError::InvalidBlock("block signature verification failed"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampError {
    InvalidBlock(&'static str),
}

impl std::fmt::Display for TimestampError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimestampError::InvalidBlock(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for TimestampError {}

/// The coinstake must share the header timestamp, and the coinbase may run
/// ahead of the coinstake by at most the drift allowance.
pub fn check_stake_timestamps(block: &Block, future_drift_secs: i64) -> Result<(), TimestampError> {
    if !block.is_proof_of_stake() {
        return Err(TimestampError::InvalidBlock("stake checks on work block"));
    }
    let coinbase = &block.transactions[0];
    let coinstake = &block.transactions[1];

    if coinstake.time != block.header.time {
        return Err(TimestampError::InvalidBlock(
            "coinstake timestamp differs from header",
        ));
    }
    if i64::from(coinbase.time) > i64::from(coinstake.time) + future_drift_secs {
        return Err(TimestampError::InvalidBlock(
            "coinbase timestamp beyond coinstake drift",
        ));
    }
    Ok(())
}
