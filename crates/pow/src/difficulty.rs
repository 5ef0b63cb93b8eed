//! Compact target encoding and difficulty adjustment.
//!
//! The retarget is continuous: every block nudges the target toward the
//! configured spacing by an exponentially damped step, one independent
//! schedule per proof type.

use umbra_consensus::Hash256;

use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(&'static str),
    HashAboveTarget,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashAboveTarget => write!(f, "proof hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(value.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Full proof-of-work check for a header hash against its claimed bits.
pub fn check_proof_of_work(hash: &Hash256, bits: u32, pow_limit: &Hash256) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("proof target is zero"));
    }
    if target > U256::from_little_endian(pow_limit) {
        return Err(PowError::InvalidBits("proof target above limit"));
    }
    if U256::from_little_endian(hash) > target {
        return Err(PowError::HashAboveTarget);
    }
    Ok(())
}

/// Expected chain-trust contribution of a block with the given bits. Harder
/// targets yield larger values; the result is always at least one so trust
/// strictly increases along every path.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Time and bits of a block already on the chain, as seen by the retarget.
#[derive(Clone, Copy, Debug)]
pub struct HeaderSample {
    pub time: i64,
    pub bits: u32,
}

/// Next required bits for a block of one proof type.
///
/// `last_two` holds the most recent two blocks of that same proof type, newest
/// first. With fewer than two on record the chain is still bootstrapping and
/// the proof limit applies.
pub fn next_target_required(
    last_two: Option<(&HeaderSample, &HeaderSample)>,
    proof_limit: &Hash256,
    target_spacing: i64,
    target_timespan: i64,
) -> Result<u32, CompactError> {
    let limit = U256::from_little_endian(proof_limit);
    let Some((prev, prev_prev)) = last_two else {
        return Ok(u256_to_compact(limit));
    };

    let mut actual_spacing = prev.time - prev_prev.time;
    if actual_spacing < 0 {
        actual_spacing = target_spacing;
    }

    let interval = target_timespan / target_spacing;
    let numerator = (interval - 1) * target_spacing + 2 * actual_spacing;
    let denominator = (interval + 1) * target_spacing;

    let mut next = compact_to_u256(prev.bits)?;
    next = next.saturating_mul(U256::from(numerator as u64));
    next /= U256::from(denominator as u64);

    if next.is_zero() {
        next = U256::from(1u64);
    }
    if next > limit {
        next = limit;
    }
    Ok(u256_to_compact(next))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT_BITS: u32 = 0x1e0fffff;

    fn limit_hash() -> Hash256 {
        compact_to_target(LIMIT_BITS).expect("limit target")
    }

    #[test]
    fn compact_rejects_negative_and_overflow() {
        assert_eq!(compact_to_u256(0x0180_0000), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0xff00_ffff), Err(CompactError::Overflow));
    }

    #[test]
    fn retarget_without_history_returns_limit() {
        let bits =
            next_target_required(None, &limit_hash(), 150, 3600).expect("bootstrap target");
        assert_eq!(bits, LIMIT_BITS);
    }

    #[test]
    fn perfect_spacing_keeps_bits_unchanged() {
        let prev = HeaderSample {
            time: 10_000 + 150,
            bits: 0x1d00ffff,
        };
        let prev_prev = HeaderSample {
            time: 10_000,
            bits: 0x1d00ffff,
        };
        let bits = next_target_required(Some((&prev, &prev_prev)), &limit_hash(), 150, 3600)
            .expect("retarget");
        assert_eq!(bits, 0x1d00ffff);
    }

    #[test]
    fn slow_blocks_ease_the_target_and_fast_blocks_tighten_it() {
        let base = compact_to_u256(0x1d00ffff).expect("base target");
        let prev_prev = HeaderSample {
            time: 10_000,
            bits: 0x1d00ffff,
        };

        let slow = HeaderSample {
            time: 10_000 + 600,
            bits: 0x1d00ffff,
        };
        let eased = next_target_required(Some((&slow, &prev_prev)), &limit_hash(), 150, 3600)
            .expect("retarget");
        assert!(compact_to_u256(eased).expect("eased target") > base);

        let fast = HeaderSample {
            time: 10_000 + 10,
            bits: 0x1d00ffff,
        };
        let tightened = next_target_required(Some((&fast, &prev_prev)), &limit_hash(), 150, 3600)
            .expect("retarget");
        assert!(compact_to_u256(tightened).expect("tightened target") < base);
    }

    #[test]
    fn retarget_never_exceeds_the_limit() {
        let prev = HeaderSample {
            time: 100_000,
            bits: LIMIT_BITS,
        };
        let prev_prev = HeaderSample {
            time: 0,
            bits: LIMIT_BITS,
        };
        let bits = next_target_required(Some((&prev, &prev_prev)), &limit_hash(), 150, 3600)
            .expect("retarget");
        assert_eq!(bits, LIMIT_BITS);
    }

    #[test]
    fn harder_bits_carry_more_proof() {
        let easy = block_proof(0x1e0fffff).expect("easy proof");
        let hard = block_proof(0x1d00ffff).expect("hard proof");
        assert!(hard > easy);
        assert!(easy >= U256::from(1u64));
    }

    #[test]
    fn proof_check_enforces_bits_sanity() {
        let limit = limit_hash();
        let zero_hash = [0u8; 32];
        assert_eq!(
            check_proof_of_work(&zero_hash, 0, &limit),
            Err(PowError::InvalidBits("proof target is zero"))
        );
        assert_eq!(
            check_proof_of_work(&zero_hash, 0x207fffff, &limit),
            Err(PowError::InvalidBits("proof target above limit"))
        );
        assert_eq!(check_proof_of_work(&zero_hash, LIMIT_BITS, &limit), Ok(()));

        let big_hash = [0xff; 32];
        assert_eq!(
            check_proof_of_work(&big_hash, LIMIT_BITS, &limit),
            Err(PowError::HashAboveTarget)
        );
    }
}
