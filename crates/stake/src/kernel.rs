//! Stake kernel hashing and the modifier chain.
//!
//! The kernel hash commits to the modifier of the block holding the stake
//! source, the source block and transaction times, the staked outpoint and
//! the coinstake time. Weighting by coin-days means old, large outputs meet
//! the target more often without ever lowering the per-hash difficulty.

use umbra_consensus::params::StakeParams;
use umbra_consensus::{Hash256, COIN};
use umbra_primitives::encoding::{Encodable, Encoder};
use umbra_primitives::hash::sha256d;
use umbra_primitives::outpoint::OutPoint;

use primitive_types::U512;
use umbra_pow::difficulty::compact_to_u256;

const DAY_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    InvalidBits(&'static str),
    StakeBeforeSource,
    MinAgeNotMet,
    HashAboveWeightedTarget,
}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelError::InvalidBits(message) => write!(f, "{message}"),
            KernelError::StakeBeforeSource => {
                write!(f, "coinstake timestamp precedes its stake source")
            }
            KernelError::MinAgeNotMet => write!(f, "staked output below minimum age"),
            KernelError::HashAboveWeightedTarget => {
                write!(f, "kernel hash does not meet weighted target")
            }
        }
    }
}

impl std::error::Error for KernelError {}

/// Everything the kernel check needs to know about the staked output.
#[derive(Clone, Copy, Debug)]
pub struct StakeSource {
    /// Timestamp of the block holding the source transaction.
    pub block_time: u32,
    /// Stake modifier of that block.
    pub block_modifier: u64,
    /// Timestamp of the source transaction itself.
    pub tx_time: u32,
    /// Value of the staked output.
    pub amount: i64,
    /// The staked output.
    pub prevout: OutPoint,
}

/// Modifier for a block, derived from its parent's modifier and its own hash.
/// Genesis uses modifier zero.
pub fn next_stake_modifier(parent_modifier: u64, block_hash: &Hash256) -> u64 {
    let mut data = [0u8; 40];
    data[..8].copy_from_slice(&parent_modifier.to_le_bytes());
    data[8..].copy_from_slice(block_hash);
    let digest = sha256d(&data);
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

pub fn kernel_hash(source: &StakeSource, stake_time: u32) -> Hash256 {
    let mut encoder = Encoder::new();
    encoder.write_u64_le(source.block_modifier);
    encoder.write_u32_le(source.block_time);
    encoder.write_u32_le(source.tx_time);
    source.prevout.consensus_encode(&mut encoder);
    encoder.write_u32_le(stake_time);
    sha256d(&encoder.into_inner())
}

/// Verifies the kernel inequality and returns the kernel hash for the index.
pub fn check_stake_kernel(
    bits: u32,
    source: &StakeSource,
    stake_time: u32,
    stake: &StakeParams,
    pos_limit: &Hash256,
) -> Result<Hash256, KernelError> {
    let target = compact_to_u256(bits)
        .map_err(|_| KernelError::InvalidBits("malformed stake target bits"))?;
    if target.is_zero() {
        return Err(KernelError::InvalidBits("stake target is zero"));
    }
    if target > primitive_types::U256::from_little_endian(pos_limit) {
        return Err(KernelError::InvalidBits("stake target above limit"));
    }

    if stake_time < source.tx_time {
        return Err(KernelError::StakeBeforeSource);
    }
    let age = i64::from(stake_time) - i64::from(source.tx_time);
    if age < stake.min_age_secs {
        return Err(KernelError::MinAgeNotMet);
    }
    let time_weight = age.min(stake.max_age_secs) - stake.min_age_secs;

    // coin-days; the wide type keeps amount * age exact.
    let weight = U512::from(source.amount as u64) * U512::from(time_weight as u64)
        / U512::from(COIN as u64)
        / U512::from(DAY_SECS as u64);

    let hash = kernel_hash(source, stake_time);
    let hash_value = U512::from_little_endian(&hash);
    let weighted_target = U512::from_little_endian(&target.to_little_endian()) * weight;
    if hash_value > weighted_target {
        return Err(KernelError::HashAboveWeightedTarget);
    }
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_consensus::params::{chain_params, Network};

    fn source(amount: i64, tx_time: u32) -> StakeSource {
        StakeSource {
            block_time: tx_time,
            block_modifier: 0x0123_4567_89ab_cdef,
            tx_time,
            amount,
            prevout: OutPoint::new([0x11; 32], 1),
        }
    }

    #[test]
    fn modifier_chain_is_deterministic_and_input_sensitive() {
        let parent = 42u64;
        let hash_a = [0xaa; 32];
        let hash_b = [0xbb; 32];

        assert_eq!(
            next_stake_modifier(parent, &hash_a),
            next_stake_modifier(parent, &hash_a)
        );
        assert_ne!(
            next_stake_modifier(parent, &hash_a),
            next_stake_modifier(parent, &hash_b)
        );
        assert_ne!(
            next_stake_modifier(parent, &hash_a),
            next_stake_modifier(parent + 1, &hash_a)
        );
    }

    #[test]
    fn kernel_hash_commits_to_every_field() {
        let base = source(1000 * COIN, 1_000_000);
        let stake_time = 1_100_000;
        let reference = kernel_hash(&base, stake_time);

        let mut changed = base;
        changed.block_modifier ^= 1;
        assert_ne!(kernel_hash(&changed, stake_time), reference);

        let mut changed = base;
        changed.block_time += 1;
        assert_ne!(kernel_hash(&changed, stake_time), reference);

        let mut changed = base;
        changed.prevout.index = 2;
        assert_ne!(kernel_hash(&changed, stake_time), reference);

        assert_ne!(kernel_hash(&base, stake_time + 1), reference);
    }

    #[test]
    fn kernel_rejects_young_and_time_reversed_stakes() {
        let params = chain_params(Network::Mainnet);
        let src = source(1000 * COIN, 1_000_000);

        let err = check_stake_kernel(
            0x1e0fffff,
            &src,
            src.tx_time + (params.stake.min_age_secs as u32) - 1,
            &params.stake,
            &params.pos_limit,
        )
        .expect_err("below min age");
        assert_eq!(err, KernelError::MinAgeNotMet);

        let err = check_stake_kernel(
            0x1e0fffff,
            &src,
            src.tx_time - 1,
            &params.stake,
            &params.pos_limit,
        )
        .expect_err("stake before source");
        assert_eq!(err, KernelError::StakeBeforeSource);
    }

    #[test]
    fn kernel_rejects_malformed_bits() {
        let params = chain_params(Network::Mainnet);
        let src = source(1000 * COIN, 1_000_000);
        let stake_time = src.tx_time + params.stake.min_age_secs as u32 + DAY_SECS as u32;

        let err = check_stake_kernel(0, &src, stake_time, &params.stake, &params.pos_limit)
            .expect_err("zero bits");
        assert_eq!(err, KernelError::InvalidBits("stake target is zero"));

        let err =
            check_stake_kernel(0x207fffff, &src, stake_time, &params.stake, &params.pos_limit)
                .expect_err("target above limit");
        assert_eq!(err, KernelError::InvalidBits("stake target above limit"));
    }

    #[test]
    fn aged_large_stake_meets_a_permissive_target() {
        // Regtest's limit admits any hash once the weight is nonzero.
        let params = chain_params(Network::Regtest);
        let src = source(1_000_000 * COIN, 1_000_000);
        let stake_time = src.tx_time + (90 * DAY_SECS) as u32;

        let bits = umbra_pow::difficulty::target_to_compact(&params.pos_limit);
        let hash = check_stake_kernel(bits, &src, stake_time, &params.stake, &params.pos_limit)
            .expect("kernel satisfied");
        assert_eq!(hash, kernel_hash(&src, stake_time));
    }

    #[test]
    fn zero_weight_never_meets_the_target() {
        let params = chain_params(Network::Regtest);
        let src = source(1_000_000 * COIN, 1_000_000);
        // Exactly min age leaves zero coin-day weight.
        let stake_time = src.tx_time + params.stake.min_age_secs as u32;

        let bits = umbra_pow::difficulty::target_to_compact(&params.pos_limit);
        let err = check_stake_kernel(bits, &src, stake_time, &params.stake, &params.pos_limit)
            .expect_err("zero weight");
        assert_eq!(err, KernelError::HashAboveWeightedTarget);
    }
}
