//! Proof-of-stake kernel, stake modifier chain and block signatures.

pub mod kernel;
pub mod validation;

pub use kernel::{check_stake_kernel, kernel_hash, next_stake_modifier, KernelError, StakeSource};
pub use validation::{
    check_block_signature, check_stake_timestamps, SignatureError, TimestampError,
};
