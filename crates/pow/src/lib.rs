//! Proof-of-work target math and the continuous difficulty retarget.

pub mod difficulty;

pub use difficulty::{
    block_proof, check_proof_of_work, compact_to_target, compact_to_u256, hash_meets_target,
    next_target_required, target_to_compact, u256_to_compact, CompactError, HeaderSample, PowError,
};
