//! Consensus constants and per-network chain parameters.

pub mod constants;
pub mod money;
pub mod params;

pub use money::{money_range, Amount, CENT, COIN, MAX_MONEY};
pub use params::{
    chain_params, hash256_from_hex, ChainParams, Checkpoint, Hash256, MixingParams, Network,
    StakeParams,
};
