//! Masternode directory: who can coordinate mixing rounds.

pub mod record;
pub mod registry;

pub use record::{MasternodeRecord, MasternodeState};
pub use registry::{verify_masternode_signature, MasternodeRegistry};
