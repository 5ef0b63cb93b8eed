//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod script;
pub mod sighash;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
pub use hash::{hash160, sha256, sha256d};
pub use merkle::{check_merkle_branch, merkle_root_and_mutation, MerkleTree};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
