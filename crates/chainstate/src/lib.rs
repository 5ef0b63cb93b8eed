//! Chain index, block validation and the accept-block pipeline.

pub mod blockindex;
pub mod flatfiles;
pub mod state;
pub mod tree;
pub mod txindex;
pub mod validation;

pub use blockindex::BlockIndexEntry;
pub use flatfiles::{BlockFileStore, FileLocation, FlatFileError};
pub use state::{AcceptOutcome, ChainState, ChainStateError};
pub use tree::{BlockIndexNode, ChainTree};
pub use txindex::TxIndexEntry;
pub use validation::Rejection;
