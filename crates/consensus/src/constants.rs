//! Consensus-wide constants shared across validation.

/// The minimum allowed block version (network rule).
pub const MIN_BLOCK_VERSION: i32 = 1;
/// The maximum block version this node understands; higher versions are rejected.
pub const MAX_BLOCK_VERSION: i32 = 7;
/// The block version produced by this node.
pub const CURRENT_BLOCK_VERSION: i32 = 7;
/// The transaction version produced and accepted by this node.
pub const CURRENT_TX_VERSION: i32 = 1;
/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;
/// The maximum allowed number of signature operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = MAX_BLOCK_SIZE / 50;
/// Coinbase and coinstake outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Lock-time values below this threshold are block heights, above it unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Maximum script size carried in an input or output (network rule).
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_054;
/// Disconnect peers older than this.
pub const MIN_PEER_PROTO_VERSION: i32 = 70_051;
/// Mixing requires both sides to speak the current protocol.
pub const MIN_POOL_PEER_PROTO_VERSION: i32 = 70_054;

/// Cumulative misbehavior score at which the peer layer drops a peer.
pub const BAN_SCORE_THRESHOLD: u32 = 100;
