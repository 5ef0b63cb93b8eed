//! Coin-mixing protocol: denominations, wire payloads, and the client and
//! coordinator state machines.

pub mod client;
pub mod coordinator;
pub mod denom;
pub mod error;
pub mod messages;
pub mod queue;
pub mod session;

pub use client::{ClientOutcome, MixingClient};
pub use coordinator::{Coordinator, CoordinatorEvent};
pub use error::PoolError;
pub use queue::QueueTracker;
pub use session::{MixingSession, PoolEntry, PoolState};

use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::transaction::{Transaction, TxOut};

/// Chain access the pool needs: resolve and check outpoints. Backed by the
/// transaction index in the running node, by fixtures in tests.
pub trait ChainView {
    fn output(&self, prevout: &OutPoint) -> Option<TxOut>;
    fn is_spendable(&self, prevout: &OutPoint) -> bool;
}

/// Signing capability the client borrows from the wallet. Returns the
/// unlock script for one input of `tx`, or `None` for keys it does not hold.
pub trait KeyStore {
    fn sign_input(&self, tx: &Transaction, input_index: usize, script_pubkey: &[u8])
        -> Option<Vec<u8>>;
}
