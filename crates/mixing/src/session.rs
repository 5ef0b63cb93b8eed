//! Shared state vocabulary and the per-round session object.

use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::transaction::{Transaction, TxIn, TxOut};

/// Phases of one mixing round. Both machines speak this vocabulary; each
/// may only trigger the transitions its role owns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolState {
    Idle,
    Queue,
    AcceptingEntries,
    FinalizeTransaction,
    Signing,
    Transmission,
    Success,
    Error,
}

impl PoolState {
    pub fn as_u8(self) -> u8 {
        match self {
            PoolState::Idle => 0,
            PoolState::Queue => 1,
            PoolState::AcceptingEntries => 2,
            PoolState::FinalizeTransaction => 3,
            PoolState::Signing => 4,
            PoolState::Transmission => 5,
            PoolState::Success => 6,
            PoolState::Error => 7,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PoolState::Idle),
            1 => Some(PoolState::Queue),
            2 => Some(PoolState::AcceptingEntries),
            3 => Some(PoolState::FinalizeTransaction),
            4 => Some(PoolState::Signing),
            5 => Some(PoolState::Transmission),
            6 => Some(PoolState::Success),
            7 => Some(PoolState::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PoolState::Idle => "idle",
            PoolState::Queue => "queue",
            PoolState::AcceptingEntries => "accepting entries",
            PoolState::FinalizeTransaction => "finalizing",
            PoolState::Signing => "signing",
            PoolState::Transmission => "transmission",
            PoolState::Success => "success",
            PoolState::Error => "error",
        }
    }
}

/// One participant's accepted contribution.
#[derive(Clone, Debug)]
pub struct PoolEntry {
    /// Peer that submitted the entry, for addressing status updates.
    pub peer: u64,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub collateral: Transaction,
    /// Prevouts whose signatures have arrived.
    pub signed: Vec<OutPoint>,
}

impl PoolEntry {
    pub fn new(peer: u64, inputs: Vec<TxIn>, outputs: Vec<TxOut>, collateral: Transaction) -> Self {
        Self {
            peer,
            inputs,
            outputs,
            collateral,
            signed: Vec::new(),
        }
    }

    pub fn owns_prevout(&self, prevout: &OutPoint) -> bool {
        self.inputs.iter().any(|input| input.prevout == *prevout)
    }

    pub fn is_fully_signed(&self) -> bool {
        self.inputs
            .iter()
            .all(|input| self.signed.contains(&input.prevout))
    }
}

/// Ephemeral state of one active round, coordinator side. Never persisted;
/// dropped whole on completion, error, or timeout.
#[derive(Debug)]
pub struct MixingSession {
    pub id: u32,
    pub denomination: u32,
    pub state: PoolState,
    /// Peers whose join-requests were accepted.
    pub participants: Vec<u64>,
    pub entries: Vec<PoolEntry>,
    /// Join-phase collaterals, kept for the charge policy even before the
    /// joiner submits an entry.
    pub collaterals: Vec<Transaction>,
    /// Seed for this session's shuffles.
    pub shuffle_seed: u64,
    /// Wall-clock instant the current phase began.
    pub phase_started: i64,
    pub final_tx: Option<Transaction>,
}

impl MixingSession {
    pub fn new(id: u32, denomination: u32, shuffle_seed: u64, now: i64) -> Self {
        Self {
            id,
            denomination,
            state: PoolState::Queue,
            participants: Vec::new(),
            entries: Vec::new(),
            collaterals: Vec::new(),
            shuffle_seed,
            phase_started: now,
            final_tx: None,
        }
    }

    pub fn advance(&mut self, state: PoolState, now: i64) {
        self.state = state;
        self.phase_started = now;
    }

    pub fn entry_claiming(&self, prevout: &OutPoint) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.owns_prevout(prevout))
    }

    pub fn all_signed(&self) -> bool {
        !self.entries.is_empty() && self.entries.iter().all(PoolEntry::is_fully_signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_round_trip() {
        for code in 0..=7 {
            let state = PoolState::from_u8(code).expect("known state");
            assert_eq!(state.as_u8(), code);
        }
        assert_eq!(PoolState::from_u8(8), None);
    }

    #[test]
    fn entry_signature_bookkeeping() {
        let inputs = vec![
            TxIn::new(OutPoint::new([1; 32], 0), Vec::new()),
            TxIn::new(OutPoint::new([2; 32], 3), Vec::new()),
        ];
        let collateral = Transaction {
            version: 1,
            time: 0,
            vin: vec![TxIn::new(OutPoint::new([9; 32], 0), vec![0x01])],
            vout: Vec::new(),
            lock_time: 0,
        };
        let mut entry = PoolEntry::new(7, inputs, Vec::new(), collateral);
        assert!(!entry.is_fully_signed());
        entry.signed.push(OutPoint::new([1; 32], 0));
        assert!(!entry.is_fully_signed());
        entry.signed.push(OutPoint::new([2; 32], 3));
        assert!(entry.is_fully_signed());
        assert!(entry.owns_prevout(&OutPoint::new([2; 32], 3)));
        assert!(!entry.owns_prevout(&OutPoint::new([2; 32], 4)));
    }
}
