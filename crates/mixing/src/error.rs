//! Wire-level rejection codes for mixing submissions.
//!
//! These travel in status updates and carry no DoS weight: hitting one is
//! expected under normal concurrent use (two clients racing for the last
//! session slot, a stale queue relay, and so on).

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolError {
    IncompatibleVersion,
    NotACoordinator,
    StaleQueue,
    SessionFull,
    DenominationMismatch,
    InvalidCollateral,
    InvalidInput,
    NonStandardScript,
    FeeTooHigh,
    MissingInputTx,
    NotSessionReady,
}

impl PoolError {
    pub fn as_code(self) -> u8 {
        match self {
            PoolError::IncompatibleVersion => 0,
            PoolError::NotACoordinator => 1,
            PoolError::StaleQueue => 2,
            PoolError::SessionFull => 3,
            PoolError::DenominationMismatch => 4,
            PoolError::InvalidCollateral => 5,
            PoolError::InvalidInput => 6,
            PoolError::NonStandardScript => 7,
            PoolError::FeeTooHigh => 8,
            PoolError::MissingInputTx => 9,
            PoolError::NotSessionReady => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PoolError::IncompatibleVersion),
            1 => Some(PoolError::NotACoordinator),
            2 => Some(PoolError::StaleQueue),
            3 => Some(PoolError::SessionFull),
            4 => Some(PoolError::DenominationMismatch),
            5 => Some(PoolError::InvalidCollateral),
            6 => Some(PoolError::InvalidInput),
            7 => Some(PoolError::NonStandardScript),
            8 => Some(PoolError::FeeTooHigh),
            9 => Some(PoolError::MissingInputTx),
            10 => Some(PoolError::NotSessionReady),
            _ => None,
        }
    }

    /// Text surfaced to the submitting peer.
    pub fn message(self) -> &'static str {
        match self {
            PoolError::IncompatibleVersion => "incompatible protocol version",
            PoolError::NotACoordinator => "node is not a mixing coordinator",
            PoolError::StaleQueue => "stale or duplicate queue broadcast",
            PoolError::SessionFull => "session already has enough participants",
            PoolError::DenominationMismatch => "denomination does not match this session",
            PoolError::InvalidCollateral => "collateral transaction is invalid",
            PoolError::InvalidInput => "input is invalid or already claimed",
            PoolError::NonStandardScript => "script is not a standard payment form",
            PoolError::FeeTooHigh => "transaction fee out of bounds",
            PoolError::MissingInputTx => "referenced input transaction is unknown",
            PoolError::NotSessionReady => "session is not accepting that yet",
        }
    }
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 0..=10 {
            let err = PoolError::from_code(code).expect("known code");
            assert_eq!(err.as_code(), code);
            assert!(!err.message().is_empty());
        }
        assert_eq!(PoolError::from_code(11), None);
    }
}
