//! The denomination ladder and the pure functions over it.
//!
//! Each ladder amount carries a small non-round tail so denominated outputs
//! are distinguishable from ordinary round payments of the same size.

use umbra_consensus::{Amount, COIN};
use umbra_primitives::transaction::TxOut;

/// Descending ladder; bit `i` of a denomination mask refers to entry `i`.
pub const DENOMINATIONS: [Amount; 5] = [
    500 * COIN + 500_000,
    100 * COIN + 100_000,
    10 * COIN + 10_000,
    COIN + 1_000,
    COIN / 10 + 100,
];

/// At most this many outputs of one denomination per expansion.
pub const MAX_PER_DENOMINATION: usize = 10;

pub fn denomination_bit(value: Amount) -> Option<u32> {
    DENOMINATIONS
        .iter()
        .position(|&denom| denom == value)
        .map(|index| 1u32 << index)
}

pub fn is_denominated(value: Amount) -> bool {
    denomination_bit(value).is_some()
}

/// Bitmask of ladder entries present among `outputs`. Zero when any output
/// is off the ladder: such a set cannot enter a mixing round at all.
pub fn classify(outputs: &[TxOut]) -> u32 {
    let mut mask = 0u32;
    for output in outputs {
        match denomination_bit(output.value) {
            Some(bit) => mask |= bit,
            None => return 0,
        }
    }
    mask
}

/// Breaks `total` into denominated outputs for the ladder entries set in
/// `target_mask`, largest first, up to [`MAX_PER_DENOMINATION`] of each.
/// Whatever cannot be expressed stays with the caller as change.
pub fn expand(total: Amount, target_mask: u32, script_pubkey: &[u8]) -> Vec<TxOut> {
    let mut remaining = total;
    let mut outputs = Vec::new();
    for (index, &denom) in DENOMINATIONS.iter().enumerate() {
        if target_mask & (1 << index) == 0 {
            continue;
        }
        let mut emitted = 0;
        while remaining >= denom && emitted < MAX_PER_DENOMINATION {
            outputs.push(TxOut::new(denom, script_pubkey.to_vec()));
            remaining -= denom;
            emitted += 1;
        }
    }
    outputs
}

/// Human-readable mask description for status strings.
pub fn describe_mask(mask: u32) -> String {
    let mut parts = Vec::new();
    for (index, &denom) in DENOMINATIONS.iter().enumerate() {
        if mask & (1 << index) != 0 {
            let whole = denom / COIN;
            let frac = denom % COIN;
            parts.push(format!("{whole}.{frac:08}"));
        }
    }
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join("+")
    }
}
