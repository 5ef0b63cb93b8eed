//! Per-network chain parameter definitions.

use crate::money::{Amount, CENT, COIN};

pub type Hash256 = [u8; 32];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// Proof-of-stake kernel and maturity rules.
#[derive(Clone, Copy, Debug)]
pub struct StakeParams {
    /// Coins younger than this never earn stake weight.
    pub min_age_secs: i64,
    /// Age credited beyond this cap stops increasing stake weight.
    pub max_age_secs: i64,
    /// Depth the stake source must have before it may be spent in a coinstake.
    pub min_confirmations: i32,
}

/// Tuning for the coin-mixing pool.
#[derive(Clone, Copy, Debug)]
pub struct MixingParams {
    /// Collateral deposit each participant puts at risk per round.
    pub collateral: Amount,
    /// Minimum fee a collateral transaction must pay to be accepted.
    pub min_collateral_fee: Amount,
    /// Entries per session; a round finalizes when this many have been accepted.
    pub max_participants: usize,
    /// Default number of relay rounds a wallet mixes through.
    pub default_rounds: u32,
    /// Default target amount a wallet keeps denominated.
    pub default_target_amount: Amount,
    /// Deadline for the queueing and entry-acceptance phases.
    pub queue_timeout_secs: u64,
    /// Deadline for the signing phase.
    pub signing_timeout_secs: u64,
    /// Extra time a client waits beyond the coordinator deadline.
    pub client_grace_secs: u64,
    /// One successful round in this many is charged collateral.
    pub charge_one_in: u32,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub genesis_hash: Hash256,
    pub genesis_time: u32,
    /// First four bytes of every P2P message on this network.
    pub magic: [u8; 4],
    pub default_port: u16,
    /// Two-sided clock-drift allowance for block timestamps, in seconds.
    pub future_drift_secs: i64,
    pub pow_limit: Hash256,
    pub pos_limit: Hash256,
    pub pow_target_spacing: i64,
    pub pos_target_spacing: i64,
    /// Damping window for the continuous retarget.
    pub target_timespan_secs: i64,
    /// Proof-of-work blocks are rejected above this height.
    pub pow_last_height: i32,
    /// Proof-of-stake blocks are rejected below this height.
    pub pos_start_height: i32,
    /// Hardened checkpoints, ascending by height.
    pub checkpoints: Vec<Checkpoint>,
    /// Legacy block hashes exempt from the proof-target check.
    pub proof_exceptions: Vec<Hash256>,
    pub stake: StakeParams,
    pub mixing: MixingParams,
}

impl ChainParams {
    pub fn pow_allowed(&self, height: i32) -> bool {
        height <= self.pow_last_height
    }

    pub fn pos_allowed(&self, height: i32) -> bool {
        height >= self.pos_start_height
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|cp| cp.height == height)
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    pub fn is_proof_exception(&self, hash: &Hash256) -> bool {
        self.proof_exceptions.iter().any(|except| except == hash)
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

/// Parses a display-order (big-endian) hex string into an internal-order hash.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let hex = input.trim();
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out =
            u8::from_str_radix(&hex[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Testnet => testnet_params(),
        Network::Regtest => regtest_params(),
    }
}

fn mainnet_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        genesis_hash: hash256_from_hex(
            "000007269e4486b7a0c40ba98bbbc6c2d2b85ccde32b2601bb2fd91d9362a721",
        )
        .expect("mainnet genesis"),
        genesis_time: 1_390_095_618,
        magic: [0xd4, 0xa1, 0x7e, 0x62],
        default_port: 9637,
        future_drift_secs: 10 * 60,
        pow_limit: hash256_from_hex(
            "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("mainnet pow limit"),
        pos_limit: hash256_from_hex(
            "000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("mainnet pos limit"),
        pow_target_spacing: 150,
        pos_target_spacing: 150,
        target_timespan_secs: 60 * 60,
        pow_last_height: 200_000,
        pos_start_height: 15_000,
        checkpoints: mainnet_checkpoints(),
        proof_exceptions: mainnet_proof_exceptions(),
        stake: StakeParams {
            min_age_secs: 24 * 60 * 60,
            max_age_secs: 90 * 24 * 60 * 60,
            min_confirmations: 60,
        },
        mixing: default_mixing_params(),
    }
}

fn testnet_params() -> ChainParams {
    ChainParams {
        network: Network::Testnet,
        genesis_hash: hash256_from_hex(
            "00000bafbc94add76cb75e2ec92894837288a481e5c005f6563d91623bf8bc2c",
        )
        .expect("testnet genesis"),
        genesis_time: 1_390_666_206,
        magic: [0xce, 0xe2, 0xca, 0xff],
        default_port: 19_637,
        future_drift_secs: 10 * 60,
        pow_limit: hash256_from_hex(
            "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("testnet pow limit"),
        pos_limit: hash256_from_hex(
            "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("testnet pos limit"),
        pow_target_spacing: 150,
        pos_target_spacing: 150,
        target_timespan_secs: 60 * 60,
        pow_last_height: 50_000,
        pos_start_height: 500,
        checkpoints: vec![Checkpoint {
            height: 0,
            hash: hash256_from_hex(
                "00000bafbc94add76cb75e2ec92894837288a481e5c005f6563d91623bf8bc2c",
            )
            .expect("testnet genesis checkpoint"),
        }],
        proof_exceptions: Vec::new(),
        stake: StakeParams {
            min_age_secs: 20 * 60,
            max_age_secs: 90 * 24 * 60 * 60,
            min_confirmations: 30,
        },
        mixing: default_mixing_params(),
    }
}

fn regtest_params() -> ChainParams {
    ChainParams {
        network: Network::Regtest,
        genesis_hash: hash256_from_hex(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        )
        .expect("regtest genesis"),
        genesis_time: 1_296_688_602,
        magic: [0xfa, 0xbf, 0xb5, 0xda],
        default_port: 19_638,
        future_drift_secs: 10 * 60,
        pow_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pow limit"),
        pos_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pos limit"),
        pow_target_spacing: 150,
        pos_target_spacing: 150,
        target_timespan_secs: 60 * 60,
        pow_last_height: i32::MAX,
        pos_start_height: 0,
        checkpoints: Vec::new(),
        proof_exceptions: Vec::new(),
        stake: StakeParams {
            min_age_secs: 60,
            max_age_secs: 90 * 24 * 60 * 60,
            min_confirmations: 2,
        },
        mixing: default_mixing_params(),
    }
}

fn default_mixing_params() -> MixingParams {
    MixingParams {
        collateral: CENT / 10 + 1000,
        min_collateral_fee: CENT / 10,
        max_participants: 3,
        default_rounds: 2,
        default_target_amount: 1000 * COIN,
        queue_timeout_secs: 120,
        signing_timeout_secs: 60,
        client_grace_secs: 15,
        charge_one_in: 10,
    }
}

fn mainnet_checkpoints() -> Vec<Checkpoint> {
    let entries: [(i32, &str); 5] = [
        (
            0,
            "000007269e4486b7a0c40ba98bbbc6c2d2b85ccde32b2601bb2fd91d9362a721",
        ),
        (
            1_500,
            "000000aefcccd9d6b149d6cd2ebd0736a31c1354f971a4a580a64f3a2a4a0eb6",
        ),
        (
            4_991,
            "000000642f13bf5750d0c602fd69686b6b5bc3f1e2e3f5b3fc03bbad3bde1759",
        ),
        (
            9_918,
            "00000557e11e05ea41b540f78473638ac48c0bd5a1a9318cee2e3a9619a24106",
        ),
        (
            16_912,
            "00000499b0f2e66b2f1043dc4f53b1be4a7d1e12bf1b645d94af2b343c1bae60",
        ),
    ];
    entries
        .iter()
        .map(|(height, hex)| Checkpoint {
            height: *height,
            hash: hash256_from_hex(hex).expect("mainnet checkpoint"),
        })
        .collect()
}

// Three 1.x-era blocks were relayed with proofs that miss their stated target
// and are grandfathered in; every other check still applies to them.
fn mainnet_proof_exceptions() -> Vec<Hash256> {
    [
        "00000a39847cef2fb1f14a6aed3a4bef52a0cd4ebb5b061eb6a85ec1a4aaa001",
        "000006dcb6b6b8ca14cdca35b3c1429b9ff5c5bdadbf57d3a53a36b98b6cc742",
        "0000019f9c5d6c8ff732c8f82d3b41c286bbd2b901b851224c83b05b3d961a23",
    ]
    .iter()
    .map(|hex| hash256_from_hex(hex).expect("mainnet proof exception"))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips_display_order() {
        let hash =
            hash256_from_hex("00000bafbc94add76cb75e2ec92894837288a481e5c005f6563d91623bf8bc2c")
                .expect("valid hex");
        // Internal order is reversed: display-leading zeros land at the tail.
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x2c);
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert!(matches!(
            hash256_from_hex("abcd"),
            Err(HexError::InvalidLength)
        ));
        let bad = "zz000bafbc94add76cb75e2ec92894837288a481e5c005f6563d91623bf8bc2c";
        assert!(matches!(hash256_from_hex(bad), Err(HexError::InvalidHex)));
    }

    #[test]
    fn checkpoints_ascend() {
        let params = chain_params(Network::Mainnet);
        let heights: Vec<i32> = params.checkpoints.iter().map(|cp| cp.height).collect();
        let mut sorted = heights.clone();
        sorted.sort_unstable();
        assert_eq!(heights, sorted);
        assert_eq!(params.last_checkpoint().map(|cp| cp.height), Some(16_912));
    }

    #[test]
    fn proof_gates_per_network() {
        let mainnet = chain_params(Network::Mainnet);
        assert!(mainnet.pow_allowed(200_000));
        assert!(!mainnet.pow_allowed(200_001));
        assert!(!mainnet.pos_allowed(14_999));
        assert!(mainnet.pos_allowed(15_000));
        assert_eq!(mainnet.proof_exceptions.len(), 3);

        let regtest = chain_params(Network::Regtest);
        assert!(regtest.pow_allowed(i32::MAX - 1));
        assert!(regtest.pos_allowed(0));
        assert!(regtest.proof_exceptions.is_empty());
    }
}
