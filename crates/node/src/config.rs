//! Command-line configuration for the daemon.

use std::net::SocketAddr;
use std::path::PathBuf;

use umbra_consensus::{hash256_from_hex, Network};
use umbra_log::{Format, Level};
use umbra_primitives::outpoint::OutPoint;

const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Which key-value backend holds the index columns. Block bodies always
/// live in flat files under the data directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreKind {
    Memory,
    Disk,
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub network: Network,
    pub data_dir: PathBuf,
    pub store: StoreKind,
    pub listen: Option<SocketAddr>,
    pub connect: Vec<SocketAddr>,
    pub max_connections: usize,
    pub log_level: Level,
    pub log_format: Format,
    pub mixing: bool,
    /// Masternode identity for the coordinator role: collateral outpoint
    /// plus the matching secret key, hex-encoded.
    pub masternode_key: Option<String>,
    pub masternode_collateral: Option<OutPoint>,
    /// Client role: key owning the coins to mix, the coins themselves, and
    /// the collateral outpoint put at risk. Implies `--mixing`.
    pub mix_key: Option<String>,
    pub mix_coins: Vec<OutPoint>,
    pub mix_collateral: Option<OutPoint>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            data_dir: PathBuf::from("umbra-data"),
            store: StoreKind::Disk,
            listen: None,
            connect: Vec::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            log_level: Level::Info,
            log_format: Format::Text,
            mixing: false,
            masternode_key: None,
            masternode_collateral: None,
            mix_key: None,
            mix_coins: Vec::new(),
            mix_collateral: None,
        }
    }
}

pub fn usage() -> &'static str {
    "usage: umbrad [options]\n\
     \n\
     --network <mainnet|testnet|regtest>  chain to run (default mainnet)\n\
     --datadir <path>                     data directory (default ./umbra-data)\n\
     --memory-store                       keep the index in memory, not on disk\n\
     --listen <addr:port>                 accept inbound peers on this address\n\
     --connect <addr:port>                connect out to a peer (repeatable)\n\
     --max-connections <n>                inbound connection cap (default 64)\n\
     --log-level <error|warn|info|debug|trace>\n\
     --log-format <text|json>\n\
     --mixing                             participate in coin mixing\n\
     --masternode-key <hex>               coordinator secret key (64 hex chars)\n\
     --masternode-collateral <txid:n>     coordinator collateral outpoint\n\
     --mix-key <hex>                      key owning the coins to mix\n\
     --mix-coin <txid:n>                  coin to mix (repeatable)\n\
     --mix-collateral <txid:n>            collateral outpoint for the round"
}

/// Parses argv (without the program name). Errors are usage messages.
pub fn parse_args(args: &[String]) -> Result<NodeConfig, String> {
    let mut config = NodeConfig::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--network" => {
                config.network = match required(&mut iter, arg)?.as_str() {
                    "mainnet" => Network::Mainnet,
                    "testnet" => Network::Testnet,
                    "regtest" => Network::Regtest,
                    other => return Err(format!("unknown network {other:?}")),
                };
            }
            "--datadir" => config.data_dir = PathBuf::from(required(&mut iter, arg)?),
            "--memory-store" => config.store = StoreKind::Memory,
            "--listen" => {
                let raw = required(&mut iter, arg)?;
                config.listen =
                    Some(raw.parse().map_err(|_| format!("bad listen address {raw:?}"))?);
            }
            "--connect" => {
                let raw = required(&mut iter, arg)?;
                config
                    .connect
                    .push(raw.parse().map_err(|_| format!("bad peer address {raw:?}"))?);
            }
            "--max-connections" => {
                let raw = required(&mut iter, arg)?;
                config.max_connections = raw
                    .parse()
                    .map_err(|_| format!("bad connection count {raw:?}"))?;
            }
            "--log-level" => {
                let raw = required(&mut iter, arg)?;
                config.log_level =
                    Level::parse(&raw).ok_or_else(|| format!("unknown log level {raw:?}"))?;
            }
            "--log-format" => {
                let raw = required(&mut iter, arg)?;
                config.log_format =
                    Format::parse(&raw).ok_or_else(|| format!("unknown log format {raw:?}"))?;
            }
            "--mixing" => config.mixing = true,
            "--masternode-key" => config.masternode_key = Some(required(&mut iter, arg)?),
            "--masternode-collateral" => {
                let raw = required(&mut iter, arg)?;
                config.masternode_collateral = Some(parse_outpoint(&raw)?);
            }
            "--mix-key" => config.mix_key = Some(required(&mut iter, arg)?),
            "--mix-coin" => {
                let raw = required(&mut iter, arg)?;
                config.mix_coins.push(parse_outpoint(&raw)?);
            }
            "--mix-collateral" => {
                let raw = required(&mut iter, arg)?;
                config.mix_collateral = Some(parse_outpoint(&raw)?);
            }
            "--help" | "-h" => return Err(usage().to_string()),
            other => return Err(format!("unknown option {other:?}\n\n{}", usage())),
        }
    }
    if config.masternode_key.is_some() != config.masternode_collateral.is_some() {
        return Err(
            "--masternode-key and --masternode-collateral must be given together".to_string(),
        );
    }
    let staging = [
        config.mix_key.is_some(),
        !config.mix_coins.is_empty(),
        config.mix_collateral.is_some(),
    ];
    if staging.iter().any(|&given| given) {
        if !staging.iter().all(|&given| given) {
            return Err(
                "--mix-key, --mix-coin, and --mix-collateral must be given together".to_string(),
            );
        }
        config.mixing = true;
    }
    Ok(config)
}

fn required<'a>(
    iter: &mut impl Iterator<Item = &'a String>,
    flag: &str,
) -> Result<String, String> {
    iter.next()
        .map(|value| value.to_string())
        .ok_or_else(|| format!("{flag} needs a value"))
}

fn parse_outpoint(raw: &str) -> Result<OutPoint, String> {
    let (txid_hex, index_raw) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("bad outpoint {raw:?}, expected txid:n"))?;
    let hash = hash256_from_hex(txid_hex).map_err(|_| format!("bad txid in outpoint {raw:?}"))?;
    let index = index_raw
        .parse()
        .map_err(|_| format!("bad output index in outpoint {raw:?}"))?;
    Ok(OutPoint::new(hash, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn defaults_without_arguments() {
        let config = parse_args(&[]).expect("parse");
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.store, StoreKind::Disk);
        assert!(config.listen.is_none());
        assert!(!config.mixing);
    }

    #[test]
    fn parses_a_full_command_line() {
        let config = parse_args(&args(&[
            "--network",
            "regtest",
            "--datadir",
            "/tmp/umbra",
            "--memory-store",
            "--listen",
            "127.0.0.1:17601",
            "--connect",
            "127.0.0.1:17602",
            "--connect",
            "127.0.0.1:17603",
            "--log-level",
            "debug",
            "--mixing",
        ]))
        .expect("parse");
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.connect.len(), 2);
        assert_eq!(config.log_level, Level::Debug);
        assert!(config.mixing);
    }

    #[test]
    fn masternode_flags_must_pair() {
        let err = parse_args(&args(&["--masternode-key", "ab"])).unwrap_err();
        assert!(err.contains("together"));
    }

    #[test]
    fn outpoint_round_trips() {
        let txid = "00000000000000000000000000000000000000000000000000000000000000ff";
        let config =
            parse_args(&args(&["--masternode-key", "ab", "--masternode-collateral",
                &format!("{txid}:3")]))
            .expect("parse");
        let outpoint = config.masternode_collateral.expect("outpoint");
        assert_eq!(outpoint.index, 3);
        // Display-order hex lands reversed in the internal byte order.
        assert_eq!(outpoint.hash[0], 0xff);
        assert_eq!(outpoint.hash[31], 0x00);
    }

    #[test]
    fn mix_flags_come_as_a_set_and_imply_mixing() {
        let err = parse_args(&args(&["--mix-key", "ab"])).unwrap_err();
        assert!(err.contains("together"));

        let txid = "00000000000000000000000000000000000000000000000000000000000000ff";
        let config = parse_args(&args(&[
            "--mix-key",
            "ab",
            "--mix-coin",
            &format!("{txid}:1"),
            "--mix-coin",
            &format!("{txid}:2"),
            "--mix-collateral",
            &format!("{txid}:0"),
        ]))
        .expect("parse");
        assert_eq!(config.mix_coins.len(), 2);
        assert!(config.mixing);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(parse_args(&args(&["--frobnicate"])).is_err());
    }
}
