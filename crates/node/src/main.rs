//! Daemon composition: configuration, storage, chain state, networking,
//! and the mixing service, wired together under one runtime.

pub mod config;
pub mod keystore;
pub mod mixing_net;
pub mod p2p;
pub mod p2p_server;
pub mod relay;

use std::path::Path;
use std::sync::Arc;

use secp256k1::SecretKey;
use tokio::sync::broadcast;
use umbra_chainstate::ChainState;
use umbra_consensus::{chain_params, ChainParams};
use umbra_log::{log_info, log_warn};
use umbra_masternode::MasternodeRegistry;
use umbra_mixing::denom::classify;
use umbra_mixing::KeyStore;
use umbra_primitives::block::Block;
use umbra_primitives::hash::hash160;
use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::script::p2pkh_script;
use umbra_primitives::transaction::{Transaction, TxIn, TxOut};
use umbra_storage::fjall::FjallStore;
use umbra_storage::memory::MemoryStore;
use umbra_storage::KeyValueStore;

use crate::config::{NodeConfig, StoreKind};
use crate::keystore::NodeKeyStore;
use crate::mixing_net::{MasternodeIdentity, MixingService};
use crate::p2p::{NetTotals, PeerRegistry};
use crate::relay::NodeContext;

const OUTBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Binary entry point: parse argv, then run until interrupted.
pub async fn run_entry() -> Result<(), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = config::parse_args(&args)?;
    umbra_log::configure(config.log_level, config.log_format, true);

    match config.store {
        StoreKind::Memory => run_node(Arc::new(MemoryStore::new()), config).await,
        StoreKind::Disk => {
            let store = FjallStore::open(config.data_dir.join("index"))
                .map_err(|err| format!("failed to open index store: {err}"))?;
            run_node(Arc::new(store), config).await
        }
    }
}

async fn run_node<S: KeyValueStore + Send + Sync + 'static>(
    store: Arc<S>,
    config: NodeConfig,
) -> Result<(), String> {
    let params = chain_params(config.network);
    log_info!("starting umbrad on {:?}", config.network);

    let chain = Arc::new(
        ChainState::open(
            Arc::clone(&store),
            params.clone(),
            config.data_dir.join("blocks"),
        )
        .map_err(|err| format!("failed to open chain state: {err}"))?,
    );
    install_genesis_if_needed(chain.as_ref(), &config.data_dir)?;

    let registry = Arc::new(PeerRegistry::default());
    let net_totals = Arc::new(NetTotals::default());
    let (outbound, _) = broadcast::channel(OUTBOUND_CHANNEL_CAPACITY);

    let mixing = build_mixing(&config, Arc::clone(&store), Arc::clone(&chain))?;
    let ctx = Arc::new(NodeContext {
        chain,
        registry,
        net_totals,
        mixing,
        outbound,
    });

    if let Some(listen) = config.listen {
        let listener = p2p_server::bind(listen).await?;
        tokio::spawn(p2p_server::serve_inbound(
            listener,
            Arc::clone(&ctx),
            params.magic,
            config.max_connections,
        ));
    }
    for addr in &config.connect {
        tokio::spawn(p2p_server::maintain_outbound(
            Arc::clone(&ctx),
            params.magic,
            *addr,
        ));
    }
    if ctx.mixing.is_some() {
        tokio::spawn(relay::mixing_tick_loop(Arc::clone(&ctx)));
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| format!("failed to wait for shutdown signal: {err}"))?;
    log_info!("shutting down");
    Ok(())
}

/// Installs the genesis block from `genesis.dat` when the index is empty.
/// The block body cannot be reconstructed from parameters alone, so it
/// ships alongside the data directory.
fn install_genesis_if_needed<S: KeyValueStore>(
    chain: &ChainState<S>,
    data_dir: &Path,
) -> Result<(), String> {
    if chain.best_hash().is_some() {
        return Ok(());
    }
    let path = data_dir.join("genesis.dat");
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log_warn!(
                "no genesis block at {}; the chain cannot sync until one is installed",
                path.display()
            );
            return Ok(());
        }
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };
    let block = Block::consensus_decode(&bytes)
        .map_err(|err| format!("corrupt genesis block: {err}"))?;
    chain
        .install_genesis(&block)
        .map_err(|err| format!("failed to install genesis: {err}"))?;
    Ok(())
}

fn build_mixing<S: KeyValueStore + Send + Sync + 'static>(
    config: &NodeConfig,
    store: Arc<S>,
    chain: Arc<ChainState<S>>,
) -> Result<Option<Arc<MixingService<S>>>, String> {
    let identity = match (&config.masternode_key, config.masternode_collateral) {
        (Some(key_hex), Some(collateral)) => {
            let secret = parse_secret_hex(key_hex)?;
            Some(MasternodeIdentity::new(collateral, secret))
        }
        _ => None,
    };
    if !config.mixing && identity.is_none() {
        return Ok(None);
    }

    let params = chain_params(config.network);
    let registry = Arc::new(
        MasternodeRegistry::open(store)
            .map_err(|err| format!("failed to open masternode registry: {err}"))?,
    );
    if identity.is_some() {
        log_info!("mixing coordinator role enabled");
    }

    // The keystore must hold the mixing key before it moves into the
    // service, so the round is prepared first.
    let mut keys = NodeKeyStore::new();
    let staged = match &config.mix_key {
        Some(key_hex) => Some(prepare_client_round(
            config,
            key_hex,
            chain.as_ref(),
            &params,
            &mut keys,
        )?),
        None => None,
    };

    let service = Arc::new(MixingService::new(
        params.mixing,
        chain,
        registry,
        keys,
        identity,
        rand::random(),
    ));
    if let Some(round) = staged {
        let denomination = round.denomination;
        service
            .start_client_round(
                round.denomination,
                round.coins,
                round.outputs,
                round.collateral,
                relay::unix_now(),
            )
            .map_err(|err| format!("failed to stage mixing round: {}", err.message()))?;
        log_info!("mixing round staged for denomination mask {denomination:#07b}");
    }
    Ok(Some(service))
}

/// What a staged client round needs before it can chase a coordinator.
#[derive(Debug)]
struct StagedRound {
    denomination: u32,
    coins: Vec<(OutPoint, TxOut)>,
    outputs: Vec<TxOut>,
    collateral: Transaction,
}

/// Resolves the `--mix-*` options against the chain: the coins to mix, one
/// denominated output per coin back to the same key, and a signed
/// collateral transaction.
fn prepare_client_round<S: KeyValueStore>(
    config: &NodeConfig,
    key_hex: &str,
    chain: &ChainState<S>,
    params: &ChainParams,
    keys: &mut NodeKeyStore,
) -> Result<StagedRound, String> {
    let secret = parse_secret_hex(key_hex)?;
    let pubkey = keys.add_key(secret);
    let own_script = p2pkh_script(&hash160(&pubkey.serialize()));

    let mut coins = Vec::with_capacity(config.mix_coins.len());
    let mut outputs = Vec::with_capacity(config.mix_coins.len());
    for (position, prevout) in config.mix_coins.iter().enumerate() {
        let funding = chain
            .output(&prevout.hash, prevout.index)
            .map_err(|err| format!("failed to look up mix coin {position}: {err}"))?
            .ok_or_else(|| format!("mix coin {position} is unknown or already spent"))?;
        outputs.push(TxOut::new(funding.value, own_script.clone()));
        coins.push((*prevout, funding));
    }
    let denomination = classify(&outputs);
    if denomination == 0 {
        return Err("mix coins must hold exact denomination amounts".to_string());
    }

    let collateral_prevout = config
        .mix_collateral
        .ok_or_else(|| "--mix-collateral is required to stage a round".to_string())?;
    let funding = chain
        .output(&collateral_prevout.hash, collateral_prevout.index)
        .map_err(|err| format!("failed to look up mix collateral: {err}"))?
        .ok_or_else(|| "mix collateral is unknown or already spent".to_string())?;
    let fee = params.mixing.min_collateral_fee;
    if funding.value <= fee {
        return Err("mix collateral does not cover the collateral fee".to_string());
    }
    let mut collateral = Transaction {
        version: 1,
        time: 0,
        vin: vec![TxIn::new(collateral_prevout, Vec::new())],
        vout: vec![TxOut::new(funding.value - fee, own_script)],
        lock_time: 0,
    };
    let script_sig = keys
        .sign_input(&collateral, 0, &funding.script_pubkey)
        .ok_or_else(|| "mix collateral is not spendable with --mix-key".to_string())?;
    collateral.vin[0].script_sig = script_sig;

    Ok(StagedRound {
        denomination,
        coins,
        outputs,
        collateral,
    })
}

fn parse_secret_hex(raw: &str) -> Result<SecretKey, String> {
    let raw = raw.trim();
    if raw.len() != 64 {
        return Err("masternode key must be 64 hex characters".to_string());
    }
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&raw[start..start + 2], 16)
            .map_err(|_| "masternode key is not valid hex".to_string())?;
    }
    SecretKey::from_slice(&bytes).map_err(|err| format!("invalid masternode key: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_consensus::Network;

    #[test]
    fn secret_hex_parses() {
        let hex = "01".repeat(32);
        assert!(parse_secret_hex(&hex).is_ok());
        assert!(parse_secret_hex("zz").is_err());
        assert!(parse_secret_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn staging_needs_resolvable_coins() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let params = chain_params(Network::Regtest);
        let chain =
            ChainState::open(Arc::clone(&store), params.clone(), dir.path()).expect("open");
        let args = vec![
            "--mix-key".to_string(),
            "01".repeat(32),
            "--mix-coin".to_string(),
            format!("{}:0", "11".repeat(32)),
            "--mix-collateral".to_string(),
            format!("{}:1", "11".repeat(32)),
        ];
        let config = config::parse_args(&args).expect("parse");

        let mut keys = NodeKeyStore::new();
        let err = prepare_client_round(&config, &"01".repeat(32), &chain, &params, &mut keys)
            .unwrap_err();
        assert!(err.contains("unknown or already spent"));
    }
}
