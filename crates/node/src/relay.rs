//! Per-peer message loop: block download and relay, get-blocks service,
//! and dispatch of mixing traffic.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use umbra_chainstate::{AcceptOutcome, ChainState};
use umbra_consensus::Hash256;
use umbra_log::{log_debug, log_info, log_warn};
use umbra_mixing::messages::{
    CMD_COMPLETE, CMD_ENTRY, CMD_FINAL_TX, CMD_JOIN, CMD_QUEUE, CMD_SIGNATURES, CMD_STATUS,
};
use umbra_primitives::block::Block;
use umbra_primitives::encoding::encode;
use umbra_storage::KeyValueStore;

use crate::mixing_net::{MixingService, Target};
use crate::p2p::{
    build_inv_payload, parse_getblocks, parse_inv, NetTotals, Peer, PeerRegistry, MSG_BLOCK,
};

const READ_TIMEOUT_SECS: u64 = 120;
const MAX_GETDATA_BLOCKS: usize = 256;
const GETDATA_BATCH: usize = 128;
const ZERO_HASH: Hash256 = [0u8; 32];

/// A frame destined for other peers' connections, fanned out over the
/// node-wide broadcast channel.
#[derive(Clone, Debug)]
pub struct OutboundFrame {
    pub target: Target,
    pub command: &'static str,
    pub payload: Vec<u8>,
    /// Peer the triggering data came from; skipped on delivery.
    pub origin: Option<u64>,
    /// For new-tip inventory: the announced height. Delivery skips peers
    /// already at or past it and moves the watermark of those it reaches.
    pub tip_height: Option<i32>,
}

/// Whether a frame is worth sending to a peer at `remote_height`.
fn wants_tip_inventory(tip_height: Option<i32>, remote_height: i32) -> bool {
    tip_height.map_or(true, |height| remote_height < height)
}

/// Shared handles every peer task needs.
pub struct NodeContext<S: KeyValueStore> {
    pub chain: Arc<ChainState<S>>,
    pub registry: Arc<PeerRegistry>,
    pub net_totals: Arc<NetTotals>,
    pub mixing: Option<Arc<MixingService<S>>>,
    pub outbound: broadcast::Sender<OutboundFrame>,
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

/// Runs a handshaked peer until it disconnects or misbehaves.
pub async fn peer_loop<S: KeyValueStore>(
    ctx: Arc<NodeContext<S>>,
    mut peer: Peer,
) -> Result<(), String> {
    let mut frames = ctx.outbound.subscribe();

    // Behind the peer: start pulling its chain straight away.
    if peer.remote_height() > ctx.chain.best_height() {
        let locator = ctx.chain.best_locator();
        peer.send_getblocks(&locator, &ZERO_HASH).await?;
    }

    loop {
        if peer.disconnect_requested() {
            return Err("disconnected by policy".to_string());
        }

        tokio::select! {
            msg = timeout(Duration::from_secs(READ_TIMEOUT_SECS), peer.read_message()) => {
                let (command, payload) = match msg {
                    Ok(Ok(message)) => message,
                    Ok(Err(err)) => return Err(err),
                    Err(_) => return Err("peer read timed out".to_string()),
                };
                handle_message(&ctx, &mut peer, &command, &payload).await?;
            }
            frame = frames.recv() => {
                match frame {
                    Ok(frame) => {
                        if frame.origin == Some(peer.id()) {
                            continue;
                        }
                        let deliver = match frame.target {
                            Target::All => true,
                            Target::Peer(id) => id == peer.id(),
                        };
                        if deliver && wants_tip_inventory(frame.tip_height, peer.remote_height()) {
                            peer.send_message(frame.command, &frame.payload).await?;
                            if let Some(height) = frame.tip_height {
                                peer.bump_remote_height(height);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log_debug!("peer {} lagged {} relay frames", peer.id(), skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

async fn handle_message<S: KeyValueStore>(
    ctx: &NodeContext<S>,
    peer: &mut Peer,
    command: &str,
    payload: &[u8],
) -> Result<(), String> {
    if is_mixing_command(command) {
        return dispatch_mixing(ctx, peer, command, payload).await;
    }
    match command {
        "ping" => peer.send_message("pong", payload).await?,
        "pong" => {}
        "inv" => handle_inv(ctx, peer, payload).await?,
        "getblocks" => handle_getblocks(ctx, peer, payload).await?,
        "getdata" => handle_getdata(ctx, peer, payload).await?,
        "block" => handle_block(ctx, peer, payload).await?,
        "version" => peer.send_message("verack", &[]).await?,
        "verack" => {}
        other => log_debug!("peer {}: ignoring {:?}", peer.id(), other),
    }
    Ok(())
}

fn is_mixing_command(command: &str) -> bool {
    matches!(
        command,
        CMD_JOIN | CMD_QUEUE | CMD_ENTRY | CMD_STATUS | CMD_SIGNATURES | CMD_FINAL_TX
            | CMD_COMPLETE
    )
}

async fn dispatch_mixing<S: KeyValueStore>(
    ctx: &NodeContext<S>,
    peer: &mut Peer,
    command: &str,
    payload: &[u8],
) -> Result<(), String> {
    let Some(mixing) = ctx.mixing.as_ref() else {
        return Ok(());
    };
    let output = mixing.handle_command(
        peer.id(),
        peer.remote_version(),
        command,
        payload,
        unix_now(),
    );
    if output.misbehavior > 0 {
        ctx.registry.add_misbehavior(peer.id(), output.misbehavior);
    }
    for message in output.messages {
        match message.target {
            Target::Peer(id) if id == peer.id() => {
                peer.send_message(message.command, &message.payload).await?;
            }
            target => {
                let _ = ctx.outbound.send(OutboundFrame {
                    target,
                    command: message.command,
                    payload: message.payload,
                    origin: None,
                    tip_height: None,
                });
            }
        }
    }
    for tx in output.relay {
        let _ = ctx.outbound.send(OutboundFrame {
            target: Target::All,
            command: "tx",
            payload: encode(&tx),
            origin: None,
            tip_height: None,
        });
    }
    Ok(())
}

async fn handle_inv<S: KeyValueStore>(
    ctx: &NodeContext<S>,
    peer: &mut Peer,
    payload: &[u8],
) -> Result<(), String> {
    let vectors = parse_inv(payload)?;
    let mut wanted = Vec::new();
    for vector in vectors {
        if vector.inv_type == MSG_BLOCK && !ctx.chain.is_known(&vector.hash) {
            wanted.push(vector.hash);
        }
    }
    for chunk in wanted.chunks(GETDATA_BATCH) {
        peer.send_getdata_blocks(chunk).await?;
    }
    Ok(())
}

async fn handle_getblocks<S: KeyValueStore>(
    ctx: &NodeContext<S>,
    peer: &mut Peer,
    payload: &[u8],
) -> Result<(), String> {
    let request = parse_getblocks(payload)?;
    let inventory = ctx.chain.blocks_after_locator(&request.locator, &request.stop);
    if inventory.is_empty() {
        return Ok(());
    }
    peer.send_inv_blocks(&inventory).await
}

async fn handle_getdata<S: KeyValueStore>(
    ctx: &NodeContext<S>,
    peer: &mut Peer,
    payload: &[u8],
) -> Result<(), String> {
    let vectors = parse_inv(payload)?;
    for vector in vectors.into_iter().take(MAX_GETDATA_BLOCKS) {
        if vector.inv_type != MSG_BLOCK {
            continue;
        }
        let block = ctx
            .chain
            .read_block(&vector.hash)
            .map_err(|err| err.to_string())?;
        if let Some(block) = block {
            peer.send_message("block", &block.consensus_encode()).await?;
        }
    }
    Ok(())
}

async fn handle_block<S: KeyValueStore>(
    ctx: &NodeContext<S>,
    peer: &mut Peer,
    payload: &[u8],
) -> Result<(), String> {
    let block = match Block::consensus_decode(payload) {
        Ok(block) => block,
        Err(err) => {
            log_warn!("peer {}: undecodable block: {err}", peer.id());
            ctx.registry.add_misbehavior(peer.id(), 100);
            return Ok(());
        }
    };

    match ctx.chain.accept_block(&block, unix_now(), Some(peer.id())) {
        Ok(AcceptOutcome::Accepted {
            hash,
            height,
            new_best,
            unorphaned,
        }) => {
            peer.bump_remote_height(height);
            if !unorphaned.is_empty() {
                log_debug!("connected {} held orphans", unorphaned.len());
            }
            if new_best {
                log_info!("new best block at height {}", ctx.chain.best_height());
                let _ = ctx.outbound.send(OutboundFrame {
                    target: Target::All,
                    command: "inv",
                    payload: build_inv_payload(&[hash], MSG_BLOCK),
                    origin: Some(peer.id()),
                    tip_height: Some(height),
                });
            }
        }
        Ok(AcceptOutcome::AlreadyKnown { .. }) => {}
        Ok(AcceptOutcome::Orphan { missing, .. }) => {
            // Ask the sender for the gap back to our chain.
            let locator = ctx.chain.best_locator();
            peer.send_getblocks(&locator, &missing).await?;
        }
        Err(err) => {
            let score = err.dos_score();
            if score > 0 {
                log_warn!("peer {}: block rejected: {err}", peer.id());
                ctx.registry.add_misbehavior(peer.id(), score as u32);
                return Ok(());
            }
            // Local failure (store or block files), not the peer's fault.
            return Err(err.to_string());
        }
    }
    Ok(())
}

/// Drives mixing deadlines and fans resulting frames out to every peer.
pub async fn mixing_tick_loop<S: KeyValueStore>(ctx: Arc<NodeContext<S>>) {
    let Some(mixing) = ctx.mixing.as_ref() else {
        return;
    };
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        let output = mixing.tick(unix_now());
        for message in output.messages {
            let _ = ctx.outbound.send(OutboundFrame {
                target: message.target,
                command: message.command,
                payload: message.payload,
                origin: None,
                tip_height: None,
            });
        }
        for tx in output.relay {
            let _ = ctx.outbound.send(OutboundFrame {
                target: Target::All,
                command: "tx",
                payload: encode(&tx),
                origin: None,
                tip_height: None,
            });
        }
    }
}

/// Cleanup when a peer task ends: drop its held orphans.
pub fn peer_departed<S: KeyValueStore>(ctx: &NodeContext<S>, peer_id: u64) {
    if let Err(err) = ctx.chain.forget_peer_orphans(peer_id) {
        log_warn!("orphan cleanup for peer {peer_id} failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tip_inventory_skips_peers_already_caught_up() {
        assert!(wants_tip_inventory(Some(100), 99));
        assert!(!wants_tip_inventory(Some(100), 100));
        assert!(!wants_tip_inventory(Some(100), 150));
    }

    #[test]
    fn frames_without_a_tip_height_reach_every_peer() {
        assert!(wants_tip_inventory(None, 0));
        assert!(wants_tip_inventory(None, i32::MAX));
    }
}
