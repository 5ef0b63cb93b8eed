//! Listener and outbound connection maintenance.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use umbra_log::{log_debug, log_info, log_warn};
use umbra_storage::KeyValueStore;

use crate::p2p::Peer;
use crate::relay::{peer_departed, peer_loop, NodeContext};

const HANDSHAKE_TIMEOUT_SECS: u64 = 60;
const RECONNECT_DELAY_SECS: u64 = 10;

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, String> {
    TcpListener::bind(addr)
        .await
        .map_err(|err| format!("failed to bind p2p listener {addr}: {err}"))
}

/// Accepts inbound peers forever. Each connection gets its own task running
/// the shared message loop.
pub async fn serve_inbound<S: KeyValueStore + Send + Sync + 'static>(
    listener: TcpListener,
    ctx: Arc<NodeContext<S>>,
    magic: [u8; 4],
    max_connections: usize,
) {
    match listener.local_addr() {
        Ok(addr) => log_info!("p2p listening on {addr}"),
        Err(_) => log_info!("p2p listening"),
    }

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                log_warn!("p2p accept failed: {err}");
                continue;
            }
        };

        let connections = ctx.net_totals.snapshot().connections;
        if connections >= max_connections {
            log_debug!(
                "refusing inbound peer {remote_addr}: connection cap reached \
                 ({connections}/{max_connections})"
            );
            drop(stream);
            continue;
        }

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let mut peer = Peer::from_inbound(
                stream,
                remote_addr,
                magic,
                Arc::clone(&ctx.registry),
                Arc::clone(&ctx.net_totals),
            );
            let peer_id = peer.id();
            let start_height = ctx.chain.best_height();
            let handshake = timeout(
                Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
                peer.handshake(start_height),
            )
            .await;
            match handshake {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log_debug!("inbound peer {remote_addr} handshake failed: {err}");
                    return;
                }
                Err(_) => {
                    log_debug!("inbound peer {remote_addr} handshake timed out");
                    return;
                }
            }

            if let Err(err) = peer_loop(Arc::clone(&ctx), peer).await {
                log_debug!("inbound peer {remote_addr} closed: {err}");
            }
            peer_departed(ctx.as_ref(), peer_id);
        });
    }
}

/// Keeps one outbound connection alive, reconnecting with a fixed delay.
pub async fn maintain_outbound<S: KeyValueStore + Send + Sync + 'static>(
    ctx: Arc<NodeContext<S>>,
    magic: [u8; 4],
    addr: SocketAddr,
) {
    loop {
        match connect_once(Arc::clone(&ctx), magic, addr).await {
            Ok(()) => log_debug!("outbound peer {addr} disconnected"),
            Err(err) => log_debug!("outbound peer {addr}: {err}"),
        }
        sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }
}

async fn connect_once<S: KeyValueStore + Send + Sync + 'static>(
    ctx: Arc<NodeContext<S>>,
    magic: [u8; 4],
    addr: SocketAddr,
) -> Result<(), String> {
    let mut peer = Peer::connect(
        addr,
        magic,
        Arc::clone(&ctx.registry),
        Arc::clone(&ctx.net_totals),
    )
    .await?;
    let peer_id = peer.id();
    let start_height = ctx.chain.best_height();
    timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        peer.handshake(start_height),
    )
    .await
    .map_err(|_| "handshake timed out".to_string())??;
    log_info!(
        "connected to {addr} (version {}, height {})",
        peer.remote_version(),
        peer.remote_height()
    );

    let result = peer_loop(Arc::clone(&ctx), peer).await;
    peer_departed(ctx.as_ref(), peer_id);
    result
}
