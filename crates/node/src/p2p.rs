//! P2P transport: 24-byte message framing, the peer registry, and the
//! block-sync payload codecs.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use umbra_consensus::constants::{BAN_SCORE_THRESHOLD, PROTOCOL_VERSION};
use umbra_consensus::Hash256;
use umbra_primitives::encoding::{Decoder, Encoder};
use umbra_primitives::hash::sha256d;

const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
const MAX_INV_RESULTS: usize = 50_000;
const MAX_LOCATOR_HASHES: usize = 128;
const NODE_NETWORK: u64 = 1;
pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
const SEND_TIMEOUT_SECS: u64 = 10;
const HANDSHAKE_READ_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("/umbrad:", env!("CARGO_PKG_VERSION"), "/");

#[derive(Clone, Debug)]
pub struct PeerInfoSnapshot {
    pub id: u64,
    pub addr: SocketAddr,
    pub inbound: bool,
    pub version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub misbehavior: u32,
    pub connected_since: SystemTime,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

#[derive(Clone, Debug)]
struct PeerEntry {
    addr: SocketAddr,
    inbound: bool,
    version: i32,
    services: u64,
    user_agent: String,
    start_height: i32,
    misbehavior: u32,
    connected_since: SystemTime,
    bytes_sent: u64,
    bytes_recv: u64,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    next_id: AtomicU64,
    peers: Mutex<HashMap<u64, PeerEntry>>,
    disconnect_requests: Mutex<HashSet<u64>>,
}

impl PeerRegistry {
    pub fn register(&self, addr: SocketAddr, inbound: bool) -> u64 {
        let entry = PeerEntry {
            addr,
            inbound,
            version: 0,
            services: 0,
            user_agent: String::new(),
            start_height: -1,
            misbehavior: 0,
            connected_since: SystemTime::now(),
            bytes_sent: 0,
            bytes_recv: 0,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(id, entry);
        }
        id
    }

    pub fn update_version(
        &self,
        id: u64,
        version: i32,
        services: u64,
        user_agent: String,
        start_height: i32,
    ) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(entry) = peers.get_mut(&id) {
                entry.version = version;
                entry.services = services;
                entry.user_agent = user_agent;
                entry.start_height = start_height;
            }
        }
    }

    pub fn note_send(&self, id: u64, bytes: usize) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(entry) = peers.get_mut(&id) {
                entry.bytes_sent = entry.bytes_sent.saturating_add(bytes as u64);
            }
        }
    }

    pub fn note_recv(&self, id: u64, bytes: usize) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(entry) = peers.get_mut(&id) {
                entry.bytes_recv = entry.bytes_recv.saturating_add(bytes as u64);
            }
        }
    }

    /// Accumulates misbehavior; past the threshold the peer is marked for
    /// disconnect. Returns the new total.
    pub fn add_misbehavior(&self, id: u64, score: u32) -> u32 {
        let total = match self.peers.lock() {
            Ok(mut peers) => match peers.get_mut(&id) {
                Some(entry) => {
                    entry.misbehavior = entry.misbehavior.saturating_add(score);
                    entry.misbehavior
                }
                None => return 0,
            },
            Err(_) => return 0,
        };
        if total >= BAN_SCORE_THRESHOLD {
            self.request_disconnect(id);
        }
        total
    }

    pub fn request_disconnect(&self, id: u64) {
        if let Ok(mut requests) = self.disconnect_requests.lock() {
            requests.insert(id);
        }
    }

    pub fn disconnect_requested(&self, id: u64) -> bool {
        self.disconnect_requests
            .lock()
            .map(|requests| requests.contains(&id))
            .unwrap_or(false)
    }

    pub fn remove(&self, id: u64) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&id);
        }
        if let Ok(mut requests) = self.disconnect_requests.lock() {
            requests.remove(&id);
        }
    }

    pub fn count(&self) -> usize {
        self.peers.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<PeerInfoSnapshot> {
        let peers = match self.peers.lock() {
            Ok(peers) => peers,
            Err(_) => return Vec::new(),
        };
        peers
            .iter()
            .map(|(id, entry)| PeerInfoSnapshot {
                id: *id,
                addr: entry.addr,
                inbound: entry.inbound,
                version: entry.version,
                services: entry.services,
                user_agent: entry.user_agent.clone(),
                start_height: entry.start_height,
                misbehavior: entry.misbehavior,
                connected_since: entry.connected_since,
                bytes_sent: entry.bytes_sent,
                bytes_recv: entry.bytes_recv,
            })
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct NetTotalsSnapshot {
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub connections: usize,
}

#[derive(Debug, Default)]
pub struct NetTotals {
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    connections: AtomicUsize,
}

impl NetTotals {
    pub fn add_recv(&self, bytes: usize) {
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_connections(&self) {
        // Saturates at zero rather than wrapping on double-drop bugs.
        self.connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            })
            .ok();
    }

    pub fn snapshot(&self) -> NetTotalsSnapshot {
        NetTotalsSnapshot {
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

pub struct Peer {
    stream: TcpStream,
    magic: [u8; 4],
    remote_height: i32,
    remote_version: i32,
    addr: SocketAddr,
    registry_id: u64,
    registry: Arc<PeerRegistry>,
    net_totals: Arc<NetTotals>,
}

impl Peer {
    pub async fn connect(
        addr: SocketAddr,
        magic: [u8; 4],
        registry: Arc<PeerRegistry>,
        net_totals: Arc<NetTotals>,
    ) -> Result<Self, String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| err.to_string())?;
        net_totals.inc_connections();
        let registry_id = registry.register(addr, false);
        Ok(Self {
            stream,
            magic,
            remote_height: -1,
            remote_version: 0,
            addr,
            registry_id,
            registry,
            net_totals,
        })
    }

    pub fn from_inbound(
        stream: TcpStream,
        addr: SocketAddr,
        magic: [u8; 4],
        registry: Arc<PeerRegistry>,
        net_totals: Arc<NetTotals>,
    ) -> Self {
        net_totals.inc_connections();
        let registry_id = registry.register(addr, true);
        Self {
            stream,
            magic,
            remote_height: -1,
            remote_version: 0,
            addr,
            registry_id,
            registry,
            net_totals,
        }
    }

    pub fn id(&self) -> u64 {
        self.registry_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn remote_height(&self) -> i32 {
        self.remote_height
    }

    pub fn bump_remote_height(&mut self, height: i32) {
        self.remote_height = self.remote_height.max(height);
    }

    pub fn remote_version(&self) -> i32 {
        self.remote_version
    }

    pub fn disconnect_requested(&self) -> bool {
        self.registry.disconnect_requested(self.registry_id)
    }

    pub async fn send_message(&mut self, command: &str, payload: &[u8]) -> Result<(), String> {
        let mut frame = Vec::with_capacity(24 + payload.len());
        frame.extend_from_slice(&self.magic);
        let mut command_bytes = [0u8; 12];
        let cmd = command.as_bytes();
        if cmd.len() > 12 {
            return Err("command too long".to_string());
        }
        command_bytes[..cmd.len()].copy_from_slice(cmd);
        frame.extend_from_slice(&command_bytes);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        let checksum = sha256d(payload);
        frame.extend_from_slice(&checksum[..4]);
        frame.extend_from_slice(payload);
        timeout(
            Duration::from_secs(SEND_TIMEOUT_SECS),
            self.stream.write_all(&frame),
        )
        .await
        .map_err(|_| "peer write timed out".to_string())?
        .map_err(|err| err.to_string())?;
        self.net_totals.add_sent(frame.len());
        self.registry.note_send(self.registry_id, frame.len());
        Ok(())
    }

    pub async fn read_message(&mut self) -> Result<(String, Vec<u8>), String> {
        let mut header = [0u8; 24];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|err| err.to_string())?;
        if header[..4] != self.magic {
            return Err("invalid magic".to_string());
        }
        let command = header[4..16]
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| *byte as char)
            .collect::<String>();
        let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err("payload too large".to_string());
        }
        let checksum = &header[20..24];
        let mut payload = vec![0u8; length];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|err| err.to_string())?;
        let calc = sha256d(&payload);
        if checksum != &calc[..4] {
            return Err("invalid payload checksum".to_string());
        }
        let bytes = 24 + payload.len();
        self.net_totals.add_recv(bytes);
        self.registry.note_recv(self.registry_id, bytes);
        Ok((command, payload))
    }

    /// Version/verack exchange. Either side may also ping during it.
    pub async fn handshake(&mut self, start_height: i32) -> Result<(), String> {
        let payload = build_version_payload(start_height);
        self.send_message("version", &payload).await?;

        let mut got_verack = false;
        let mut got_version = false;
        while !(got_verack && got_version) {
            let (command, payload) = timeout(
                Duration::from_secs(HANDSHAKE_READ_TIMEOUT_SECS),
                self.read_message(),
            )
            .await
            .map_err(|_| "peer handshake timed out".to_string())??;
            match command.as_str() {
                "version" => {
                    got_version = true;
                    self.send_message("verack", &[]).await?;
                    if let Ok(info) = parse_version(&payload) {
                        self.remote_height = info.start_height;
                        self.remote_version = info.version;
                        self.registry.update_version(
                            self.registry_id,
                            info.version,
                            info.services,
                            info.user_agent,
                            info.start_height,
                        );
                    }
                }
                "verack" => {
                    got_verack = true;
                }
                "ping" => {
                    self.send_message("pong", &payload).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub async fn send_inv_blocks(&mut self, hashes: &[Hash256]) -> Result<(), String> {
        let payload = build_inv_payload(hashes, MSG_BLOCK);
        self.send_message("inv", &payload).await
    }

    pub async fn send_getblocks(
        &mut self,
        locator: &[Hash256],
        stop: &Hash256,
    ) -> Result<(), String> {
        let payload = build_getblocks_payload(locator, stop);
        self.send_message("getblocks", &payload).await
    }

    pub async fn send_getdata_blocks(&mut self, hashes: &[Hash256]) -> Result<(), String> {
        let payload = build_inv_payload(hashes, MSG_BLOCK);
        self.send_message("getdata", &payload).await
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.net_totals.dec_connections();
        self.registry.remove(self.registry_id);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InventoryVector {
    pub inv_type: u32,
    pub hash: Hash256,
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<InventoryVector>, String> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "inv count too large".to_string())?;
    if count > MAX_INV_RESULTS {
        return Err("inv count too large".to_string());
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let inv_type = decoder.read_u32_le().map_err(|err| err.to_string())?;
        let hash = decoder.read_hash_le().map_err(|err| err.to_string())?;
        out.push(InventoryVector { inv_type, hash });
    }
    if !decoder.is_empty() {
        return Err("trailing bytes in inv payload".to_string());
    }
    Ok(out)
}

pub fn build_inv_payload(hashes: &[Hash256], inv_type: u32) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(hashes.len() as u64);
    for hash in hashes {
        encoder.write_u32_le(inv_type);
        encoder.write_hash_le(hash);
    }
    encoder.into_inner()
}

#[derive(Clone, Debug)]
pub struct GetBlocksRequest {
    pub locator: Vec<Hash256>,
    pub stop: Hash256,
}

pub fn parse_getblocks(payload: &[u8]) -> Result<GetBlocksRequest, String> {
    let mut decoder = Decoder::new(payload);
    let _protocol_version = decoder.read_i32_le().map_err(|err| err.to_string())?;
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "locator count too large".to_string())?;
    if count > MAX_LOCATOR_HASHES {
        return Err("locator count too large".to_string());
    }
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        let hash = decoder.read_hash_le().map_err(|err| err.to_string())?;
        locator.push(hash);
    }
    let stop = decoder.read_hash_le().map_err(|err| err.to_string())?;
    if !decoder.is_empty() {
        return Err("trailing bytes in getblocks payload".to_string());
    }
    Ok(GetBlocksRequest { locator, stop })
}

pub fn build_getblocks_payload(locator: &[Hash256], stop: &Hash256) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_varint(locator.len() as u64);
    for hash in locator {
        encoder.write_hash_le(hash);
    }
    encoder.write_hash_le(stop);
    encoder.into_inner()
}

struct VersionInfo {
    version: i32,
    services: u64,
    user_agent: String,
    start_height: i32,
}

fn build_version_payload(start_height: i32) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_u64_le(NODE_NETWORK);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    encoder.write_i64_le(timestamp);
    write_net_addr(&mut encoder, NODE_NETWORK, [0u8; 16], 0);
    write_net_addr(&mut encoder, NODE_NETWORK, [0u8; 16], 0);
    encoder.write_u64_le(rand::random());
    encoder.write_var_str(USER_AGENT);
    encoder.write_i32_le(start_height);
    encoder.into_inner()
}

fn parse_version(payload: &[u8]) -> Result<VersionInfo, String> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le().map_err(|err| err.to_string())?;
    let services = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let _timestamp = decoder.read_i64_le().map_err(|err| err.to_string())?;
    read_net_addr(&mut decoder)?;
    read_net_addr(&mut decoder)?;
    let _nonce = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let user_agent = decoder.read_var_str().map_err(|err| err.to_string())?;
    let start_height = decoder.read_i32_le().map_err(|err| err.to_string())?;
    Ok(VersionInfo {
        version,
        services,
        user_agent,
        start_height,
    })
}

fn write_net_addr(encoder: &mut Encoder, services: u64, ip: [u8; 16], port: u16) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&ip);
    encoder.write_bytes(&port.to_be_bytes());
}

fn read_net_addr(decoder: &mut Decoder) -> Result<(), String> {
    let _services = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let _ip = decoder.read_fixed::<16>().map_err(|err| err.to_string())?;
    let _port = decoder.read_bytes(2).map_err(|err| err.to_string())?;
    Ok(())
}
