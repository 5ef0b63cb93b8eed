//! Mixing over the network: dispatches `ds*` commands into the coordinator
//! and client state machines and turns their events back into wire messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::SeedableRng;
use secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use umbra_chainstate::ChainState;
use umbra_consensus::MixingParams;
use umbra_log::{log_debug, log_info, log_warn};
use umbra_masternode::{verify_masternode_signature, MasternodeRegistry};
use umbra_mixing::messages::{
    Completion, FinalTransaction, JoinRequest, QueueAnnounce, SignatureShare, StatusUpdate,
    SubmitEntry, CMD_COMPLETE, CMD_ENTRY, CMD_FINAL_TX, CMD_JOIN, CMD_QUEUE, CMD_SIGNATURES,
    CMD_STATUS,
};
use umbra_mixing::{
    ChainView, ClientOutcome, Coordinator, CoordinatorEvent, MixingClient, PoolError,
};
use umbra_primitives::hash::sha256d;
use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::transaction::{Transaction, TxOut};
use umbra_storage::KeyValueStore;

use crate::keystore::NodeKeyStore;

/// Misbehavior weight for an undecodable mixing payload.
const MALFORMED_MIXING_SCORE: u32 = 20;

/// Pause between direct join attempts from a pending client round.
const COORDINATOR_ASK_INTERVAL_SECS: i64 = 15;

/// Resolves mixing prevouts against the transaction index.
pub struct ChainAdapter<S>(Arc<ChainState<S>>);

impl<S> ChainAdapter<S> {
    pub fn new(chain: Arc<ChainState<S>>) -> Self {
        Self(chain)
    }
}

impl<S: KeyValueStore> ChainView for ChainAdapter<S> {
    fn output(&self, prevout: &OutPoint) -> Option<TxOut> {
        self.0.output(&prevout.hash, prevout.index).ok().flatten()
    }

    fn is_spendable(&self, prevout: &OutPoint) -> bool {
        self.0
            .is_spendable(&prevout.hash, prevout.index)
            .unwrap_or(false)
    }
}

/// Key material a coordinator signs queue announcements with.
pub struct MasternodeIdentity {
    pub collateral: OutPoint,
    secret: SecretKey,
    pub pubkey: PublicKey,
    secp: Secp256k1<All>,
}

impl MasternodeIdentity {
    pub fn new(collateral: OutPoint, secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let pubkey = PublicKey::from_secret_key(&secp, &secret);
        Self {
            collateral,
            secret,
            pubkey,
            secp,
        }
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let digest = sha256d(payload);
        let message = secp256k1::Message::from_digest(digest);
        self.secp
            .sign_ecdsa(&message, &self.secret)
            .serialize_der()
            .to_vec()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Target {
    Peer(u64),
    All,
}

/// One outbound frame the transport should deliver.
#[derive(Clone, Debug)]
pub struct WireMessage {
    pub target: Target,
    pub command: &'static str,
    pub payload: Vec<u8>,
}

/// Everything one dispatch step wants done.
#[derive(Default)]
pub struct MixingOutput {
    pub messages: Vec<WireMessage>,
    /// Transactions to hand to the relay path (joint transactions and
    /// collateral charges).
    pub relay: Vec<Transaction>,
    /// Misbehavior to record against the sending peer.
    pub misbehavior: u32,
}

impl MixingOutput {
    fn malformed() -> Self {
        Self {
            misbehavior: MALFORMED_MIXING_SCORE,
            ..Self::default()
        }
    }
}

/// Which peer last announced for each coordinator, learned from signed
/// `dsq` traffic. A pending client round uses this to reach a coordinator
/// directly instead of waiting for a matching announcement.
#[derive(Default)]
struct CoordinatorPeers {
    by_collateral: HashMap<OutPoint, u64>,
    last_ask: i64,
}

pub struct MixingService<S: KeyValueStore> {
    params: MixingParams,
    coordinator: Mutex<Coordinator<ChainAdapter<S>>>,
    client: Mutex<MixingClient<NodeKeyStore>>,
    queues: Mutex<umbra_mixing::QueueTracker>,
    registry: Arc<MasternodeRegistry<Arc<S>>>,
    identity: Option<MasternodeIdentity>,
    coordinator_peers: Mutex<CoordinatorPeers>,
    rng: Mutex<StdRng>,
}

impl<S: KeyValueStore> MixingService<S> {
    pub fn new(
        params: MixingParams,
        chain: Arc<ChainState<S>>,
        registry: Arc<MasternodeRegistry<Arc<S>>>,
        keys: NodeKeyStore,
        identity: Option<MasternodeIdentity>,
        rng_seed: u64,
    ) -> Self {
        Self {
            params,
            coordinator: Mutex::new(Coordinator::new(
                params,
                ChainAdapter::new(chain),
                rng_seed,
            )),
            client: Mutex::new(MixingClient::new(params, keys)),
            queues: Mutex::new(umbra_mixing::QueueTracker::new()),
            registry,
            identity,
            coordinator_peers: Mutex::new(CoordinatorPeers::default()),
            rng: Mutex::new(StdRng::seed_from_u64(rng_seed)),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.identity.is_some()
    }

    pub fn params(&self) -> &MixingParams {
        &self.params
    }

    /// Stages a client round; the service joins the next matching queue
    /// announcement on its own.
    pub fn start_client_round(
        &self,
        denomination: u32,
        coins: Vec<(OutPoint, TxOut)>,
        outputs: Vec<TxOut>,
        collateral: Transaction,
        now: i64,
    ) -> Result<(), PoolError> {
        self.client
            .lock()
            .expect("mixing client lock")
            .begin(denomination, coins, outputs, collateral, now)
    }

    /// Routes one `ds*` command from a peer.
    pub fn handle_command(
        &self,
        peer: u64,
        peer_version: i32,
        command: &str,
        payload: &[u8],
        now: i64,
    ) -> MixingOutput {
        match command {
            CMD_JOIN => self.on_join(peer, peer_version, payload, now),
            CMD_ENTRY => self.on_entry(peer, payload, now),
            CMD_SIGNATURES => self.on_signatures(peer, payload, now),
            CMD_QUEUE => self.on_queue(peer, payload, now),
            CMD_STATUS => self.on_status(peer, payload, now),
            CMD_FINAL_TX => self.on_final_tx(peer, payload, now),
            CMD_COMPLETE => self.on_complete(payload, now),
            _ => MixingOutput::default(),
        }
    }

    /// Periodic deadlines: coordinator phase budgets, client grace windows,
    /// queue announcement expiry.
    pub fn tick(&self, now: i64) -> MixingOutput {
        let mut output = MixingOutput::default();
        {
            let mut coordinator = self.coordinator.lock().expect("mixing coordinator lock");
            let events = coordinator.tick(now);
            self.collect_events(events, now, &mut output);
        }
        if self.client.lock().expect("mixing client lock").tick(now) {
            log_debug!("mixing client abandoned its round on timeout");
        }
        self.seek_coordinator(now, &mut output);
        self.queues.lock().expect("mixing queue lock").prune(now);
        output
    }

    /// Fallback for a staged round that has seen no matching announcement:
    /// pick a random enabled masternode we have heard from and ask it to
    /// open a queue.
    fn seek_coordinator(&self, now: i64, output: &mut MixingOutput) {
        let mut client = self.client.lock().expect("mixing client lock");
        if !client.has_pending() {
            return;
        }
        let mut peers = self.coordinator_peers.lock().expect("mixing peer map lock");
        if now - peers.last_ask < COORDINATOR_ASK_INTERVAL_SECS {
            return;
        }
        let candidate = {
            let mut rng = self.rng.lock().expect("mixing rng lock");
            self.registry
                .random_enabled_excluding(client.tried_coordinators(), &mut *rng)
        };
        let Some(record) = candidate else {
            return;
        };
        // No connection has announced for this masternode yet.
        let Some(&peer) = peers.by_collateral.get(&record.collateral) else {
            return;
        };
        let Some(request) = client.probe(record.collateral, now) else {
            return;
        };
        peers.last_ask = now;
        log_info!("asking masternode at peer {peer} to open a mixing queue");
        output.messages.push(WireMessage {
            target: Target::Peer(peer),
            command: CMD_JOIN,
            payload: request.encode(),
        });
    }

    fn on_join(&self, peer: u64, peer_version: i32, payload: &[u8], now: i64) -> MixingOutput {
        let Ok(msg) = JoinRequest::decode(payload) else {
            return MixingOutput::malformed();
        };
        if self.identity.is_none() {
            return self.reject(peer, PoolError::NotACoordinator);
        }
        let mut output = MixingOutput::default();
        let result = {
            let mut coordinator = self.coordinator.lock().expect("mixing coordinator lock");
            coordinator.handle_join(peer, peer_version, &msg, now)
        };
        match result {
            Ok(events) => self.collect_events(events, now, &mut output),
            Err(error) => return self.reject(peer, error),
        }
        output
    }

    fn on_entry(&self, peer: u64, payload: &[u8], now: i64) -> MixingOutput {
        let Ok(msg) = SubmitEntry::decode(payload) else {
            return MixingOutput::malformed();
        };
        if self.identity.is_none() {
            return self.reject(peer, PoolError::NotACoordinator);
        }
        let mut output = MixingOutput::default();
        let result = {
            let mut coordinator = self.coordinator.lock().expect("mixing coordinator lock");
            coordinator.handle_entry(peer, &msg, now)
        };
        match result {
            Ok(events) => self.collect_events(events, now, &mut output),
            Err(error) => return self.reject(peer, error),
        }
        output
    }

    fn on_signatures(&self, peer: u64, payload: &[u8], now: i64) -> MixingOutput {
        let Ok(msg) = SignatureShare::decode(payload) else {
            return MixingOutput::malformed();
        };
        if self.identity.is_none() {
            return self.reject(peer, PoolError::NotACoordinator);
        }
        let mut output = MixingOutput::default();
        let result = {
            let mut coordinator = self.coordinator.lock().expect("mixing coordinator lock");
            coordinator.handle_signatures(peer, &msg, now)
        };
        match result {
            Ok(events) => self.collect_events(events, now, &mut output),
            Err(error) => return self.reject(peer, error),
        }
        output
    }

    fn on_queue(&self, peer: u64, payload: &[u8], now: i64) -> MixingOutput {
        let Ok(announce) = QueueAnnounce::decode(payload) else {
            return MixingOutput::malformed();
        };

        // Only registered masternodes may announce, and only under their
        // own registered key.
        let Some(record) = self.registry.find(&announce.coordinator) else {
            log_debug!("queue announce from unknown masternode, ignoring");
            return MixingOutput::default();
        };
        if let Err(reason) = verify_masternode_signature(
            &record.pubkey,
            &announce.signing_payload(),
            &announce.signature,
        ) {
            log_debug!("queue announce rejected: {reason}");
            return MixingOutput::malformed();
        }

        // Any authentic announce teaches us which peer speaks for this
        // coordinator, even a stale or ready one.
        self.coordinator_peers
            .lock()
            .expect("mixing peer map lock")
            .by_collateral
            .insert(announce.coordinator, peer);

        {
            let mut queues = self.queues.lock().expect("mixing queue lock");
            let enabled = self.registry.count_enabled();
            if let Err(error) = queues.accept(&announce, enabled, now) {
                log_debug!("queue announce dropped: {}", error.message());
                return MixingOutput::default();
            }
            let seq = queues.counter();
            if let Err(err) = self.registry.note_queue_announce(&announce.coordinator, seq) {
                log_warn!("masternode registry update failed: {err}");
            }
        }
        if let Err(err) = self.registry.mark_seen(&announce.coordinator, now) {
            log_warn!("masternode registry update failed: {err}");
        }

        // Client role: join the queue when it offers our denomination.
        let join = self
            .client
            .lock()
            .expect("mixing client lock")
            .on_queue_announce(&announce, now);
        let mut output = MixingOutput::default();
        if let Some(request) = join {
            output.messages.push(WireMessage {
                target: Target::Peer(peer),
                command: CMD_JOIN,
                payload: request.encode(),
            });
        }
        output
    }

    fn on_status(&self, peer: u64, payload: &[u8], now: i64) -> MixingOutput {
        let Ok(update) = StatusUpdate::decode(payload) else {
            return MixingOutput::malformed();
        };
        let entry = {
            let mut client = self.client.lock().expect("mixing client lock");
            client.on_status(&update, now)
        };
        let mut output = MixingOutput::default();
        match entry {
            Ok(Some(entry)) => output.messages.push(WireMessage {
                target: Target::Peer(peer),
                command: CMD_ENTRY,
                payload: entry.encode(),
            }),
            Ok(None) => {}
            Err(error) => {
                log_info!("mixing round rejected: {}", error.message());
            }
        }
        output
    }

    fn on_final_tx(&self, peer: u64, payload: &[u8], now: i64) -> MixingOutput {
        let Ok(msg) = FinalTransaction::decode(payload) else {
            return MixingOutput::malformed();
        };
        let share = {
            let mut client = self.client.lock().expect("mixing client lock");
            client.on_final_tx(&msg, now)
        };
        let mut output = MixingOutput::default();
        match share {
            Ok(share) => output.messages.push(WireMessage {
                target: Target::Peer(peer),
                command: CMD_SIGNATURES,
                payload: share.encode(),
            }),
            Err(error) => log_info!("refused to sign joint transaction: {}", error.message()),
        }
        output
    }

    fn on_complete(&self, payload: &[u8], now: i64) -> MixingOutput {
        let Ok(msg) = Completion::decode(payload) else {
            return MixingOutput::malformed();
        };
        let outcome = {
            let mut client = self.client.lock().expect("mixing client lock");
            client.on_completion(&msg, now)
        };
        match outcome {
            ClientOutcome::Success => log_info!("mixing round succeeded"),
            ClientOutcome::Failed(error) => log_info!(
                "mixing round failed: {}",
                error.map(PoolError::message).unwrap_or("unspecified")
            ),
        }
        MixingOutput::default()
    }

    fn reject(&self, peer: u64, error: PoolError) -> MixingOutput {
        let (session_id, state) = {
            let coordinator = self.coordinator.lock().expect("mixing coordinator lock");
            (coordinator.session_id().unwrap_or(0), coordinator.state())
        };
        let update = StatusUpdate {
            session_id,
            state,
            entry_count: 0,
            accepted: false,
            error: Some(error),
        };
        MixingOutput {
            messages: vec![WireMessage {
                target: Target::Peer(peer),
                command: CMD_STATUS,
                payload: update.encode(),
            }],
            ..MixingOutput::default()
        }
    }

    fn collect_events(
        &self,
        events: Vec<CoordinatorEvent>,
        now: i64,
        output: &mut MixingOutput,
    ) {
        for event in events {
            match event {
                CoordinatorEvent::Status { peer, update } => output.messages.push(WireMessage {
                    target: Target::Peer(peer),
                    command: CMD_STATUS,
                    payload: update.encode(),
                }),
                CoordinatorEvent::Broadcast(update) => output.messages.push(WireMessage {
                    target: Target::All,
                    command: CMD_STATUS,
                    payload: update.encode(),
                }),
                CoordinatorEvent::QueueOpened { denomination } => {
                    if let Some(announce) = self.queue_announce(denomination, false, now) {
                        output.messages.push(WireMessage {
                            target: Target::All,
                            command: CMD_QUEUE,
                            payload: announce.encode(),
                        });
                    }
                }
                CoordinatorEvent::QueueReady { denomination } => {
                    if let Some(announce) = self.queue_announce(denomination, true, now) {
                        output.messages.push(WireMessage {
                            target: Target::All,
                            command: CMD_QUEUE,
                            payload: announce.encode(),
                        });
                    }
                }
                CoordinatorEvent::FinalTx(msg) => output.messages.push(WireMessage {
                    target: Target::All,
                    command: CMD_FINAL_TX,
                    payload: msg.encode(),
                }),
                CoordinatorEvent::Complete(msg) => output.messages.push(WireMessage {
                    target: Target::All,
                    command: CMD_COMPLETE,
                    payload: msg.encode(),
                }),
                CoordinatorEvent::RelayTransaction(tx) => output.relay.push(tx),
                CoordinatorEvent::ChargeCollateral(tx) => output.relay.push(tx),
            }
        }
    }

    /// Signed `dsq`. With the ready flag clear it advertises an open queue
    /// clients may join; set, it tells joiners to submit entries.
    fn queue_announce(&self, denomination: u32, ready: bool, now: i64) -> Option<QueueAnnounce> {
        let identity = self.identity.as_ref()?;
        let mut announce = QueueAnnounce {
            denomination,
            coordinator: identity.collateral,
            time: now,
            ready,
            signature: Vec::new(),
        };
        announce.signature = identity.sign(&announce.signing_payload());
        Some(announce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_consensus::{chain_params, Network};
    use umbra_masternode::{MasternodeRecord, MasternodeState};
    use umbra_mixing::denom::DENOMINATIONS;
    use umbra_mixing::PoolState;
    use umbra_primitives::script::p2pkh_script;
    use umbra_primitives::transaction::TxIn;
    use umbra_storage::memory::MemoryStore;

    fn service(
        identity: Option<MasternodeIdentity>,
    ) -> (MixingService<MemoryStore>, tempfile::TempDir) {
        let params = chain_params(Network::Regtest);
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = Arc::new(
            ChainState::open(Arc::clone(&store), params.clone(), dir.path()).expect("open"),
        );
        let registry = Arc::new(MasternodeRegistry::open(store).expect("registry"));
        let service = MixingService::new(
            params.mixing,
            chain,
            registry,
            NodeKeyStore::new(),
            identity,
            7,
        );
        (service, dir)
    }

    fn identity(byte: u8) -> MasternodeIdentity {
        let secret = SecretKey::from_slice(&[byte; 32]).expect("key");
        MasternodeIdentity::new(OutPoint::new([byte; 32], 0), secret)
    }

    fn register(
        service: &MixingService<MemoryStore>,
        coordinator: &MasternodeIdentity,
        now: i64,
    ) {
        service
            .registry
            .upsert(MasternodeRecord {
                collateral: coordinator.collateral,
                pubkey: coordinator.pubkey.serialize().to_vec(),
                address: "127.0.0.1:17601".to_string(),
                protocol_version: 70_054,
                registered_height: 1,
                last_seen: now,
                state: MasternodeState::Enabled,
                last_queue_seq: 0,
            })
            .expect("upsert");
    }

    fn signed_announce(
        coordinator: &MasternodeIdentity,
        denomination: u32,
        ready: bool,
        time: i64,
    ) -> QueueAnnounce {
        let mut announce = QueueAnnounce {
            denomination,
            coordinator: coordinator.collateral,
            time,
            ready,
            signature: Vec::new(),
        };
        announce.signature = coordinator.sign(&announce.signing_payload());
        announce
    }

    /// Stages a client round over fake coins; the collateral does not need
    /// to resolve for the client side.
    fn stage_round(service: &MixingService<MemoryStore>, now: i64) {
        let coin = OutPoint::new([0x41; 32], 1);
        let funding = TxOut::new(DENOMINATIONS[2], p2pkh_script(&[0x41; 20]));
        let outputs = vec![TxOut::new(DENOMINATIONS[2], p2pkh_script(&[0x91; 20]))];
        let collateral = Transaction {
            version: 1,
            time: 0,
            vin: vec![TxIn::new(OutPoint::new([0x42; 32], 0), vec![0x01])],
            vout: vec![TxOut::new(900_000, p2pkh_script(&[0x41; 20]))],
            lock_time: 0,
        };
        service
            .start_client_round(0b00100, vec![(coin, funding)], outputs, collateral, now)
            .expect("round staged");
    }

    #[test]
    fn join_without_identity_reports_not_a_coordinator() {
        let (service, _dir) = service(None);
        let request = JoinRequest {
            denomination: 0b00100,
            collateral: Transaction {
                version: 1,
                time: 0,
                vin: Vec::new(),
                vout: Vec::new(),
                lock_time: 0,
            },
        };
        let output = service.handle_command(3, 70_054, CMD_JOIN, &request.encode(), 100);
        assert_eq!(output.messages.len(), 1);
        let reply = &output.messages[0];
        assert_eq!(reply.target, Target::Peer(3));
        assert_eq!(reply.command, CMD_STATUS);
        let update = StatusUpdate::decode(&reply.payload).expect("status");
        assert!(!update.accepted);
        assert_eq!(update.error, Some(PoolError::NotACoordinator));
        assert_eq!(update.state, PoolState::Idle);
    }

    #[test]
    fn malformed_payload_scores_misbehavior() {
        let (service, _dir) = service(None);
        let output = service.handle_command(3, 70_054, CMD_JOIN, &[0xff, 0x01], 100);
        assert_eq!(output.misbehavior, MALFORMED_MIXING_SCORE);
        assert!(output.messages.is_empty());
    }

    #[test]
    fn queue_announce_needs_a_registered_signer() {
        let (service, _dir) = service(None);
        let coordinator_identity = identity(5);
        let announce = signed_announce(&coordinator_identity, 0b00100, false, 100);

        // Unknown masternode: silently dropped.
        let output = service.handle_command(1, 70_054, CMD_QUEUE, &announce.encode(), 100);
        assert!(output.messages.is_empty());
        assert_eq!(output.misbehavior, 0);

        // Registered with the right key: accepted (no reply without a
        // pending client round).
        register(&service, &coordinator_identity, 100);
        let output = service.handle_command(1, 70_054, CMD_QUEUE, &announce.encode(), 100);
        assert!(output.messages.is_empty());
        assert_eq!(output.misbehavior, 0);

        // Tampered signature: misbehavior.
        let mut tampered = announce.clone();
        tampered.time += 1;
        let output = service.handle_command(1, 70_054, CMD_QUEUE, &tampered.encode(), 101);
        assert_eq!(output.misbehavior, MALFORMED_MIXING_SCORE);
    }

    #[test]
    fn staged_round_joins_an_open_queue_announce() {
        let (service, _dir) = service(None);
        let coordinator_identity = identity(5);
        register(&service, &coordinator_identity, 1_000);
        stage_round(&service, 1_000);

        let announce = signed_announce(&coordinator_identity, 0b00100, false, 1_000);
        let output = service.handle_command(7, 70_054, CMD_QUEUE, &announce.encode(), 1_000);
        assert_eq!(output.messages.len(), 1);
        let join = &output.messages[0];
        assert_eq!(join.target, Target::Peer(7));
        assert_eq!(join.command, CMD_JOIN);
        let request = JoinRequest::decode(&join.payload).expect("join request");
        assert_eq!(request.denomination, 0b00100);
    }

    #[test]
    fn tick_asks_a_known_coordinator_when_no_announce_matches() {
        let (service, _dir) = service(None);
        let coordinator_identity = identity(5);
        register(&service, &coordinator_identity, 1_000);

        // A ready announcement is not joinable, but it reveals which peer
        // speaks for the coordinator.
        let announce = signed_announce(&coordinator_identity, 0b00010, true, 1_000);
        let output = service.handle_command(9, 70_054, CMD_QUEUE, &announce.encode(), 1_000);
        assert!(output.messages.is_empty());

        stage_round(&service, 1_010);
        let output = service.tick(1_020);
        assert_eq!(output.messages.len(), 1);
        let join = &output.messages[0];
        assert_eq!(join.target, Target::Peer(9));
        assert_eq!(join.command, CMD_JOIN);
        let request = JoinRequest::decode(&join.payload).expect("join request");
        assert_eq!(request.denomination, 0b00100);
    }
}
