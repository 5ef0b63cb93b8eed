//! In-memory masternode registry with write-through persistence.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use rand::seq::SliceRandom;
use rand::Rng;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use umbra_log::log_debug;
use umbra_primitives::hash::sha256d;
use umbra_primitives::outpoint::OutPoint;
use umbra_storage::{Column, KeyValueStore, StoreError};

use crate::record::{MasternodeRecord, MasternodeState};

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

fn secp256k1_verify() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1_VERIFY.get_or_init(Secp256k1::verification_only)
}

/// Checks a masternode's DER signature over `payload` against its registered
/// compressed pubkey. The message digest is double-SHA256 of the payload.
pub fn verify_masternode_signature(
    pubkey: &[u8],
    payload: &[u8],
    signature: &[u8],
) -> Result<(), &'static str> {
    let pubkey = PublicKey::from_slice(pubkey).map_err(|_| "invalid masternode pubkey")?;
    let sig = Signature::from_der(signature).map_err(|_| "malformed signature")?;
    let msg = Message::from_digest_slice(&sha256d(payload)).map_err(|_| "invalid digest")?;
    secp256k1_verify()
        .verify_ecdsa(&msg, &sig, &pubkey)
        .map_err(|_| "signature verification failed")
}

pub struct MasternodeRegistry<S> {
    store: S,
    nodes: Mutex<HashMap<OutPoint, MasternodeRecord>>,
}

impl<S: KeyValueStore> MasternodeRegistry<S> {
    /// Loads every persisted record into the cache.
    pub fn open(store: S) -> Result<Self, StoreError> {
        let mut nodes = HashMap::new();
        for (_, value) in store.scan_prefix(Column::Masternode, &[])? {
            let record = MasternodeRecord::decode(&value)
                .map_err(|err| StoreError::Backend(format!("corrupt masternode record: {err}")))?;
            nodes.insert(record.collateral, record);
        }
        if !nodes.is_empty() {
            log_debug!("masternode registry loaded {} records", nodes.len());
        }
        Ok(Self {
            store,
            nodes: Mutex::new(nodes),
        })
    }

    /// Inserts or replaces a record, persisting it in the same call.
    pub fn upsert(&self, record: MasternodeRecord) -> Result<(), StoreError> {
        self.store.put(
            Column::Masternode,
            &MasternodeRecord::storage_key(&record.collateral),
            &record.encode(),
        )?;
        let mut nodes = self.nodes.lock().expect("registry lock");
        nodes.insert(record.collateral, record);
        Ok(())
    }

    pub fn remove(&self, collateral: &OutPoint) -> Result<(), StoreError> {
        self.store
            .delete(Column::Masternode, &MasternodeRecord::storage_key(collateral))?;
        let mut nodes = self.nodes.lock().expect("registry lock");
        nodes.remove(collateral);
        Ok(())
    }

    pub fn find(&self, collateral: &OutPoint) -> Option<MasternodeRecord> {
        let nodes = self.nodes.lock().expect("registry lock");
        nodes.get(collateral).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().expect("registry lock").is_empty()
    }

    pub fn count_enabled(&self) -> usize {
        let nodes = self.nodes.lock().expect("registry lock");
        nodes.values().filter(|record| record.is_enabled()).count()
    }

    /// Snapshot of the enabled set, for iteration outside the lock.
    pub fn enabled(&self) -> Vec<MasternodeRecord> {
        let nodes = self.nodes.lock().expect("registry lock");
        nodes
            .values()
            .filter(|record| record.is_enabled())
            .cloned()
            .collect()
    }

    /// Picks a random enabled masternode whose collateral is not in
    /// `excluded`, for coordinator probing.
    pub fn random_enabled_excluding<R: Rng>(
        &self,
        excluded: &[OutPoint],
        rng: &mut R,
    ) -> Option<MasternodeRecord> {
        let candidates: Vec<MasternodeRecord> = self
            .enabled()
            .into_iter()
            .filter(|record| !excluded.contains(&record.collateral))
            .collect();
        candidates.choose(rng).cloned()
    }

    /// Stamps activity from a node and flips it to enabled if it was only
    /// pre-enabled.
    pub fn mark_seen(&self, collateral: &OutPoint, now: i64) -> Result<(), StoreError> {
        let record = {
            let mut nodes = self.nodes.lock().expect("registry lock");
            let Some(record) = nodes.get_mut(collateral) else {
                return Ok(());
            };
            record.last_seen = now;
            if record.state == MasternodeState::PreEnabled {
                record.state = MasternodeState::Enabled;
            }
            record.clone()
        };
        self.store.put(
            Column::Masternode,
            &MasternodeRecord::storage_key(collateral),
            &record.encode(),
        )
    }

    /// Expires nodes silent for longer than `max_silence_secs`.
    pub fn expire_stale(&self, now: i64, max_silence_secs: i64) -> Result<usize, StoreError> {
        let stale: Vec<MasternodeRecord> = {
            let mut nodes = self.nodes.lock().expect("registry lock");
            let mut expired = Vec::new();
            for record in nodes.values_mut() {
                if record.is_enabled() && now - record.last_seen > max_silence_secs {
                    record.state = MasternodeState::Expired;
                    expired.push(record.clone());
                }
            }
            expired
        };
        for record in &stale {
            self.store.put(
                Column::Masternode,
                &MasternodeRecord::storage_key(&record.collateral),
                &record.encode(),
            )?;
        }
        Ok(stale.len())
    }

    /// Records the queue counter at which a node last announced, for the
    /// rate limiting applied to queue broadcasts.
    pub fn note_queue_announce(&self, collateral: &OutPoint, seq: u64) -> Result<(), StoreError> {
        let record = {
            let mut nodes = self.nodes.lock().expect("registry lock");
            let Some(record) = nodes.get_mut(collateral) else {
                return Ok(());
            };
            record.last_queue_seq = seq;
            record.clone()
        };
        self.store.put(
            Column::Masternode,
            &MasternodeRecord::storage_key(collateral),
            &record.encode(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use umbra_storage::memory::MemoryStore;

    fn memory_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    fn record(tag: u8, state: MasternodeState) -> MasternodeRecord {
        MasternodeRecord {
            collateral: OutPoint::new([tag; 32], 0),
            pubkey: vec![0x02; 33],
            address: format!("10.0.0.{tag}:9637"),
            protocol_version: 70_054,
            registered_height: 100,
            last_seen: 1_700_000_000,
            state,
            last_queue_seq: 0,
        }
    }

    #[test]
    fn upsert_and_reload() {
        let store = memory_store();
        {
            let registry = MasternodeRegistry::open(store.clone()).expect("open");
            registry
                .upsert(record(1, MasternodeState::Enabled))
                .expect("upsert");
            registry
                .upsert(record(2, MasternodeState::Expired))
                .expect("upsert");
        }
        let reloaded = MasternodeRegistry::open(store).expect("reopen");
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.count_enabled(), 1);
        let found = reloaded
            .find(&OutPoint::new([2; 32], 0))
            .expect("record present");
        assert_eq!(found.state, MasternodeState::Expired);
    }

    #[test]
    fn random_selection_respects_exclusions() {
        let store = memory_store();
        let registry = MasternodeRegistry::open(store).expect("open");
        for tag in 1..=4 {
            registry
                .upsert(record(tag, MasternodeState::Enabled))
                .expect("upsert");
        }
        let excluded: Vec<OutPoint> = (1..=3).map(|tag| OutPoint::new([tag; 32], 0)).collect();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            let picked = registry
                .random_enabled_excluding(&excluded, &mut rng)
                .expect("one candidate left");
            assert_eq!(picked.collateral, OutPoint::new([4; 32], 0));
        }
        let all: Vec<OutPoint> = (1..=4).map(|tag| OutPoint::new([tag; 32], 0)).collect();
        assert!(registry.random_enabled_excluding(&all, &mut rng).is_none());
    }

    #[test]
    fn stale_nodes_expire() {
        let store = memory_store();
        let registry = MasternodeRegistry::open(store).expect("open");
        let mut fresh = record(1, MasternodeState::Enabled);
        fresh.last_seen = 1_000_000;
        let mut stale = record(2, MasternodeState::Enabled);
        stale.last_seen = 1_000_000 - 7200;
        registry.upsert(fresh).expect("upsert");
        registry.upsert(stale).expect("upsert");

        let expired = registry.expire_stale(1_000_000, 3600).expect("expire");
        assert_eq!(expired, 1);
        assert_eq!(registry.count_enabled(), 1);
    }

    #[test]
    fn mark_seen_promotes_pre_enabled() {
        let store = memory_store();
        let registry = MasternodeRegistry::open(store).expect("open");
        let pending = record(3, MasternodeState::PreEnabled);
        let collateral = pending.collateral;
        registry.upsert(pending).expect("upsert");
        assert_eq!(registry.count_enabled(), 0);

        registry.mark_seen(&collateral, 1_700_000_100).expect("seen");
        let seen = registry.find(&collateral).expect("present");
        assert!(seen.is_enabled());
        assert_eq!(seen.last_seen, 1_700_000_100);
    }
}
