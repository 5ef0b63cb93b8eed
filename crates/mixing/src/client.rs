//! Client role: joins a round, submits an entry, audits the joint
//! transaction before signing, and walks away on timeouts.

use std::collections::HashMap;

use umbra_consensus::{Amount, MixingParams};
use umbra_log::{log_debug, log_info, log_warn};
use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::transaction::{Transaction, TxIn, TxOut};

use crate::denom::classify;
use crate::error::PoolError;
use crate::messages::{
    Completion, FinalTransaction, JoinRequest, QueueAnnounce, SignatureShare, StatusUpdate,
    SubmitEntry,
};
use crate::session::PoolState;
use crate::KeyStore;

/// Pause between rounds, entered from both success and failure.
const CLIENT_COOLDOWN_SECS: i64 = 60;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientOutcome {
    Success,
    Failed(Option<PoolError>),
}

pub struct MixingClient<K> {
    params: MixingParams,
    keys: K,
    state: PoolState,
    denomination: u32,
    session_id: u32,
    coordinator: Option<OutPoint>,
    /// Coordinators already tried for the current attempt.
    tried: Vec<OutPoint>,
    /// Coins locked for the round, with their funding outputs.
    coins: Vec<(OutPoint, TxOut)>,
    outputs: Vec<TxOut>,
    collateral: Option<Transaction>,
    submitted: bool,
    phase_started: i64,
    cooldown_until: i64,
}

impl<K: KeyStore> MixingClient<K> {
    pub fn new(params: MixingParams, keys: K) -> Self {
        Self {
            params,
            keys,
            state: PoolState::Idle,
            denomination: 0,
            session_id: 0,
            coordinator: None,
            tried: Vec::new(),
            coins: Vec::new(),
            outputs: Vec::new(),
            collateral: None,
            submitted: false,
            phase_started: 0,
            cooldown_until: 0,
        }
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn locked_coins(&self) -> &[(OutPoint, TxOut)] {
        &self.coins
    }

    /// Whether the client holds prepared coins and waits for a coordinator.
    pub fn has_pending(&self) -> bool {
        self.state == PoolState::Idle && self.denomination != 0
    }

    pub fn tried_coordinators(&self) -> &[OutPoint] {
        &self.tried
    }

    /// Stages a round: the coins to mix, the denominated outputs they should
    /// become, and the collateral put at risk.
    pub fn begin(
        &mut self,
        denomination: u32,
        coins: Vec<(OutPoint, TxOut)>,
        outputs: Vec<TxOut>,
        collateral: Transaction,
        now: i64,
    ) -> Result<(), PoolError> {
        if self.state != PoolState::Idle || self.denomination != 0 {
            return Err(PoolError::NotSessionReady);
        }
        if now < self.cooldown_until {
            return Err(PoolError::NotSessionReady);
        }
        if coins.is_empty() || classify(&outputs) != denomination {
            return Err(PoolError::DenominationMismatch);
        }
        self.denomination = denomination;
        self.coins = coins;
        self.outputs = outputs;
        self.collateral = Some(collateral);
        self.submitted = false;
        Ok(())
    }

    /// Reacts to a coordinator's queue broadcast; joins it when it offers
    /// the denomination this client wants.
    pub fn on_queue_announce(
        &mut self,
        announce: &QueueAnnounce,
        now: i64,
    ) -> Option<JoinRequest> {
        if !self.has_pending() || announce.ready {
            return None;
        }
        if announce.denomination != self.denomination {
            return None;
        }
        if self.tried.contains(&announce.coordinator) {
            return None;
        }
        self.join(announce.coordinator, now)
    }

    /// Random-probe path: ask a specific masternode without an announcement.
    pub fn probe(&mut self, coordinator: OutPoint, now: i64) -> Option<JoinRequest> {
        if !self.has_pending() || self.tried.contains(&coordinator) {
            return None;
        }
        self.join(coordinator, now)
    }

    fn join(&mut self, coordinator: OutPoint, now: i64) -> Option<JoinRequest> {
        let collateral = self.collateral.clone()?;
        self.coordinator = Some(coordinator);
        self.tried.push(coordinator);
        self.state = PoolState::Queue;
        self.phase_started = now;
        log_debug!("mixing client: joining a session");
        Some(JoinRequest {
            denomination: self.denomination,
            collateral,
        })
    }

    /// Coordinator progress feedback; produces this client's entry once the
    /// session starts accepting them.
    pub fn on_status(
        &mut self,
        update: &StatusUpdate,
        now: i64,
    ) -> Result<Option<SubmitEntry>, PoolError> {
        if self.state == PoolState::Idle {
            return Ok(None);
        }
        if !update.accepted {
            let error = update.error;
            log_warn!(
                "mixing client: rejected by coordinator: {}",
                error.map(PoolError::message).unwrap_or("unspecified")
            );
            self.abort(now);
            return Err(error.unwrap_or(PoolError::NotSessionReady));
        }
        if self.state == PoolState::Queue {
            self.session_id = update.session_id;
        }
        if update.session_id != self.session_id {
            return Ok(None);
        }
        if update.state == PoolState::AcceptingEntries && !self.submitted {
            let collateral = self.collateral.clone().ok_or(PoolError::NotSessionReady)?;
            let amount: Amount = self.coins.iter().map(|(_, funding)| funding.value).sum();
            let entry = SubmitEntry {
                inputs: self
                    .coins
                    .iter()
                    .map(|(prevout, _)| TxIn::new(*prevout, Vec::new()))
                    .collect(),
                amount,
                collateral,
                outputs: self.outputs.clone(),
            };
            self.submitted = true;
            self.state = PoolState::AcceptingEntries;
            self.phase_started = now;
            return Ok(Some(entry));
        }
        Ok(None)
    }

    /// Audits the joint transaction and signs this client's inputs. A
    /// missing expected output means a malicious or broken coordinator;
    /// refusing to sign is the whole point of the audit.
    pub fn on_final_tx(
        &mut self,
        msg: &FinalTransaction,
        now: i64,
    ) -> Result<SignatureShare, PoolError> {
        if self.state != PoolState::AcceptingEntries || msg.session_id != self.session_id {
            return Err(PoolError::NotSessionReady);
        }
        if !self.outputs_present(&msg.tx) {
            log_warn!("mixing client: joint transaction omits expected outputs, refusing to sign");
            self.abort(now);
            return Err(PoolError::InvalidInput);
        }

        let mut signed = Vec::with_capacity(self.coins.len());
        for (prevout, funding) in &self.coins {
            let Some(index) = msg.tx.vin.iter().position(|input| input.prevout == *prevout)
            else {
                self.abort(now);
                return Err(PoolError::InvalidInput);
            };
            let Some(script_sig) = self.keys.sign_input(&msg.tx, index, &funding.script_pubkey)
            else {
                self.abort(now);
                return Err(PoolError::InvalidInput);
            };
            signed.push(TxIn::new(*prevout, script_sig));
        }
        self.state = PoolState::Signing;
        self.phase_started = now;
        Ok(SignatureShare {
            session_id: self.session_id,
            inputs: signed,
        })
    }

    /// Round outcome: either way the coins unlock and a cooldown starts.
    pub fn on_completion(&mut self, msg: &Completion, now: i64) -> ClientOutcome {
        if msg.session_id != self.session_id || self.state == PoolState::Idle {
            return ClientOutcome::Failed(Some(PoolError::NotSessionReady));
        }
        let outcome = match msg.error {
            None => {
                log_info!("mixing client: round completed");
                ClientOutcome::Success
            }
            Some(error) => {
                log_warn!("mixing client: round failed: {}", error.message());
                ClientOutcome::Failed(Some(error))
            }
        };
        self.reset(now);
        outcome
    }

    /// Deadline check with the client grace buffer on top of the
    /// coordinator's own timeout, so the coordinator always gives up first.
    /// Returns true when the attempt was abandoned.
    pub fn tick(&mut self, now: i64) -> bool {
        let base = match self.state {
            PoolState::Queue | PoolState::AcceptingEntries => self.params.queue_timeout_secs,
            PoolState::Signing => self.params.signing_timeout_secs,
            _ => return false,
        };
        let deadline = (base + self.params.client_grace_secs) as i64;
        if now - self.phase_started <= deadline {
            return false;
        }
        log_warn!("mixing client: session timed out, abandoning round");
        self.abort(now);
        true
    }

    fn outputs_present(&self, tx: &Transaction) -> bool {
        let mut available: HashMap<(Amount, &[u8]), usize> = HashMap::new();
        for output in &tx.vout {
            *available
                .entry((output.value, output.script_pubkey.as_slice()))
                .or_insert(0) += 1;
        }
        for output in &self.outputs {
            let key = (output.value, output.script_pubkey.as_slice());
            match available.get_mut(&key) {
                Some(count) if *count > 0 => *count -= 1,
                _ => return false,
            }
        }
        true
    }

    fn abort(&mut self, now: i64) {
        self.state = PoolState::Error;
        self.reset(now);
    }

    /// Releases locked coins and re-arms after a cooldown.
    fn reset(&mut self, now: i64) {
        self.state = PoolState::Idle;
        self.denomination = 0;
        self.session_id = 0;
        self.coordinator = None;
        self.tried.clear();
        self.coins.clear();
        self.outputs.clear();
        self.collateral = None;
        self.submitted = false;
        self.cooldown_until = now + CLIENT_COOLDOWN_SECS;
    }
}
