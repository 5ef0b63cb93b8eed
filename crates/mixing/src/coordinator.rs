//! Coordinator role: owns the session, accepts joins and entries, builds and
//! shepherds the joint transaction.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use umbra_consensus::constants::MIN_POOL_PEER_PROTO_VERSION;
use umbra_consensus::MixingParams;
use umbra_log::{log_debug, log_info, log_warn};
use umbra_primitives::script::{is_pay_to_pubkey, is_pay_to_pubkey_hash};
use umbra_primitives::transaction::{Transaction, TxIn, TxOut};

use crate::denom::{classify, describe_mask, DENOMINATIONS};
use crate::error::PoolError;
use crate::messages::{Completion, FinalTransaction, JoinRequest, SignatureShare, StatusUpdate, SubmitEntry};
use crate::session::{MixingSession, PoolEntry, PoolState};
use crate::ChainView;

/// Outbound effects of one coordinator step; the node maps these onto the
/// wire and the relay path.
#[derive(Clone, Debug)]
pub enum CoordinatorEvent {
    /// Status update for one participant.
    Status { peer: u64, update: StatusUpdate },
    /// Status update for every participant.
    Broadcast(StatusUpdate),
    /// A session just opened: advertise the queue so waiting clients join.
    QueueOpened { denomination: u32 },
    /// The session is full: announce readiness so joiners submit entries.
    QueueReady { denomination: u32 },
    /// Joint transaction for participants to co-sign.
    FinalTx(FinalTransaction),
    /// Round outcome for every participant.
    Complete(Completion),
    /// Fully-signed joint transaction, ready for mempool relay.
    RelayTransaction(Transaction),
    /// A collateral transaction to broadcast, charging its owner.
    ChargeCollateral(Transaction),
}

pub struct Coordinator<C> {
    params: MixingParams,
    chain: C,
    session: Option<MixingSession>,
    next_session_id: u32,
    rng: StdRng,
}

impl<C: ChainView> Coordinator<C> {
    pub fn new(params: MixingParams, chain: C, rng_seed: u64) -> Self {
        Self {
            params,
            chain,
            session: None,
            next_session_id: 1,
            rng: StdRng::seed_from_u64(rng_seed),
        }
    }

    pub fn state(&self) -> PoolState {
        self.session
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(PoolState::Idle)
    }

    pub fn session_id(&self) -> Option<u32> {
        self.session.as_ref().map(|session| session.id)
    }

    pub fn denomination(&self) -> Option<u32> {
        self.session.as_ref().map(|session| session.denomination)
    }

    /// Handles a `dsa` join-request.
    pub fn handle_join(
        &mut self,
        peer: u64,
        peer_version: i32,
        msg: &JoinRequest,
        now: i64,
    ) -> Result<Vec<CoordinatorEvent>, PoolError> {
        if peer_version < MIN_POOL_PEER_PROTO_VERSION {
            return Err(PoolError::IncompatibleVersion);
        }
        if msg.denomination == 0 || msg.denomination >= 1 << DENOMINATIONS.len() {
            return Err(PoolError::DenominationMismatch);
        }
        self.check_collateral(&msg.collateral)?;

        let opened = self.session.is_none();
        match self.session.as_ref() {
            None => {
                let id = self.next_session_id;
                self.next_session_id = self.next_session_id.wrapping_add(1).max(1);
                log_info!(
                    "mixing session {id} opened for denomination {}",
                    describe_mask(msg.denomination)
                );
                let seed = self.rng.gen();
                self.session = Some(MixingSession::new(id, msg.denomination, seed, now));
            }
            Some(session) => {
                if session.state != PoolState::Queue {
                    return Err(PoolError::NotSessionReady);
                }
                if session.denomination != msg.denomination {
                    return Err(PoolError::DenominationMismatch);
                }
                if session.participants.len() >= self.params.max_participants {
                    return Err(PoolError::SessionFull);
                }
                if session.participants.contains(&peer) {
                    return Err(PoolError::NotSessionReady);
                }
            }
        }
        let Some(session) = self.session.as_mut() else {
            return Err(PoolError::NotSessionReady);
        };

        session.participants.push(peer);
        session.collaterals.push(msg.collateral.clone());

        let mut events = Vec::new();
        if opened {
            events.push(CoordinatorEvent::QueueOpened {
                denomination: session.denomination,
            });
        }
        events.push(CoordinatorEvent::Status {
            peer,
            update: StatusUpdate {
                session_id: session.id,
                state: session.state,
                entry_count: session.entries.len() as u32,
                accepted: true,
                error: None,
            },
        });

        if session.participants.len() == self.params.max_participants {
            session.advance(PoolState::AcceptingEntries, now);
            let denomination = session.denomination;
            let update = StatusUpdate {
                session_id: session.id,
                state: session.state,
                entry_count: 0,
                accepted: true,
                error: None,
            };
            events.push(CoordinatorEvent::QueueReady { denomination });
            events.push(CoordinatorEvent::Broadcast(update));
        }
        Ok(events)
    }

    /// Handles a `dsi` entry submission.
    pub fn handle_entry(
        &mut self,
        peer: u64,
        msg: &SubmitEntry,
        now: i64,
    ) -> Result<Vec<CoordinatorEvent>, PoolError> {
        self.check_collateral(&msg.collateral)?;
        self.validate_entry_inputs(msg)?;

        let Some(session) = self.session.as_mut() else {
            return Err(PoolError::NotSessionReady);
        };
        if session.state != PoolState::AcceptingEntries {
            return Err(PoolError::NotSessionReady);
        }
        if !session.participants.contains(&peer) {
            return Err(PoolError::NotSessionReady);
        }
        if session.entries.iter().any(|entry| entry.peer == peer) {
            return Err(PoolError::InvalidInput);
        }
        if classify(&msg.outputs) != session.denomination {
            return Err(PoolError::DenominationMismatch);
        }
        for input in &msg.inputs {
            if session.entry_claiming(&input.prevout).is_some() {
                return Err(PoolError::InvalidInput);
            }
        }

        session.entries.push(PoolEntry::new(
            peer,
            msg.inputs.clone(),
            msg.outputs.clone(),
            msg.collateral.clone(),
        ));
        log_debug!(
            "mixing session {}: entry {}/{} accepted",
            session.id,
            session.entries.len(),
            self.params.max_participants
        );

        let mut events = vec![CoordinatorEvent::Broadcast(StatusUpdate {
            session_id: session.id,
            state: session.state,
            entry_count: session.entries.len() as u32,
            accepted: true,
            error: None,
        })];

        if session.entries.len() == self.params.max_participants {
            session.advance(PoolState::FinalizeTransaction, now);
            let final_tx = Self::build_final_tx(session, now);
            session.final_tx = Some(final_tx.clone());
            session.advance(PoolState::Signing, now);
            events.push(CoordinatorEvent::FinalTx(FinalTransaction {
                session_id: session.id,
                tx: final_tx,
            }));
        }
        Ok(events)
    }

    /// Handles a `dss` signature share.
    pub fn handle_signatures(
        &mut self,
        peer: u64,
        msg: &SignatureShare,
        _now: i64,
    ) -> Result<Vec<CoordinatorEvent>, PoolError> {
        let Some(session) = self.session.as_mut() else {
            return Err(PoolError::NotSessionReady);
        };
        if session.state != PoolState::Signing || session.id != msg.session_id {
            return Err(PoolError::NotSessionReady);
        }
        if !session.participants.contains(&peer) {
            return Err(PoolError::NotSessionReady);
        }

        let Some(final_tx) = session.final_tx.as_mut() else {
            return Err(PoolError::NotSessionReady);
        };
        for signed in &msg.inputs {
            if signed.script_sig.is_empty() {
                return Err(PoolError::InvalidInput);
            }
            // Signatures bind to inputs by prevout, never by position.
            let Some(entry_index) = session
                .entries
                .iter()
                .position(|entry| entry.owns_prevout(&signed.prevout))
            else {
                return Err(PoolError::InvalidInput);
            };
            let Some(slot) = final_tx
                .vin
                .iter_mut()
                .find(|input| input.prevout == signed.prevout)
            else {
                return Err(PoolError::InvalidInput);
            };
            slot.script_sig = signed.script_sig.clone();
            let entry = &mut session.entries[entry_index];
            if !entry.signed.contains(&signed.prevout) {
                entry.signed.push(signed.prevout);
            }
        }

        if !session.all_signed() {
            return Ok(Vec::new());
        }
        self.complete_session(_now)
    }

    /// Periodic deadline check. A phase overrunning its budget kills the
    /// session; non-signers in a timed-out signing phase pay for it.
    pub fn tick(&mut self, now: i64) -> Vec<CoordinatorEvent> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        let deadline = match session.state {
            PoolState::Queue | PoolState::AcceptingEntries => self.params.queue_timeout_secs,
            PoolState::FinalizeTransaction | PoolState::Signing => {
                self.params.signing_timeout_secs
            }
            _ => return Vec::new(),
        };
        if now - session.phase_started <= deadline as i64 {
            return Vec::new();
        }

        let session = match self.session.take() {
            Some(session) => session,
            None => return Vec::new(),
        };
        log_warn!(
            "mixing session {} timed out in state {}",
            session.id,
            session.state.as_str()
        );

        let mut events = Vec::new();
        if session.state == PoolState::Signing {
            // Whoever submitted an entry but never finished signing pays.
            for entry in &session.entries {
                if !entry.is_fully_signed() {
                    events.push(CoordinatorEvent::ChargeCollateral(entry.collateral.clone()));
                }
            }
        }
        events.push(CoordinatorEvent::Complete(Completion {
            session_id: session.id,
            error: Some(PoolError::NotSessionReady),
        }));
        events
    }

    fn complete_session(&mut self, _now: i64) -> Result<Vec<CoordinatorEvent>, PoolError> {
        let Some(mut session) = self.session.take() else {
            return Err(PoolError::NotSessionReady);
        };
        let final_tx = session.final_tx.take().ok_or(PoolError::NotSessionReady)?;
        Self::check_final_tx(&final_tx)?;
        session.state = PoolState::Transmission;

        let mut events = vec![
            CoordinatorEvent::RelayTransaction(final_tx),
            CoordinatorEvent::Complete(Completion {
                session_id: session.id,
                error: None,
            }),
        ];

        // Roughly one successful round in `charge_one_in` costs a random
        // participant their collateral. The fee is what keeps the scheme
        // funded without a per-round toll.
        if self.params.charge_one_in > 0 && self.rng.gen_ratio(1, self.params.charge_one_in) {
            if let Some(collateral) = session.collaterals.choose(&mut self.rng) {
                log_info!("mixing session {}: charging one collateral", session.id);
                events.push(CoordinatorEvent::ChargeCollateral(collateral.clone()));
            }
        }
        log_info!("mixing session {} completed", session.id);
        Ok(events)
    }

    /// Joint transaction: all entries' inputs and outputs, each list
    /// shuffled on its own so positions leak nothing about pairings.
    fn build_final_tx(session: &MixingSession, now: i64) -> Transaction {
        let mut inputs: Vec<TxIn> = Vec::new();
        let mut outputs: Vec<TxOut> = Vec::new();
        for entry in &session.entries {
            for input in &entry.inputs {
                inputs.push(TxIn::new(input.prevout, Vec::new()));
            }
            outputs.extend(entry.outputs.iter().cloned());
        }
        let mut rng = StdRng::seed_from_u64(session.shuffle_seed);
        inputs.shuffle(&mut rng);
        outputs.shuffle(&mut rng);
        Transaction {
            version: 1,
            time: now as u32,
            vin: inputs,
            vout: outputs,
            lock_time: 0,
        }
    }

    /// The assembled transaction must stand on its own before relay.
    fn check_final_tx(tx: &Transaction) -> Result<(), PoolError> {
        if tx.vin.is_empty() || tx.vout.is_empty() {
            return Err(PoolError::InvalidInput);
        }
        if tx.vin.iter().any(|input| input.script_sig.is_empty()) {
            return Err(PoolError::InvalidInput);
        }
        let mut seen = Vec::with_capacity(tx.vin.len());
        for input in &tx.vin {
            if seen.contains(&input.prevout) {
                return Err(PoolError::InvalidInput);
            }
            seen.push(input.prevout);
        }
        Ok(())
    }

    /// Collateral rules: resolvable inputs, plain payment outputs, and a fee
    /// inside the configured band.
    fn check_collateral(&self, tx: &Transaction) -> Result<(), PoolError> {
        if tx.vin.is_empty() || tx.vout.is_empty() {
            return Err(PoolError::InvalidCollateral);
        }
        let mut input_total: i64 = 0;
        for input in &tx.vin {
            if input.prevout.is_null() {
                return Err(PoolError::InvalidCollateral);
            }
            let Some(funding) = self.chain.output(&input.prevout) else {
                return Err(PoolError::MissingInputTx);
            };
            if !self.chain.is_spendable(&input.prevout) {
                return Err(PoolError::InvalidCollateral);
            }
            input_total = input_total.saturating_add(funding.value);
        }
        let mut output_total: i64 = 0;
        for output in &tx.vout {
            if !is_pay_to_pubkey_hash(&output.script_pubkey) && !is_pay_to_pubkey(&output.script_pubkey) {
                return Err(PoolError::NonStandardScript);
            }
            output_total = output_total.saturating_add(output.value);
        }
        let fee = input_total - output_total;
        if fee < self.params.min_collateral_fee {
            return Err(PoolError::InvalidCollateral);
        }
        if fee > self.params.collateral {
            return Err(PoolError::FeeTooHigh);
        }
        Ok(())
    }

    /// Entry inputs must be distinct, resolvable, unspent, and the claimed
    /// value balance sane.
    fn validate_entry_inputs(&self, msg: &SubmitEntry) -> Result<(), PoolError> {
        if msg.inputs.is_empty() || msg.outputs.is_empty() {
            return Err(PoolError::InvalidInput);
        }
        let mut input_total: i64 = 0;
        let mut seen = Vec::with_capacity(msg.inputs.len());
        for input in &msg.inputs {
            if input.prevout.is_null() || seen.contains(&input.prevout) {
                return Err(PoolError::InvalidInput);
            }
            seen.push(input.prevout);
            let Some(funding) = self.chain.output(&input.prevout) else {
                return Err(PoolError::MissingInputTx);
            };
            if !self.chain.is_spendable(&input.prevout) {
                return Err(PoolError::InvalidInput);
            }
            input_total = input_total.saturating_add(funding.value);
        }
        let output_total: i64 = msg
            .outputs
            .iter()
            .map(|output| output.value)
            .fold(0, i64::saturating_add);
        let fee = input_total - output_total;
        if fee < 0 {
            return Err(PoolError::InvalidInput);
        }
        // Mixing entries should be near value-neutral.
        if fee * 100 > input_total {
            return Err(PoolError::FeeTooHigh);
        }
        Ok(())
    }
}
