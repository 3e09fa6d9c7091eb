//! One mixing attempt between the coordinator and a fixed set of seats.
//!
//! The session is a plain state machine: every call is applied atomically
//! by whoever owns it, and every phase ends at a barrier (all seats have
//! answered) or at its deadline. A session is never reused. Aborting it is
//! final and the seats it returns go back to the tier matcher.

use alloy::primitives::{Bytes, B256};
use rand::seq::SliceRandom;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::blame::{BlameReason, BlameRecord, Culprit};
use crate::config::FusionConfig;
use crate::crypto::{self, BlindSigner};
use crate::error::{FusionError, Result};
use crate::tier::{JoinRequest, TierParams};
use crate::types::{
    checked_total, BlindedOutputRequest, BlindedSignature, CandidateTransaction, CoinId,
    CommitmentOpening, InputSignature, ParticipantHandle, PlayerId, Registration,
    RevealedOutput, SessionId, SignedTransaction, TierId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Forming,
    Registered,
    InputsCommitted,
    BlindSigningDone,
    /// Commitments are being opened to find who broke the round
    Blaming,
    OutputsRevealed,
    SigningInProgress,
    Broadcast,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Broadcast | Phase::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Accepted,
    Rejected(String),
}

/// Result of a call that may close a phase barrier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Waiting,
    Advanced(Phase),
}

/// Outcome of a blinded request. Signatures are only released once every
/// seat has submitted, in shuffled order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Buffered,
    Released(Vec<(ParticipantHandle, BlindedSignature)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningOutcome {
    Accepted,
    Completed(SignedTransaction),
}

/// Coordinator-side record of one seat. It never holds a plaintext output:
/// outputs arrive later through anonymous reveals, and blame openings are
/// checked on receipt and reduced to a verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantRecord {
    pub player: PlayerId,
    pub join: JoinRequest,
    #[serde(skip)]
    pub joined_at: Option<Instant>,
    pub registration: Option<Registration>,
    pub requests: Vec<BlindedOutputRequest>,
    pub input_signatures: Vec<InputSignature>,
    /// `Some(None)` once openings checked out clean
    pub blame_response: Option<Option<BlameReason>>,
}

impl ParticipantRecord {
    fn new(player: PlayerId, join: JoinRequest, joined_at: Instant) -> Self {
        Self {
            player,
            join,
            joined_at: Some(joined_at),
            registration: None,
            requests: Vec::new(),
            input_signatures: Vec::new(),
            blame_response: None,
        }
    }

    fn output_count(&self) -> usize {
        self.registration.as_ref().map_or(0, |r| r.commitments.len())
    }

    fn coin_ids(&self) -> Vec<CoinId> {
        self.registration
            .as_ref()
            .map(|r| r.coins.iter().map(|c| c.id).collect())
            .unwrap_or_else(|| self.join.coins.iter().map(|c| c.id).collect())
    }
}

/// A seat handed back to the matcher when the session ends without a
/// transaction
#[derive(Debug, Clone)]
pub struct Returnee {
    pub player: PlayerId,
    pub join: JoinRequest,
    pub joined_at: Instant,
}

pub struct RoundSession {
    id: SessionId,
    tier: TierId,
    min_players: usize,
    max_players: usize,
    config: FusionConfig,
    phase: Phase,
    deadline: Option<Instant>,
    seats: BTreeMap<ParticipantHandle, ParticipantRecord>,
    next_handle: u32,
    seen_request_ids: HashSet<B256>,
    seen_factor_tags: HashSet<B256>,
    pending_signatures: Vec<(ParticipantHandle, BlindedSignature)>,
    released_signatures: Vec<(ParticipantHandle, BlindedSignature)>,
    revealed: Vec<RevealedOutput>,
    candidate: Option<CandidateTransaction>,
    blame_trigger: Option<BlameReason>,
    blame: Option<BlameRecord>,
    signed: Option<SignedTransaction>,
}

impl RoundSession {
    /// Seat limits come from the tier, everything else from `config`
    pub fn new(id: SessionId, tier: TierId, params: &TierParams, config: FusionConfig) -> Self {
        Self {
            id,
            tier,
            min_players: params.min_players,
            max_players: params.max_players,
            config,
            phase: Phase::Forming,
            deadline: None,
            seats: BTreeMap::new(),
            next_handle: 0,
            seen_request_ids: HashSet::new(),
            seen_factor_tags: HashSet::new(),
            pending_signatures: Vec::new(),
            released_signatures: Vec::new(),
            revealed: Vec::new(),
            candidate: None,
            blame_trigger: None,
            blame: None,
            signed: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn tier(&self) -> TierId {
        self.tier
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn blame(&self) -> Option<&BlameRecord> {
        self.blame.as_ref()
    }

    pub fn candidate(&self) -> Option<&CandidateTransaction> {
        self.candidate.as_ref()
    }

    pub fn signed_transaction(&self) -> Option<&SignedTransaction> {
        self.signed.as_ref()
    }

    pub fn seat_count(&self) -> usize {
        self.seats.len()
    }

    pub fn participant_records(
        &self,
    ) -> impl Iterator<Item = (&ParticipantHandle, &ParticipantRecord)> {
        self.seats.iter()
    }

    pub fn handle_of(&self, player: PlayerId) -> Option<ParticipantHandle> {
        self.seats
            .iter()
            .find(|(_, seat)| seat.player == player)
            .map(|(handle, _)| *handle)
    }

    pub fn player_of(&self, handle: ParticipantHandle) -> Option<PlayerId> {
        self.seats.get(&handle).map(|s| s.player)
    }

    /// Coins pledged (or about to be) by every seat
    pub fn pledged_coins(&self) -> Vec<CoinId> {
        self.seats.values().flat_map(|s| s.coin_ids()).collect()
    }

    pub fn coins_of(&self, player: PlayerId) -> Vec<CoinId> {
        self.seats
            .values()
            .filter(|s| s.player == player)
            .flat_map(|s| s.coin_ids())
            .collect()
    }

    /// Blinded signatures already released to a seat, for retried requests
    pub fn signatures_for(&self, handle: ParticipantHandle) -> Vec<BlindedSignature> {
        self.released_signatures
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, sig)| sig.clone())
            .collect()
    }

    pub fn expected_outputs(&self) -> usize {
        self.seats.values().map(|s| s.output_count()).sum()
    }

    pub fn total_fee(&self) -> u64 {
        self.seats
            .values()
            .filter_map(|s| s.registration.as_ref())
            .map(|r| self.config.fee_for(r.coins.len(), r.commitments.len()))
            .fold(0, u64::saturating_add)
    }

    /// Registered input amount across all seats. Registration keeps this
    /// from overflowing.
    fn input_total(&self) -> Option<u64> {
        self.seats
            .values()
            .filter_map(|s| s.registration.as_ref())
            .map(Registration::input_total)
            .try_fold(0u64, |total, seat| total.checked_add(seat?))
    }

    /// Largest amount a single revealed output may carry
    fn spendable(&self) -> u64 {
        self.input_total()
            .map_or(0, |inputs| inputs.saturating_sub(self.total_fee()))
    }

    fn ensure_phase(&self, expected: Phase, now: Instant) -> Result<()> {
        if self.phase != expected {
            return Err(FusionError::WrongPhase {
                expected,
                actual: self.phase,
            });
        }
        if self.deadline.map_or(false, |deadline| now >= deadline) {
            return Err(FusionError::Timeout(expected));
        }
        Ok(())
    }

    fn seat(&self, handle: ParticipantHandle) -> Result<&ParticipantRecord> {
        self.seats.get(&handle).ok_or(FusionError::UnknownParticipant)
    }

    fn enter(&mut self, phase: Phase, deadline: Option<Instant>) {
        debug!(session = %self.id, from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
        self.deadline = deadline;
    }

    fn abort(&mut self, record: BlameRecord) {
        warn!(
            session = %self.id,
            phase = ?self.phase,
            verdict = ?record.verdict,
            "session aborted"
        );
        self.phase = Phase::Aborted;
        self.deadline = None;
        self.pending_signatures.clear();
        self.released_signatures.clear();
        self.revealed.clear();
        self.candidate = None;
        self.blame = Some(record);
    }

    fn abort_blaming(&mut self, handle: ParticipantHandle, reason: BlameReason) {
        let player = match self.seats.get(&handle) {
            Some(seat) => seat.player,
            None => return,
        };
        let record = BlameRecord::attributed(
            self.id,
            self.phase,
            vec![Culprit {
                player,
                handle,
                reason,
            }],
        );
        self.abort(record);
    }

    /// Adds a seat while the session is still forming
    pub fn seat_player(
        &mut self,
        player: PlayerId,
        join: JoinRequest,
        joined_at: Instant,
    ) -> Result<ParticipantHandle> {
        if self.phase != Phase::Forming {
            return Err(FusionError::WrongPhase {
                expected: Phase::Forming,
                actual: self.phase,
            });
        }
        if self.seats.len() >= self.max_players {
            return Err(FusionError::Malformed(format!(
                "session already holds {} players",
                self.max_players
            )));
        }
        let handle = ParticipantHandle(self.next_handle);
        self.next_handle += 1;
        self.seats
            .insert(handle, ParticipantRecord::new(player, join, joined_at));
        Ok(handle)
    }

    /// `Forming → Registered`
    pub fn open_registration(&mut self, now: Instant) -> Result<()> {
        if self.phase != Phase::Forming {
            return Err(FusionError::WrongPhase {
                expected: Phase::Forming,
                actual: self.phase,
            });
        }
        if self.seats.len() < self.min_players {
            return Err(FusionError::Malformed(format!(
                "{} seats below the minimum of {}",
                self.seats.len(),
                self.min_players
            )));
        }
        let deadline = now + self.config.registration_timeout();
        self.enter(Phase::Registered, Some(deadline));
        info!(session = %self.id, players = self.seats.len(), "registration open");
        Ok(())
    }

    fn validate_registration(
        &self,
        seat: &ParticipantRecord,
        registration: &Registration,
    ) -> Result<()> {
        let coins = &registration.coins;
        if coins.is_empty() || coins.len() > self.config.max_inputs_per_participant {
            return Err(FusionError::Malformed(format!(
                "{} inputs, allowed 1..={}",
                coins.len(),
                self.config.max_inputs_per_participant
            )));
        }
        let outputs = registration.commitments.len();
        if outputs == 0 || outputs > self.config.max_outputs_per_participant {
            return Err(FusionError::Malformed(format!(
                "{} output commitments, allowed 1..={}",
                outputs, self.config.max_outputs_per_participant
            )));
        }
        if registration.ownership_proofs.len() != coins.len() {
            return Err(FusionError::Malformed(
                "one ownership proof per coin is required".into(),
            ));
        }
        let distinct: HashSet<B256> = registration.commitments.iter().map(|c| c.0).collect();
        if distinct.len() != outputs {
            return Err(FusionError::Malformed("duplicate output commitment".into()));
        }

        let mut offered: Vec<CoinId> = coins.iter().map(|c| c.id).collect();
        let mut joined: Vec<CoinId> = seat.join.coins.iter().map(|c| c.id).collect();
        offered.sort();
        joined.sort();
        if offered.windows(2).any(|w| w[0] == w[1]) {
            return Err(FusionError::Malformed("coin listed twice".into()));
        }
        if offered != joined {
            return Err(FusionError::Malformed(
                "registered coins differ from the coins the tier was joined with".into(),
            ));
        }

        let inputs = registration
            .input_total()
            .ok_or_else(|| FusionError::Malformed("coin amounts overflow".into()))?;
        if self.input_total().and_then(|t| t.checked_add(inputs)).is_none() {
            return Err(FusionError::Malformed("session input total overflows".into()));
        }
        let fee = self.config.fee_for(coins.len(), outputs);
        let floor = (outputs as u64).saturating_mul(self.config.dust_limit);
        if inputs < fee.saturating_add(floor) {
            return Err(FusionError::BalanceMismatch {
                inputs,
                outputs: floor,
                fee,
            });
        }
        Ok(())
    }

    /// `Registered → InputsCommitted` once every seat has registered
    pub fn register(
        &mut self,
        handle: ParticipantHandle,
        registration: Registration,
        now: Instant,
    ) -> Result<Progress> {
        self.ensure_phase(Phase::Registered, now)?;
        let seat = self.seat(handle)?;

        if let Some(existing) = &seat.registration {
            if *existing == registration {
                return Ok(Progress::Waiting);
            }
            self.abort_blaming(handle, BlameReason::ConflictingData);
            return Err(FusionError::Misbehavior(
                "a second, different registration for the same seat".into(),
            ));
        }

        self.validate_registration(seat, &registration)?;

        for (coin, proof) in registration.coins.iter().zip(&registration.ownership_proofs) {
            let msg = crypto::ownership_message(&self.id, &coin.id);
            if !crypto::verify_digest(&coin.owner, &msg, proof) {
                self.abort_blaming(handle, BlameReason::InvalidOwnershipProof);
                return Err(FusionError::Misbehavior(format!(
                    "ownership proof for {} does not verify",
                    coin.id
                )));
            }
        }

        if let Some(seat) = self.seats.get_mut(&handle) {
            seat.registration = Some(registration);
        }
        debug!(session = %self.id, seat = %handle, "registration accepted");
        Ok(self.maybe_close_registration(now))
    }

    fn maybe_close_registration(&mut self, now: Instant) -> Progress {
        if self.phase != Phase::Registered
            || self.seats.values().any(|s| s.registration.is_none())
        {
            return Progress::Waiting;
        }
        let deadline = now + self.config.blind_signing_timeout();
        self.enter(Phase::InputsCommitted, Some(deadline));
        info!(
            session = %self.id,
            inputs = self.input_total().unwrap_or_default(),
            outputs = self.expected_outputs(),
            "inputs committed"
        );
        Progress::Advanced(Phase::InputsCommitted)
    }

    /// Signs on receipt, but holds every signature back until all seats
    /// have submitted their full quota (`InputsCommitted → BlindSigningDone`).
    pub fn submit_blinded_request<R: RngCore + CryptoRng>(
        &mut self,
        handle: ParticipantHandle,
        request: BlindedOutputRequest,
        signer: &BlindSigner,
        rng: &mut R,
        now: Instant,
    ) -> Result<RequestOutcome> {
        self.ensure_phase(Phase::InputsCommitted, now)?;
        let seat = self.seat(handle)?;

        if seat.requests.contains(&request) {
            return Ok(RequestOutcome::Buffered);
        }
        let allowed = seat.output_count();
        if seat.requests.len() >= allowed {
            return Err(FusionError::RateLimited { allowed });
        }
        if request.blind_msg.is_empty() {
            return Err(FusionError::Malformed("empty blinded message".into()));
        }

        let id = request.id();
        let replayed = self.seen_request_ids.contains(&id);
        if replayed || self.seen_factor_tags.contains(&request.factor_tag) {
            self.abort_blaming(handle, BlameReason::BlindingFactorReuse);
            return Err(FusionError::Misbehavior("blinding factor reused".into()));
        }

        let blind_sig = match signer.sign(rng, &request) {
            Ok(sig) => sig,
            Err(err) => {
                self.abort_blaming(handle, BlameReason::InvalidCommitment);
                return Err(err);
            }
        };

        self.seen_factor_tags.insert(request.factor_tag);
        self.seen_request_ids.insert(id);
        self.pending_signatures.push((handle, blind_sig));
        if let Some(seat) = self.seats.get_mut(&handle) {
            seat.requests.push(request);
        }

        let complete = self
            .seats
            .values()
            .all(|s| s.requests.len() == s.output_count());
        if !complete {
            return Ok(RequestOutcome::Buffered);
        }

        let mut released = std::mem::take(&mut self.pending_signatures);
        released.shuffle(rng);
        self.released_signatures = released.clone();
        let deadline = now + self.config.reveal_timeout();
        self.enter(Phase::BlindSigningDone, Some(deadline));
        info!(session = %self.id, signatures = released.len(), "blind signing done");
        Ok(RequestOutcome::Released(released))
    }

    /// Anonymous reveal of one unblinded output. Carries no seat, so a bad
    /// reveal is rejected rather than blamed.
    pub fn reveal(
        &mut self,
        revealed: RevealedOutput,
        signer: &BlindSigner,
        now: Instant,
    ) -> Result<Verdict> {
        self.ensure_phase(Phase::BlindSigningDone, now)?;

        if self.revealed.contains(&revealed) {
            return Ok(Verdict::Accepted);
        }
        if revealed.output.amount < self.config.dust_limit {
            return Ok(Verdict::Rejected("output below dust limit".into()));
        }
        if revealed.output.amount > self.spendable() {
            return Ok(Verdict::Rejected("output exceeds the session's inputs".into()));
        }
        if revealed.output.destination.is_empty() {
            return Ok(Verdict::Rejected("empty destination".into()));
        }
        let msg = crypto::output_message(&self.id, &revealed.output);
        if signer
            .public_key()
            .verify(&msg, revealed.msg_randomizer, &revealed.signature)
            .is_err()
        {
            return Ok(Verdict::Rejected("signature does not verify".into()));
        }
        if self
            .revealed
            .iter()
            .any(|r| r.output == revealed.output || r.signature == revealed.signature)
        {
            return Ok(Verdict::Rejected("output already revealed".into()));
        }
        if self.revealed.len() >= self.expected_outputs() {
            return Ok(Verdict::Rejected("all outputs already revealed".into()));
        }

        self.revealed.push(revealed);
        if self.revealed.len() == self.expected_outputs() {
            self.close_reveals(now);
        }
        Ok(Verdict::Accepted)
    }

    /// `BlindSigningDone → OutputsRevealed → SigningInProgress`, or into
    /// blame when the books do not balance
    fn close_reveals(&mut self, now: Instant) {
        let inputs = self.input_total();
        let outputs = checked_total(self.revealed.iter().map(|r| r.output.amount));
        let fee = self.total_fee();
        let balanced = match (inputs, outputs) {
            (Some(inputs), Some(outputs)) => outputs.checked_add(fee) == Some(inputs),
            _ => false,
        };
        if !balanced {
            warn!(session = %self.id, ?inputs, ?outputs, fee, "revealed outputs do not balance");
            self.start_blame(BlameReason::BalanceMismatch, now);
            return;
        }

        self.enter(Phase::OutputsRevealed, None);
        // links between seats and blinded requests are no longer needed
        self.released_signatures.clear();

        let coins = self
            .seats
            .values()
            .filter_map(|s| s.registration.as_ref())
            .flat_map(|r| r.coins.iter().cloned())
            .collect();
        let outputs = self.revealed.iter().map(|r| r.output.clone()).collect();
        let candidate = CandidateTransaction::canonical(self.id, coins, outputs, fee);
        info!(
            session = %self.id,
            inputs = candidate.inputs.len(),
            outputs = candidate.outputs.len(),
            fee,
            "candidate transaction assembled"
        );
        self.candidate = Some(candidate);
        let deadline = now + self.config.signing_timeout();
        self.enter(Phase::SigningInProgress, Some(deadline));
    }

    fn start_blame(&mut self, trigger: BlameReason, now: Instant) {
        self.blame_trigger = Some(trigger);
        let deadline = now + self.config.blame_timeout();
        self.enter(Phase::Blaming, Some(deadline));
    }

    /// Checks one seat's commitment openings and keeps only the verdict
    pub fn submit_blame_openings(
        &mut self,
        handle: ParticipantHandle,
        openings: Vec<CommitmentOpening>,
        signer: &BlindSigner,
        now: Instant,
    ) -> Result<Progress> {
        self.ensure_phase(Phase::Blaming, now)?;
        let seat = self.seat(handle)?;
        if seat.blame_response.is_some() {
            return Ok(Progress::Waiting);
        }

        let finding = self.check_openings(seat, &openings, signer);
        if let Some(reason) = finding {
            info!(session = %self.id, seat = %handle, ?reason, "blame opening failed");
        }
        if let Some(seat) = self.seats.get_mut(&handle) {
            seat.blame_response = Some(finding);
        }

        if self.seats.values().all(|s| s.blame_response.is_some()) {
            self.conclude_blame();
            return Ok(Progress::Advanced(Phase::Aborted));
        }
        Ok(Progress::Waiting)
    }

    fn check_openings(
        &self,
        seat: &ParticipantRecord,
        openings: &[CommitmentOpening],
        signer: &BlindSigner,
    ) -> Option<BlameReason> {
        let registration = seat.registration.as_ref()?;
        if openings.len() != registration.commitments.len() {
            return Some(BlameReason::InvalidCommitment);
        }

        let mut matched = HashSet::new();
        for (commitment, opening) in registration.commitments.iter().zip(openings) {
            if !crypto::open(commitment, &self.id, &opening.output, &opening.nonce) {
                return Some(BlameReason::InvalidCommitment);
            }
            let msg = crypto::output_message(&self.id, &opening.output);
            let Ok(blinding) = signer.public_key().blind(&msg, &opening.factor) else {
                return Some(BlameReason::InvalidCommitment);
            };
            match seat.requests.iter().position(|r| *r == blinding.request) {
                Some(index) if matched.insert(index) => {}
                _ => return Some(BlameReason::InvalidCommitment),
            }
        }

        let opened = checked_total(openings.iter().map(|o| o.output.amount));
        let fee = self
            .config
            .fee_for(registration.coins.len(), registration.commitments.len());
        let balanced = match (opened, registration.input_total()) {
            (Some(opened), Some(inputs)) => opened.checked_add(fee) == Some(inputs),
            _ => false,
        };
        if !balanced {
            return Some(BlameReason::BalanceMismatch);
        }

        if self.blame_trigger == Some(BlameReason::MissingReveal) {
            let all_revealed = openings
                .iter()
                .all(|o| self.revealed.iter().any(|r| r.output == o.output));
            if !all_revealed {
                return Some(BlameReason::MissingReveal);
            }
        }
        None
    }

    fn conclude_blame(&mut self) {
        let trigger = self.blame_trigger.unwrap_or(BlameReason::MissedDeadline);
        let silent_reason = if trigger == BlameReason::MissingReveal {
            BlameReason::MissingReveal
        } else {
            BlameReason::MissedDeadline
        };

        let mut culprits = Vec::new();
        let mut silent = Vec::new();
        for (handle, seat) in &self.seats {
            match seat.blame_response {
                Some(Some(reason)) => culprits.push(Culprit {
                    player: seat.player,
                    handle: *handle,
                    reason,
                }),
                Some(None) => {}
                None => silent.push((seat.player, *handle)),
            }
        }

        let record = if culprits.is_empty() {
            if silent.is_empty() {
                BlameRecord::unattributed(self.id, Phase::Blaming, trigger)
            } else {
                BlameRecord::from_dropouts(self.id, Phase::Blaming, &silent, silent_reason)
            }
        } else {
            if silent.len() == 1 {
                let (player, handle) = silent[0];
                culprits.push(Culprit {
                    player,
                    handle,
                    reason: silent_reason,
                });
                silent.clear();
            }
            let mut record = BlameRecord::attributed(self.id, Phase::Blaming, culprits);
            record.dropped = silent.iter().map(|(player, _)| *player).collect();
            record
        };
        self.abort(record);
    }

    /// `SigningInProgress → Broadcast` once every input is signed
    pub fn submit_input_signatures(
        &mut self,
        handle: ParticipantHandle,
        signatures: Vec<InputSignature>,
        now: Instant,
    ) -> Result<SigningOutcome> {
        self.ensure_phase(Phase::SigningInProgress, now)?;
        let seat = self.seat(handle)?;
        let Some(candidate) = self.candidate.as_ref() else {
            return Err(FusionError::WrongPhase {
                expected: Phase::SigningInProgress,
                actual: self.phase,
            });
        };

        if !seat.input_signatures.is_empty() {
            if seat.input_signatures == signatures {
                return Ok(SigningOutcome::Accepted);
            }
            return Err(FusionError::Malformed("inputs already signed".into()));
        }

        let mut own = seat.coin_ids();
        let mut signed: Vec<CoinId> = signatures.iter().map(|s| s.coin).collect();
        own.sort();
        signed.sort();
        if own != signed {
            return Err(FusionError::Malformed(
                "signatures must cover exactly the seat's own inputs".into(),
            ));
        }

        for sig in &signatures {
            let valid = candidate.input_index(&sig.coin).map_or(false, |index| {
                let owner = &candidate.inputs[index].owner;
                crypto::verify_digest(owner, &candidate.sighash(index), &sig.signature)
            });
            if !valid {
                self.abort_blaming(handle, BlameReason::InvalidSignature);
                return Err(FusionError::Misbehavior(format!(
                    "input signature for {} does not verify",
                    sig.coin
                )));
            }
        }

        if let Some(seat) = self.seats.get_mut(&handle) {
            seat.input_signatures = signatures;
        }
        debug!(session = %self.id, seat = %handle, "input signatures accepted");

        if self.seats.values().any(|s| s.input_signatures.is_empty()) {
            return Ok(SigningOutcome::Accepted);
        }
        Ok(SigningOutcome::Completed(self.finish()?))
    }

    fn finish(&mut self) -> Result<SignedTransaction> {
        let Some(tx) = self.candidate.clone() else {
            return Err(FusionError::WrongPhase {
                expected: Phase::SigningInProgress,
                actual: self.phase,
            });
        };
        let mut witnesses: Vec<Option<Bytes>> = vec![None; tx.inputs.len()];
        for sig in self.seats.values().flat_map(|s| &s.input_signatures) {
            if let Some(index) = tx.input_index(&sig.coin) {
                witnesses[index] = Some(sig.signature.clone());
            }
        }
        let witnesses = witnesses
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| FusionError::Malformed("an input is left unsigned".into()))?;

        let signed = SignedTransaction { tx, witnesses };
        info!(session = %self.id, txid = %hex::encode(signed.txid()), "transaction complete");
        self.signed = Some(signed.clone());
        self.enter(Phase::Broadcast, None);
        Ok(signed)
    }

    /// Participant-initiated exit. Free before inputs are committed,
    /// blamed afterwards.
    pub fn withdraw(&mut self, handle: ParticipantHandle, now: Instant) -> Result<Progress> {
        self.seat(handle)?;
        match self.phase {
            Phase::Forming | Phase::Registered => {
                self.seats.remove(&handle);
                info!(session = %self.id, seat = %handle, "seat withdrawn");
                if self.phase == Phase::Registered && self.seats.len() < self.min_players {
                    self.abort(BlameRecord::unattributed(
                        self.id,
                        Phase::Registered,
                        BlameReason::Withdrew,
                    ));
                    return Ok(Progress::Advanced(Phase::Aborted));
                }
                Ok(self.maybe_close_registration(now))
            }
            Phase::Broadcast | Phase::Aborted => Err(FusionError::WrongPhase {
                expected: Phase::SigningInProgress,
                actual: self.phase,
            }),
            _ => {
                self.abort_blaming(handle, BlameReason::Withdrew);
                Ok(Progress::Advanced(Phase::Aborted))
            }
        }
    }

    fn laggards(
        &self,
        pred: impl Fn(&ParticipantRecord) -> bool,
    ) -> Vec<(PlayerId, ParticipantHandle)> {
        self.seats
            .iter()
            .filter(|(_, s)| pred(s))
            .map(|(h, s)| (s.player, *h))
            .collect()
    }

    /// Applies an expired deadline. Goes through the same abort path as an
    /// explicit withdrawal.
    pub fn on_deadline(&mut self, now: Instant) -> Progress {
        let Some(deadline) = self.deadline else {
            return Progress::Waiting;
        };
        if now < deadline {
            return Progress::Waiting;
        }
        warn!(session = %self.id, phase = ?self.phase, "phase deadline passed");

        match self.phase {
            Phase::Registered => {
                let missing = self.laggards(|s| s.registration.is_none());
                let record = BlameRecord::from_dropouts(
                    self.id,
                    Phase::Registered,
                    &missing,
                    BlameReason::MissedDeadline,
                );
                self.abort(record);
            }
            Phase::InputsCommitted => {
                let missing = self.laggards(|s| s.requests.len() < s.output_count());
                let record = BlameRecord::from_dropouts(
                    self.id,
                    Phase::InputsCommitted,
                    &missing,
                    BlameReason::MissedDeadline,
                );
                self.abort(record);
            }
            Phase::BlindSigningDone => {
                info!(
                    session = %self.id,
                    revealed = self.revealed.len(),
                    expected = self.expected_outputs(),
                    "reveal shortfall, opening commitments"
                );
                self.start_blame(BlameReason::MissingReveal, now);
                return Progress::Advanced(Phase::Blaming);
            }
            Phase::Blaming => self.conclude_blame(),
            Phase::SigningInProgress => {
                let missing = self.laggards(|s| s.input_signatures.is_empty());
                let record = BlameRecord::from_dropouts(
                    self.id,
                    Phase::SigningInProgress,
                    &missing,
                    BlameReason::MissedDeadline,
                );
                self.abort(record);
            }
            _ => return Progress::Waiting,
        }
        Progress::Advanced(self.phase)
    }

    /// Seats that go back to the matcher after an abort: everyone the blame
    /// record does not exclude
    pub fn returnees(&self) -> Vec<Returnee> {
        if self.phase != Phase::Aborted {
            return Vec::new();
        }
        let excluded = self.blame.as_ref().map(|b| b.excluded()).unwrap_or_default();
        self.seats
            .values()
            .filter(|s| !excluded.contains(&s.player))
            .filter_map(|s| {
                s.joined_at.map(|joined_at| Returnee {
                    player: s.player,
                    join: s.join.clone(),
                    joined_at,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_signer;
    use crate::participant::CoinSource;
    use crate::types::{Commitment, OutputSpec};
    use crate::wallet::MemoryWallet;
    use rand::thread_rng;
    use std::time::Duration;

    const COIN: u64 = 100_000_000;

    fn config() -> FusionConfig {
        FusionConfig {
            min_players: 3,
            max_players: 5,
            ..FusionConfig::default()
        }
    }

    struct Seat {
        handle: ParticipantHandle,
        wallet: MemoryWallet,
        outputs: Vec<(OutputSpec, B256, B256)>,
    }

    fn params() -> TierParams {
        TierParams {
            min_amount: 0,
            max_amount: None,
            min_players: 3,
            max_players: 5,
        }
    }

    fn registration(
        wallet: &MemoryWallet,
        session: &SessionId,
        commitments: Vec<Commitment>,
    ) -> Registration {
        let coins = wallet.coins();
        let ownership_proofs = coins
            .iter()
            .map(|c| {
                let msg = crypto::ownership_message(session, &c.id);
                wallet.sign_input(&c.id, &msg).unwrap()
            })
            .collect();
        Registration {
            coins,
            commitments,
            ownership_proofs,
        }
    }

    fn sign_all(wallet: &MemoryWallet, candidate: &CandidateTransaction) -> Vec<InputSignature> {
        wallet
            .coins()
            .iter()
            .map(|c| {
                let index = candidate.input_index(&c.id).unwrap();
                InputSignature {
                    coin: c.id,
                    signature: wallet.sign_input(&c.id, &candidate.sighash(index)).unwrap(),
                }
            })
            .collect()
    }

    fn formed(n: usize, now: Instant) -> (RoundSession, Vec<Seat>) {
        let mut rng = thread_rng();
        let id = SessionId::random(&mut rng);
        let mut session = RoundSession::new(id, TierId(0), &params(), config());
        let mut seats = Vec::new();
        for i in 0..n {
            let wallet = MemoryWallet::with_coins(&mut rng, &[COIN]);
            let join = JoinRequest {
                coins: wallet.coins(),
                desired_outputs: vec![99_000_000],
            };
            let handle = session.seat_player(PlayerId(i as u64), join, now).unwrap();
            seats.push(Seat {
                handle,
                wallet,
                outputs: Vec::new(),
            });
        }
        session.open_registration(now).unwrap();
        (session, seats)
    }

    fn register_all(session: &mut RoundSession, seats: &mut [Seat], now: Instant) {
        register_split(session, seats, &[99_000_000], now);
    }

    /// Registers every seat with one commitment per entry of `amounts`
    fn register_split(
        session: &mut RoundSession,
        seats: &mut [Seat],
        amounts: &[u64],
        now: Instant,
    ) {
        let mut rng = thread_rng();
        for seat in seats.iter_mut() {
            let mut commitments = Vec::new();
            for amount in amounts {
                let output = OutputSpec::new(seat.wallet.fresh_destination(), *amount);
                let nonce = crypto::fresh_secret(&mut rng);
                let factor = crypto::fresh_secret(&mut rng);
                commitments.push(crypto::commit(&session.id(), &output, &nonce));
                seat.outputs.push((output, nonce, factor));
            }
            let registration = registration(&seat.wallet, &session.id(), commitments);
            session.register(seat.handle, registration, now).unwrap();
        }
    }

    fn request_all(
        session: &mut RoundSession,
        seats: &[Seat],
        now: Instant,
    ) -> Vec<(ParticipantHandle, BlindedSignature)> {
        let mut rng = thread_rng();
        let pk = test_signer().public_key();
        let mut released = Vec::new();
        for seat in seats {
            for (output, _, factor) in &seat.outputs {
                let msg = crypto::output_message(&session.id(), output);
                let blinding = pk.blind(&msg, factor).unwrap();
                let request = blinding.request;
                let outcome = session
                    .submit_blinded_request(seat.handle, request, test_signer(), &mut rng, now)
                    .unwrap();
                if let RequestOutcome::Released(sigs) = outcome {
                    released = sigs;
                }
            }
        }
        released
    }

    fn reveal_for(
        session: &RoundSession,
        seat: &Seat,
        sigs: &[(ParticipantHandle, BlindedSignature)],
    ) -> Vec<RevealedOutput> {
        let pk = test_signer().public_key();
        seat.outputs
            .iter()
            .map(|(output, _, factor)| {
                let msg = crypto::output_message(&session.id(), output);
                let blinding = pk.blind(&msg, factor).unwrap();
                let (_, blind_sig) = sigs
                    .iter()
                    .find(|(h, s)| *h == seat.handle && s.id == blinding.request.id())
                    .unwrap();
                let signature = pk.finalize(&blinding, blind_sig, &msg).unwrap();
                RevealedOutput {
                    output: output.clone(),
                    msg_randomizer: blinding.msg_randomizer,
                    signature,
                }
            })
            .collect()
    }

    #[test]
    fn test_full_round() {
        let now = Instant::now();
        let (mut session, mut seats) = formed(3, now);
        register_all(&mut session, &mut seats, now);
        assert_eq!(session.phase(), Phase::InputsCommitted);

        let sigs = request_all(&mut session, &seats, now);
        assert_eq!(sigs.len(), 3);
        assert_eq!(session.phase(), Phase::BlindSigningDone);

        for seat in &seats {
            for revealed in reveal_for(&session, seat, &sigs) {
                let verdict = session.reveal(revealed, test_signer(), now).unwrap();
                assert_eq!(verdict, Verdict::Accepted);
            }
        }
        assert_eq!(session.phase(), Phase::SigningInProgress);
        let candidate = session.candidate().unwrap().clone();
        assert!(candidate.is_balanced());

        let mut outcome = SigningOutcome::Accepted;
        for seat in &seats {
            let sigs = sign_all(&seat.wallet, &candidate);
            outcome = session.submit_input_signatures(seat.handle, sigs, now).unwrap();
        }
        let SigningOutcome::Completed(signed) = outcome else {
            panic!("round should complete");
        };
        assert_eq!(signed.witnesses.len(), 3);
        assert_eq!(session.phase(), Phase::Broadcast);
    }

    #[test]
    fn test_conflicting_reregistration_aborts() {
        let now = Instant::now();
        let (mut session, mut seats) = formed(3, now);
        register_all(&mut session, &mut seats[..1], now);

        // identical resubmission is a retry
        let first = session.seats[&seats[0].handle].registration.clone().unwrap();
        let retry = session.register(seats[0].handle, first, now).unwrap();
        assert_eq!(retry, Progress::Waiting);

        let output = OutputSpec::new(vec![1u8; 20], 5_000);
        let other = crypto::commit(&session.id(), &output, &B256::ZERO);
        let registration = registration(&seats[0].wallet, &session.id(), vec![other]);
        let err = session.register(seats[0].handle, registration, now).unwrap_err();
        assert!(matches!(err, FusionError::Misbehavior(_)));
        assert_eq!(session.phase(), Phase::Aborted);
        assert!(session.blame().unwrap().names(seats[0].handle));
    }

    #[test]
    fn test_rate_limit_and_factor_reuse() {
        let now = Instant::now();
        let (mut session, mut seats) = formed(3, now);
        register_all(&mut session, &mut seats, now);

        let mut rng = thread_rng();
        let pk = test_signer().public_key();
        let (output, _, factor) = seats[0].outputs[0].clone();
        let msg = crypto::output_message(&session.id(), &output);
        let blinding = pk.blind(&msg, &factor).unwrap();
        session
            .submit_blinded_request(seats[0].handle, blinding.request, test_signer(), &mut rng, now)
            .unwrap();

        // a second request beyond the registered output count
        let extra = pk.blind(&msg, &crypto::fresh_secret(&mut rng)).unwrap();
        let err = session
            .submit_blinded_request(seats[0].handle, extra.request, test_signer(), &mut rng, now)
            .unwrap_err();
        assert_eq!(err, FusionError::RateLimited { allowed: 1 });

        // seat 1 reuses seat 0's factor for its own output
        let (output1, _, _) = seats[1].outputs[0].clone();
        let reuse = pk
            .blind(&crypto::output_message(&session.id(), &output1), &factor)
            .unwrap();
        let err = session
            .submit_blinded_request(seats[1].handle, reuse.request, test_signer(), &mut rng, now)
            .unwrap_err();
        assert!(matches!(err, FusionError::Misbehavior(_)));
        let blame = session.blame().unwrap();
        assert!(blame.names(seats[1].handle));
        assert_eq!(blame.culprits()[0].reason, BlameReason::BlindingFactorReuse);
    }

    #[test]
    fn test_registration_deadline_blames_missing_seat() {
        let now = Instant::now();
        let (mut session, mut seats) = formed(4, now);
        register_all(&mut session, &mut seats[..3], now);

        let late = now + Duration::from_millis(config().registration_timeout_ms);
        let empty = registration(&seats[3].wallet, &session.id(), vec![]);
        let err = session.register(seats[3].handle, empty, late).unwrap_err();
        assert_eq!(err, FusionError::Timeout(Phase::Registered));

        assert_eq!(session.on_deadline(late), Progress::Advanced(Phase::Aborted));
        assert!(session.blame().unwrap().names(seats[3].handle));
        let back: Vec<PlayerId> = session.returnees().iter().map(|r| r.player).collect();
        assert_eq!(back, vec![PlayerId(0), PlayerId(1), PlayerId(2)]);
    }

    #[test]
    fn test_withdraw_before_commit_is_free() {
        let now = Instant::now();
        let (mut session, mut seats) = formed(4, now);
        register_all(&mut session, &mut seats[..3], now);

        assert_eq!(
            session.withdraw(seats[3].handle, now).unwrap(),
            Progress::Advanced(Phase::InputsCommitted)
        );
        assert_eq!(session.seat_count(), 3);

        // after commitment a withdrawal is blamed
        session.withdraw(seats[0].handle, now).unwrap();
        assert_eq!(session.phase(), Phase::Aborted);
        assert_eq!(session.blame().unwrap().culprits()[0].reason, BlameReason::Withdrew);
    }

    #[test]
    fn test_withdraw_below_minimum_aborts_without_blame() {
        let now = Instant::now();
        let (mut session, seats) = formed(3, now);
        session.withdraw(seats[2].handle, now).unwrap();
        assert_eq!(session.phase(), Phase::Aborted);
        assert!(session.blame().unwrap().culprits().is_empty());
        assert_eq!(session.returnees().len(), 2);
    }

    #[test]
    fn test_invalid_input_signature_aborts() {
        let now = Instant::now();
        let (mut session, mut seats) = formed(3, now);
        register_all(&mut session, &mut seats, now);
        let sigs = request_all(&mut session, &seats, now);
        for seat in &seats {
            for revealed in reveal_for(&session, seat, &sigs) {
                session.reveal(revealed, test_signer(), now).unwrap();
            }
        }
        let candidate = session.candidate().unwrap().clone();
        let mut forged = sign_all(&seats[1].wallet, &candidate);
        forged[0].signature = Bytes::from(vec![7u8; 64]);
        assert!(session.submit_input_signatures(seats[1].handle, forged, now).is_err());
        assert!(session.blame().unwrap().names(seats[1].handle));
    }

    #[test]
    fn test_records_never_hold_plaintext_outputs() {
        let now = Instant::now();
        let (mut session, mut seats) = formed(3, now);
        register_all(&mut session, &mut seats, now);
        let sigs = request_all(&mut session, &seats, now);
        for seat in &seats {
            for revealed in reveal_for(&session, seat, &sigs) {
                session.reveal(revealed, test_signer(), now).unwrap();
            }
        }
        let records: Vec<_> = session.participant_records().map(|(_, r)| r).collect();
        let dump = serde_json::to_string(&records).unwrap();
        for seat in &seats {
            let destination = hex::encode(&seat.outputs[0].0.destination);
            assert!(!dump.contains(&destination));
        }
    }

    #[test]
    fn test_factor_reused_across_own_outputs() {
        let now = Instant::now();
        let (mut session, mut seats) = formed(3, now);
        register_split(&mut session, &mut seats, &[49_000_000, 49_500_000], now);
        assert_eq!(session.phase(), Phase::InputsCommitted);

        let mut rng = thread_rng();
        let pk = test_signer().public_key();
        let handle = seats[0].handle;
        let (first, _, factor) = seats[0].outputs[0].clone();
        let (second, _, _) = seats[0].outputs[1].clone();
        let blinding = pk.blind(&crypto::output_message(&session.id(), &first), &factor).unwrap();
        let outcome = session
            .submit_blinded_request(handle, blinding.request, test_signer(), &mut rng, now)
            .unwrap();
        assert_eq!(outcome, RequestOutcome::Buffered);

        // same seat, second output, same factor
        let reuse = pk.blind(&crypto::output_message(&session.id(), &second), &factor).unwrap();
        let err = session
            .submit_blinded_request(handle, reuse.request, test_signer(), &mut rng, now)
            .unwrap_err();
        assert!(matches!(err, FusionError::Misbehavior(_)));
        assert_eq!(session.phase(), Phase::Aborted);
        let blame = session.blame().unwrap();
        assert_eq!(blame.culprits().len(), 1);
        assert!(blame.names(handle));
        assert_eq!(blame.culprits()[0].reason, BlameReason::BlindingFactorReuse);
    }

    #[test]
    fn test_oversized_reveal_is_rejected() {
        let now = Instant::now();
        let (mut session, mut seats) = formed(3, now);
        register_all(&mut session, &mut seats, now);

        // seat 0 blinds a different, absurd output than it committed to
        let destination = seats[0].wallet.fresh_destination();
        seats[0].outputs[0].0 = OutputSpec::new(destination, u64::MAX);
        let sigs = request_all(&mut session, &seats, now);
        assert_eq!(session.phase(), Phase::BlindSigningDone);

        for revealed in reveal_for(&session, &seats[0], &sigs) {
            let verdict = session.reveal(revealed, test_signer(), now).unwrap();
            assert!(matches!(verdict, Verdict::Rejected(_)));
        }
        for seat in &seats[1..] {
            for revealed in reveal_for(&session, seat, &sigs) {
                let verdict = session.reveal(revealed, test_signer(), now).unwrap();
                assert_eq!(verdict, Verdict::Accepted);
            }
        }
        assert_eq!(session.phase(), Phase::BlindSigningDone);
        assert!(session.candidate().is_none());
    }

    #[test]
    fn test_unbalanced_reveals_blame_the_cheater() {
        let now = Instant::now();
        let (mut session, mut seats) = formed(3, now);
        register_all(&mut session, &mut seats, now);

        // seat 0 committed to 0.99 but blinds and reveals a full coin
        let committed = seats[0].outputs[0].clone();
        let destination = seats[0].wallet.fresh_destination();
        seats[0].outputs[0].0 = OutputSpec::new(destination, COIN);
        let sigs = request_all(&mut session, &seats, now);
        for seat in &seats {
            for revealed in reveal_for(&session, seat, &sigs) {
                let verdict = session.reveal(revealed, test_signer(), now).unwrap();
                assert_eq!(verdict, Verdict::Accepted);
            }
        }
        assert_eq!(session.phase(), Phase::Blaming);
        assert!(session.candidate().is_none());

        let (output, nonce, factor) = committed;
        let opening = CommitmentOpening { output, nonce, factor };
        let progress = session
            .submit_blame_openings(seats[0].handle, vec![opening], test_signer(), now)
            .unwrap();
        assert_eq!(progress, Progress::Waiting);
        for seat in &seats[1..] {
            let openings = seat
                .outputs
                .iter()
                .map(|(output, nonce, factor)| CommitmentOpening {
                    output: output.clone(),
                    nonce: *nonce,
                    factor: *factor,
                })
                .collect();
            session
                .submit_blame_openings(seat.handle, openings, test_signer(), now)
                .unwrap();
        }

        assert_eq!(session.phase(), Phase::Aborted);
        let blame = session.blame().unwrap();
        assert_eq!(blame.culprits().len(), 1);
        assert!(blame.names(seats[0].handle));
        assert_eq!(blame.culprits()[0].reason, BlameReason::InvalidCommitment);
        assert!(blame.dropped.is_empty());
        assert_eq!(session.returnees().len(), 2);
    }

    #[test]
    fn test_tier_limits_bound_the_seats() {
        let now = Instant::now();
        let mut rng = thread_rng();
        let pair = TierParams {
            min_players: 2,
            max_players: 2,
            ..params()
        };
        let id = SessionId::random(&mut rng);
        let mut session = RoundSession::new(id, TierId(1), &pair, config());
        for i in 0..3u64 {
            let wallet = MemoryWallet::with_coins(&mut rng, &[COIN]);
            let join = JoinRequest {
                coins: wallet.coins(),
                desired_outputs: vec![99_000_000],
            };
            let seated = session.seat_player(PlayerId(i), join, now);
            assert_eq!(seated.is_ok(), i < 2);
        }
        session.open_registration(now).unwrap();
        assert_eq!(session.seat_count(), 2);
        assert_eq!(session.phase(), Phase::Registered);
    }
}
