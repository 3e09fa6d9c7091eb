//! The coordinator: owns the tier matcher, every live session, the global
//! coin pledge book and the ban list.
//!
//! All calls are synchronous and take the current monotonic time, so the
//! owner (the server's event loop, or a test) decides when things happen.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::blame::{BanList, BlameReason, BlameRecord};
use crate::config::FusionConfig;
use crate::crypto::{BlindSigner, CoordinatorPubKey};
use crate::error::{FusionError, Result};
use crate::session::{Phase, Progress, RequestOutcome, RoundSession, SigningOutcome, Verdict};
use crate::tier::{JoinRequest, TierMatcher, TierParams};
use crate::types::{
    BlindedOutputRequest, BlindedSignature, CandidateTransaction, CoinId, CommitmentOpening,
    InputSignature, ParticipantHandle, PlayerId, Registration, RevealedOutput, SessionId,
    SignedTransaction, TierId,
};

/// Placement of a player in a tier's queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTicket {
    pub player: PlayerId,
    pub tier: TierId,
    pub params: TierParams,
}

/// What a seated player needs to take part in a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInvite {
    pub session: SessionId,
    pub tier: TierId,
    pub handle: ParticipantHandle,
    /// Blind signing key in `0x{exponent}00{modulus}` form
    pub coordinator_key: String,
    pub fee_rate: u64,
    pub dust_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    SessionStarted {
        session: SessionId,
        tier: TierId,
        invites: Vec<(PlayerId, SessionInvite)>,
    },
    CandidateReady {
        session: SessionId,
        candidate: CandidateTransaction,
    },
    BlameRequested {
        session: SessionId,
        players: Vec<PlayerId>,
    },
    SessionAborted {
        session: SessionId,
        blame: BlameRecord,
        /// Players sent back to the matcher for a fresh session
        requeued: Vec<PlayerId>,
        /// Players that must join again themselves, if at all
        excluded: Vec<PlayerId>,
    },
    SessionCompleted {
        session: SessionId,
        transaction: SignedTransaction,
        players: Vec<PlayerId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pledge {
    session: SessionId,
    player: PlayerId,
}

pub struct Coordinator {
    config: FusionConfig,
    signer: Arc<BlindSigner>,
    matcher: TierMatcher,
    sessions: HashMap<SessionId, RoundSession>,
    observed: HashMap<SessionId, Phase>,
    /// Final phase of finished sessions, kept for `retired_retention`
    retired: HashMap<SessionId, (Phase, Instant)>,
    pledges: HashMap<CoinId, Pledge>,
    spent: HashMap<CoinId, Instant>,
    bans: BanList,
    rng: StdRng,
    events: Vec<CoordinatorEvent>,
}

impl Coordinator {
    pub fn new(config: FusionConfig, signer: Arc<BlindSigner>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            matcher: TierMatcher::new(&config),
            bans: BanList::new(config.ban_base(), config.ban_max()),
            config,
            signer,
            sessions: HashMap::new(),
            observed: HashMap::new(),
            retired: HashMap::new(),
            pledges: HashMap::new(),
            spent: HashMap::new(),
            rng: StdRng::from_entropy(),
            events: Vec::new(),
        })
    }

    /// Generates a fresh signing key of the configured size
    pub fn generate(config: FusionConfig) -> Result<Self> {
        config.validate()?;
        let signer = BlindSigner::generate(&mut rand::thread_rng(), config.rsa_modulus_bits)?;
        Self::new(config, Arc::new(signer))
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn public_key(&self) -> &CoordinatorPubKey {
        self.signer.public_key()
    }

    pub fn session_phase(&self, session: &SessionId) -> Option<Phase> {
        self.sessions
            .get(session)
            .map(RoundSession::phase)
            .or_else(|| self.retired.get(session).map(|(phase, _)| *phase))
    }

    pub fn session(&self, session: &SessionId) -> Option<&RoundSession> {
        self.sessions.get(session)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn seat_of(&self, session: &SessionId, player: PlayerId) -> Option<ParticipantHandle> {
        self.sessions.get(session)?.handle_of(player)
    }

    pub fn is_waiting(&self, player: PlayerId) -> bool {
        self.matcher.is_waiting(player)
    }

    pub fn ban_strikes(&self, player: PlayerId) -> u32 {
        self.bans.strikes(player)
    }

    fn missing(&self, session: &SessionId) -> FusionError {
        match self.retired.get(session) {
            Some((Phase::Aborted, _)) => FusionError::Aborted(*session),
            Some((phase, _)) => FusionError::WrongPhase {
                expected: Phase::SigningInProgress,
                actual: *phase,
            },
            None => FusionError::UnknownSession(*session),
        }
    }

    fn live(&self, session: &SessionId) -> Result<()> {
        if self.sessions.contains_key(session) {
            Ok(())
        } else {
            Err(self.missing(session))
        }
    }

    /// Adds a tier with its own amount range and seat limits
    pub fn open_tier(&mut self, params: TierParams) -> Result<TierId> {
        self.matcher.open_tier(params)
    }

    pub fn join_tier(
        &mut self,
        player: PlayerId,
        request: JoinRequest,
        now: Instant,
    ) -> Result<TierTicket> {
        let max_inputs = self.config.max_inputs_per_participant;
        if request.coins.is_empty() || request.coins.len() > max_inputs {
            return Err(FusionError::Malformed(format!(
                "{} coins, allowed 1..={}",
                request.coins.len(),
                max_inputs
            )));
        }
        let outputs = request.desired_outputs.len();
        if outputs == 0 || outputs > self.config.max_outputs_per_participant {
            return Err(FusionError::Malformed(format!(
                "{} outputs, allowed 1..={}",
                outputs, self.config.max_outputs_per_participant
            )));
        }
        if request.input_total().is_none() {
            return Err(FusionError::Malformed("coin amounts overflow".into()));
        }
        let coins: Vec<CoinId> = request.coins.iter().map(|c| c.id).collect();
        self.bans.check(player, &coins, now)?;
        if let Some(spent) = coins.iter().find(|c| self.spent.contains_key(c)) {
            return Err(FusionError::Conflict(*spent));
        }
        if self.sessions.values().any(|s| s.handle_of(player).is_some()) {
            return Err(FusionError::Malformed(format!("{} is already seated", player)));
        }

        let tier = self.matcher.join(player, request, now)?;
        let params = self
            .matcher
            .params(tier)
            .cloned()
            .ok_or_else(|| FusionError::Malformed(format!("tier {} closed", tier.0)))?;
        info!(player = %player, tier = tier.0, "player waiting for a session");
        Ok(TierTicket {
            player,
            tier,
            params,
        })
    }

    pub fn leave_tier(&mut self, player: PlayerId) -> bool {
        self.matcher.leave(player).is_some()
    }

    pub fn register_player(
        &mut self,
        session: SessionId,
        handle: ParticipantHandle,
        registration: Registration,
        now: Instant,
    ) -> Result<Progress> {
        self.live(&session)?;
        let round = self.sessions.get(&session).ok_or(FusionError::UnknownSession(session))?;
        let player = round.player_of(handle).ok_or(FusionError::UnknownParticipant)?;

        let coins: Vec<CoinId> = registration.coins.iter().map(|c| c.id).collect();
        self.bans.check(player, &coins, now)?;
        for coin in &coins {
            if self.spent.contains_key(coin) {
                return Err(FusionError::Conflict(*coin));
            }
            match self.pledges.get(coin) {
                Some(pledge) if pledge.session != session || pledge.player != player => {
                    warn!(coin = %coin, session = %session, "coin already pledged elsewhere");
                    return Err(FusionError::Conflict(*coin));
                }
                _ => {}
            }
        }

        let round = self.sessions.get_mut(&session).ok_or(FusionError::UnknownSession(session))?;
        let result = round.register(handle, registration, now);
        if result.is_ok() {
            for coin in coins {
                self.pledges.insert(coin, Pledge { session, player });
            }
        }
        self.settle(session, now);
        result
    }

    pub fn submit_blinded_request(
        &mut self,
        session: SessionId,
        handle: ParticipantHandle,
        request: BlindedOutputRequest,
        now: Instant,
    ) -> Result<RequestOutcome> {
        self.live(&session)?;
        let round = self.sessions.get_mut(&session).ok_or(FusionError::UnknownSession(session))?;
        let result =
            round.submit_blinded_request(handle, request, &self.signer, &mut self.rng, now);
        self.settle(session, now);
        result
    }

    /// Signatures already released to `handle`, for a participant retrying
    /// after the barrier closed
    pub fn released_signatures(
        &self,
        session: &SessionId,
        handle: ParticipantHandle,
    ) -> Result<Vec<BlindedSignature>> {
        self.live(session)?;
        Ok(self
            .sessions
            .get(session)
            .map(|s| s.signatures_for(handle))
            .unwrap_or_default())
    }

    /// Anonymous: the caller's identity is never consulted
    pub fn reveal_output(
        &mut self,
        session: SessionId,
        revealed: RevealedOutput,
        now: Instant,
    ) -> Result<Verdict> {
        self.live(&session)?;
        let signer = Arc::clone(&self.signer);
        let round = self.sessions.get_mut(&session).ok_or(FusionError::UnknownSession(session))?;
        let result = round.reveal(revealed, &signer, now);
        self.settle(session, now);
        result
    }

    pub fn candidate(&self, session: &SessionId) -> Result<CandidateTransaction> {
        self.live(session)?;
        let round = self.sessions.get(session).ok_or(FusionError::UnknownSession(*session))?;
        round.candidate().cloned().ok_or(FusionError::WrongPhase {
            expected: Phase::SigningInProgress,
            actual: round.phase(),
        })
    }

    /// Invalid signatures are rejected and abort the session with blame
    pub fn submit_input_signatures(
        &mut self,
        session: SessionId,
        handle: ParticipantHandle,
        signatures: Vec<InputSignature>,
        now: Instant,
    ) -> Result<Verdict> {
        self.live(&session)?;
        let round = self.sessions.get_mut(&session).ok_or(FusionError::UnknownSession(session))?;
        let result = round.submit_input_signatures(handle, signatures, now);
        self.settle(session, now);
        match result {
            Ok(SigningOutcome::Accepted) | Ok(SigningOutcome::Completed(_)) => {
                Ok(Verdict::Accepted)
            }
            Err(FusionError::Misbehavior(reason)) | Err(FusionError::Malformed(reason)) => {
                Ok(Verdict::Rejected(reason))
            }
            Err(err) => Err(err),
        }
    }

    pub fn submit_blame_openings(
        &mut self,
        session: SessionId,
        handle: ParticipantHandle,
        openings: Vec<CommitmentOpening>,
        now: Instant,
    ) -> Result<Progress> {
        self.live(&session)?;
        let signer = Arc::clone(&self.signer);
        let round = self.sessions.get_mut(&session).ok_or(FusionError::UnknownSession(session))?;
        let result = round.submit_blame_openings(handle, openings, &signer, now);
        self.settle(session, now);
        result
    }

    pub fn withdraw(
        &mut self,
        session: SessionId,
        handle: ParticipantHandle,
        now: Instant,
    ) -> Result<Progress> {
        self.live(&session)?;
        let round = self.sessions.get_mut(&session).ok_or(FusionError::UnknownSession(session))?;
        let player = round.player_of(handle).ok_or(FusionError::UnknownParticipant)?;
        let result = round.withdraw(handle, now);
        if round.player_of(handle).is_none() {
            self.pledges
                .retain(|_, p| !(p.session == session && p.player == player));
        }
        self.settle(session, now);
        result
    }

    /// Applies deadlines, then seats every tier that is ready. Returns
    /// everything that happened since the last drain.
    pub fn tick(&mut self, now: Instant) -> Vec<CoordinatorEvent> {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            if let Some(round) = self.sessions.get_mut(&id) {
                if round.on_deadline(now) != Progress::Waiting {
                    self.settle(id, now);
                }
            }
        }

        for formation in self.matcher.form(now) {
            self.start_session(formation.tier, formation.members, now);
        }
        self.bans.prune(now);
        self.prune_retired(now);
        self.take_events()
    }

    fn prune_retired(&mut self, now: Instant) {
        let retention = self.config.retired_retention();
        let keep = |at: &Instant| now.saturating_duration_since(*at) < retention;
        self.retired.retain(|_, (_, at)| keep(at));
        self.spent.retain(|_, at| keep(at));
    }

    pub fn take_events(&mut self) -> Vec<CoordinatorEvent> {
        std::mem::take(&mut self.events)
    }

    fn fresh_session_id(&mut self) -> SessionId {
        loop {
            let id = SessionId::random(&mut self.rng);
            if !self.sessions.contains_key(&id) && !self.retired.contains_key(&id) {
                return id;
            }
        }
    }

    fn start_session(
        &mut self,
        tier: TierId,
        members: Vec<(PlayerId, JoinRequest, Instant)>,
        now: Instant,
    ) {
        let id = self.fresh_session_id();
        let Some(params) = self.matcher.params(tier).cloned() else {
            warn!(tier = tier.0, "tier closed before its session formed");
            return;
        };
        let mut round = RoundSession::new(id, tier, &params, self.config.clone());
        let coordinator_key = self.signer.public_key().to_hex_string();

        let mut invites = Vec::with_capacity(members.len());
        for (player, request, joined_at) in members {
            match round.seat_player(player, request, joined_at) {
                Ok(handle) => invites.push((
                    player,
                    SessionInvite {
                        session: id,
                        tier,
                        handle,
                        coordinator_key: coordinator_key.clone(),
                        fee_rate: self.config.fee_rate,
                        dust_limit: self.config.dust_limit,
                    },
                )),
                Err(err) => warn!(player = %player, %err, "could not seat player"),
            }
        }

        if let Err(err) = round.open_registration(now) {
            warn!(session = %id, %err, "session could not open, returning players");
            for (_, seat) in round.participant_records() {
                if let Some(joined_at) = seat.joined_at {
                    self.matcher
                        .requeue(tier, seat.player, seat.join.clone(), joined_at, now);
                }
            }
            self.retired.insert(id, (Phase::Aborted, now));
            return;
        }

        info!(session = %id, tier = tier.0, players = invites.len(), "session started");
        self.observed.insert(id, round.phase());
        self.sessions.insert(id, round);
        self.events.push(CoordinatorEvent::SessionStarted {
            session: id,
            tier,
            invites,
        });
    }

    /// Emits events for a phase change and retires finished sessions
    fn settle(&mut self, id: SessionId, now: Instant) {
        let Some(round) = self.sessions.get(&id) else {
            return;
        };
        let phase = round.phase();
        if self.observed.insert(id, phase) == Some(phase) {
            return;
        }
        debug!(session = %id, ?phase, "session advanced");

        match phase {
            Phase::SigningInProgress => {
                if let Some(candidate) = round.candidate() {
                    self.events.push(CoordinatorEvent::CandidateReady {
                        session: id,
                        candidate: candidate.clone(),
                    });
                }
            }
            Phase::Blaming => {
                let players = round.participant_records().map(|(_, s)| s.player).collect();
                self.events.push(CoordinatorEvent::BlameRequested {
                    session: id,
                    players,
                });
            }
            Phase::Broadcast | Phase::Aborted => self.finish_session(id, now),
            _ => {}
        }
    }

    fn finish_session(&mut self, id: SessionId, now: Instant) {
        let Some(round) = self.sessions.remove(&id) else {
            return;
        };
        self.observed.remove(&id);
        self.retired.insert(id, (round.phase(), now));
        self.pledges.retain(|_, p| p.session != id);
        let players: Vec<PlayerId> = round.participant_records().map(|(_, s)| s.player).collect();

        if let Some(signed) = round.signed_transaction() {
            for coin in &signed.tx.inputs {
                self.spent.insert(coin.id, now);
            }
            self.events.push(CoordinatorEvent::SessionCompleted {
                session: id,
                transaction: signed.clone(),
                players,
            });
            return;
        }

        let blame = round.blame().cloned().unwrap_or_else(|| {
            BlameRecord::unattributed(id, round.phase(), BlameReason::MissedDeadline)
        });
        for culprit in blame.culprits() {
            let coins = round.coins_of(culprit.player);
            self.bans.penalize(culprit.player, &coins, now);
        }

        let mut requeued = Vec::new();
        for returnee in round.returnees() {
            requeued.push(returnee.player);
            self.matcher
                .requeue(round.tier(), returnee.player, returnee.join, returnee.joined_at, now);
        }
        let excluded = players
            .into_iter()
            .filter(|p| !requeued.contains(p))
            .collect();
        info!(session = %id, requeued = requeued.len(), "session retired after abort");
        self.events.push(CoordinatorEvent::SessionAborted {
            session: id,
            blame,
            requeued,
            excluded,
        });
    }
}
