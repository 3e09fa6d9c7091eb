//! Async front of the coordinator.
//!
//! One task owns the [`Coordinator`] and applies every command and deadline
//! in arrival order. Connections talk to it through a [`CoordinatorHandle`]
//! and get answers on oneshot channels. Answers that depend on a barrier
//! (blind signatures, the candidate) are parked until the barrier resolves
//! or the session aborts.

use alloy::primitives::B256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::blame::BlameRecord;
use crate::coordinator::{Coordinator, CoordinatorEvent, SessionInvite, TierTicket};
use crate::error::{FusionError, Result};
use crate::participant::Broadcaster;
use crate::session::{Phase, Progress, RequestOutcome, Verdict};
use crate::tier::JoinRequest;
use crate::types::{
    BlindedOutputRequest, BlindedSignature, CandidateTransaction, CommitmentOpening,
    InputSignature, ParticipantHandle, PlayerId, Registration, RevealedOutput, SessionId,
};

const COMMAND_BUFFER: usize = 256;

/// Pushed to a connected player outside of any request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    SessionStarted(SessionInvite),
    SessionAborted {
        session: SessionId,
        /// Whether the player is already back in the tier queue
        requeued: bool,
        blame: BlameRecord,
    },
    SessionCompleted {
        session: SessionId,
        txid: B256,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateStatus {
    Ready(CandidateTransaction),
    BlameRequested,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Connect {
        reply: Reply<(PlayerId, mpsc::UnboundedReceiver<Notice>)>,
    },
    JoinTier {
        player: PlayerId,
        request: JoinRequest,
        reply: Reply<TierTicket>,
    },
    LeaveTier {
        player: PlayerId,
        reply: Reply<bool>,
    },
    Register {
        player: PlayerId,
        session: SessionId,
        handle: ParticipantHandle,
        registration: Registration,
        reply: Reply<Progress>,
    },
    BlindSign {
        player: PlayerId,
        session: SessionId,
        handle: ParticipantHandle,
        requests: Vec<BlindedOutputRequest>,
        reply: Reply<Vec<BlindedSignature>>,
    },
    Reveal {
        session: SessionId,
        revealed: RevealedOutput,
        reply: Reply<Verdict>,
    },
    AwaitCandidate {
        session: SessionId,
        reply: Reply<CandidateStatus>,
    },
    SignInputs {
        player: PlayerId,
        session: SessionId,
        handle: ParticipantHandle,
        signatures: Vec<InputSignature>,
        reply: Reply<Verdict>,
    },
    OpenCommitments {
        player: PlayerId,
        session: SessionId,
        handle: ParticipantHandle,
        openings: Vec<CommitmentOpening>,
        reply: Reply<Progress>,
    },
    Withdraw {
        player: PlayerId,
        session: SessionId,
        handle: ParticipantHandle,
        reply: Reply<Progress>,
    },
    Shutdown,
}

/// Cloneable entry point to the coordinator task
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| FusionError::Transport("coordinator stopped".into()))?;
        answer
            .await
            .map_err(|_| FusionError::Transport("coordinator dropped the request".into()))?
    }

    /// Opens a connection. Notices for the returned player arrive on the
    /// receiver.
    pub async fn connect(&self) -> Result<(PlayerId, mpsc::UnboundedReceiver<Notice>)> {
        self.call(|reply| Command::Connect { reply }).await
    }

    pub async fn join_tier(&self, player: PlayerId, request: JoinRequest) -> Result<TierTicket> {
        self.call(|reply| Command::JoinTier {
            player,
            request,
            reply,
        })
        .await
    }

    pub async fn leave_tier(&self, player: PlayerId) -> Result<bool> {
        self.call(|reply| Command::LeaveTier { player, reply }).await
    }

    pub async fn register(
        &self,
        player: PlayerId,
        session: SessionId,
        handle: ParticipantHandle,
        registration: Registration,
    ) -> Result<Progress> {
        self.call(|reply| Command::Register {
            player,
            session,
            handle,
            registration,
            reply,
        })
        .await
    }

    /// Resolves once every seat has submitted its requests
    pub async fn blind_sign(
        &self,
        player: PlayerId,
        session: SessionId,
        handle: ParticipantHandle,
        requests: Vec<BlindedOutputRequest>,
    ) -> Result<Vec<BlindedSignature>> {
        self.call(|reply| Command::BlindSign {
            player,
            session,
            handle,
            requests,
            reply,
        })
        .await
    }

    pub async fn reveal(&self, session: SessionId, revealed: RevealedOutput) -> Result<Verdict> {
        self.call(|reply| Command::Reveal {
            session,
            revealed,
            reply,
        })
        .await
    }

    /// Resolves once the candidate is published or blame is requested
    pub async fn await_candidate(&self, session: SessionId) -> Result<CandidateStatus> {
        self.call(|reply| Command::AwaitCandidate { session, reply })
            .await
    }

    pub async fn sign_inputs(
        &self,
        player: PlayerId,
        session: SessionId,
        handle: ParticipantHandle,
        signatures: Vec<InputSignature>,
    ) -> Result<Verdict> {
        self.call(|reply| Command::SignInputs {
            player,
            session,
            handle,
            signatures,
            reply,
        })
        .await
    }

    pub async fn open_commitments(
        &self,
        player: PlayerId,
        session: SessionId,
        handle: ParticipantHandle,
        openings: Vec<CommitmentOpening>,
    ) -> Result<Progress> {
        self.call(|reply| Command::OpenCommitments {
            player,
            session,
            handle,
            openings,
            reply,
        })
        .await
    }

    pub async fn withdraw(
        &self,
        player: PlayerId,
        session: SessionId,
        handle: ParticipantHandle,
    ) -> Result<Progress> {
        self.call(|reply| Command::Withdraw {
            player,
            session,
            handle,
            reply,
        })
        .await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

pub struct CoordinatorServer {
    coordinator: Coordinator,
    broadcaster: Arc<dyn Broadcaster>,
    commands: mpsc::Receiver<Command>,
    players: HashMap<PlayerId, mpsc::UnboundedSender<Notice>>,
    next_player: u64,
    parked_signatures: HashMap<(SessionId, ParticipantHandle), Reply<Vec<BlindedSignature>>>,
    parked_candidates: HashMap<SessionId, Vec<Reply<CandidateStatus>>>,
}

/// Starts the coordinator task
pub fn spawn(
    coordinator: Coordinator,
    broadcaster: Arc<dyn Broadcaster>,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (sender, commands) = mpsc::channel(COMMAND_BUFFER);
    let server = CoordinatorServer {
        coordinator,
        broadcaster,
        commands,
        players: HashMap::new(),
        next_player: 0,
        parked_signatures: HashMap::new(),
        parked_candidates: HashMap::new(),
    };
    let task = tokio::spawn(server.run());
    (CoordinatorHandle { commands: sender }, task)
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl CoordinatorServer {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.coordinator.config().tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            key = %self.coordinator.public_key().to_hex_string().get(..18).unwrap_or_default(),
            "coordinator loop started"
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle(command),
                },
                _ = ticker.tick() => {
                    let events = self.coordinator.tick(now());
                    self.dispatch(events);
                }
            }
        }

        for (_, reply) in self.parked_signatures.drain() {
            let _ = reply.send(Err(FusionError::Transport("coordinator stopped".into())));
        }
        for (_, replies) in self.parked_candidates.drain() {
            for reply in replies {
                let _ = reply.send(Err(FusionError::Transport("coordinator stopped".into())));
            }
        }
        info!("coordinator loop stopped");
    }

    /// Only the player seated at `handle` may speak for it
    fn authorize(
        &self,
        session: &SessionId,
        player: PlayerId,
        handle: ParticipantHandle,
    ) -> Result<()> {
        match self.coordinator.session(session) {
            Some(_) if self.coordinator.seat_of(session, player) == Some(handle) => Ok(()),
            Some(_) => Err(FusionError::UnknownParticipant),
            // the coordinator reports retired or unknown sessions itself
            None => Ok(()),
        }
    }

    fn handle(&mut self, command: Command) {
        let now = now();
        match command {
            Command::Connect { reply } => {
                let player = PlayerId(self.next_player);
                self.next_player += 1;
                let (sender, receiver) = mpsc::unbounded_channel();
                self.players.insert(player, sender);
                debug!(player = %player, "player connected");
                let _ = reply.send(Ok((player, receiver)));
            }
            Command::JoinTier {
                player,
                request,
                reply,
            } => {
                let _ = reply.send(self.coordinator.join_tier(player, request, now));
            }
            Command::LeaveTier { player, reply } => {
                let _ = reply.send(Ok(self.coordinator.leave_tier(player)));
            }
            Command::Register {
                player,
                session,
                handle,
                registration,
                reply,
            } => {
                let result = self.authorize(&session, player, handle).and_then(|_| {
                    self.coordinator
                        .register_player(session, handle, registration, now)
                });
                let _ = reply.send(result);
            }
            Command::BlindSign {
                player,
                session,
                handle,
                requests,
                reply,
            } => {
                let result = self
                    .authorize(&session, player, handle)
                    .and_then(|_| self.submit_requests(session, handle, requests, now));
                match result {
                    Ok(Some(signatures)) => {
                        let _ = reply.send(Ok(signatures));
                    }
                    Ok(None) => {
                        self.parked_signatures.insert((session, handle), reply);
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::Reveal {
                session,
                revealed,
                reply,
            } => {
                let _ = reply.send(self.coordinator.reveal_output(session, revealed, now));
            }
            Command::AwaitCandidate { session, reply } => {
                match self.coordinator.session_phase(&session) {
                    Some(Phase::Blaming) => {
                        let _ = reply.send(Ok(CandidateStatus::BlameRequested));
                    }
                    Some(phase) if !phase.is_terminal() && phase != Phase::SigningInProgress => {
                        self.parked_candidates.entry(session).or_default().push(reply);
                    }
                    _ => {
                        let candidate = self.coordinator.candidate(&session);
                        let _ = reply.send(candidate.map(CandidateStatus::Ready));
                    }
                }
            }
            Command::SignInputs {
                player,
                session,
                handle,
                signatures,
                reply,
            } => {
                let result = self.authorize(&session, player, handle).and_then(|_| {
                    self.coordinator
                        .submit_input_signatures(session, handle, signatures, now)
                });
                let _ = reply.send(result);
            }
            Command::OpenCommitments {
                player,
                session,
                handle,
                openings,
                reply,
            } => {
                let result = self.authorize(&session, player, handle).and_then(|_| {
                    self.coordinator
                        .submit_blame_openings(session, handle, openings, now)
                });
                let _ = reply.send(result);
            }
            Command::Withdraw {
                player,
                session,
                handle,
                reply,
            } => {
                let result = self
                    .authorize(&session, player, handle)
                    .and_then(|_| self.coordinator.withdraw(session, handle, now));
                let _ = reply.send(result);
            }
            Command::Shutdown => {}
        }

        let events = self.coordinator.take_events();
        self.dispatch(events);
    }

    /// `Some` once the barrier closed, either by this call or earlier
    fn submit_requests(
        &mut self,
        session: SessionId,
        handle: ParticipantHandle,
        requests: Vec<BlindedOutputRequest>,
        now: Instant,
    ) -> Result<Option<Vec<BlindedSignature>>> {
        if self.coordinator.session_phase(&session) == Some(Phase::BlindSigningDone) {
            return self
                .coordinator
                .released_signatures(&session, handle)
                .map(Some);
        }
        let mut mine = None;
        for request in requests {
            if let RequestOutcome::Released(batch) =
                self.coordinator
                    .submit_blinded_request(session, handle, request, now)?
            {
                mine = Some(self.release(session, handle, batch));
            }
        }
        Ok(mine)
    }

    /// Answers every parked seat from a released batch and returns the
    /// caller's share
    fn release(
        &mut self,
        session: SessionId,
        caller: ParticipantHandle,
        batch: Vec<(ParticipantHandle, BlindedSignature)>,
    ) -> Vec<BlindedSignature> {
        let mut per_seat: HashMap<ParticipantHandle, Vec<BlindedSignature>> = HashMap::new();
        for (handle, signature) in batch {
            per_seat.entry(handle).or_default().push(signature);
        }
        let mine = per_seat.remove(&caller).unwrap_or_default();
        for (handle, signatures) in per_seat {
            if let Some(reply) = self.parked_signatures.remove(&(session, handle)) {
                let _ = reply.send(Ok(signatures));
            }
        }
        mine
    }

    fn notify(&mut self, player: PlayerId, notice: Notice) {
        if let Some(sender) = self.players.get(&player) {
            if sender.send(notice).is_err() {
                debug!(player = %player, "player disconnected");
                self.players.remove(&player);
            }
        }
    }

    fn fail_parked(&mut self, session: SessionId, err: FusionError) {
        let keys: Vec<_> = self
            .parked_signatures
            .keys()
            .filter(|(s, _)| *s == session)
            .copied()
            .collect();
        for key in keys {
            if let Some(reply) = self.parked_signatures.remove(&key) {
                let _ = reply.send(Err(err.clone()));
            }
        }
        for reply in self.parked_candidates.remove(&session).unwrap_or_default() {
            let _ = reply.send(Err(err.clone()));
        }
    }

    fn dispatch(&mut self, events: Vec<CoordinatorEvent>) {
        for event in events {
            match event {
                CoordinatorEvent::SessionStarted { invites, .. } => {
                    for (player, invite) in invites {
                        self.notify(player, Notice::SessionStarted(invite));
                    }
                }
                CoordinatorEvent::CandidateReady { session, candidate } => {
                    for reply in self.parked_candidates.remove(&session).unwrap_or_default() {
                        let _ = reply.send(Ok(CandidateStatus::Ready(candidate.clone())));
                    }
                }
                CoordinatorEvent::BlameRequested { session, .. } => {
                    for reply in self.parked_candidates.remove(&session).unwrap_or_default() {
                        let _ = reply.send(Ok(CandidateStatus::BlameRequested));
                    }
                }
                CoordinatorEvent::SessionAborted {
                    session,
                    blame,
                    requeued,
                    excluded,
                } => {
                    self.fail_parked(session, FusionError::Aborted(session));
                    for (players, back) in [(requeued, true), (excluded, false)] {
                        for player in players {
                            self.notify(
                                player,
                                Notice::SessionAborted {
                                    session,
                                    requeued: back,
                                    blame: blame.clone(),
                                },
                            );
                        }
                    }
                }
                CoordinatorEvent::SessionCompleted {
                    session,
                    transaction,
                    players,
                } => {
                    self.fail_parked(session, FusionError::WrongPhase {
                        expected: Phase::SigningInProgress,
                        actual: Phase::Broadcast,
                    });
                    let txid = transaction.txid();
                    match self.broadcaster.broadcast(&transaction) {
                        Ok(_) => info!(session = %session, txid = %txid, "transaction broadcast"),
                        Err(err) => warn!(session = %session, %err, "broadcast failed"),
                    }
                    for player in players {
                        self.notify(player, Notice::SessionCompleted { session, txid });
                    }
                }
            }
        }
    }
}
