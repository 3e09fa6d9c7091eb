//! Participant driver: runs the participant state machine against a
//! coordinator transport until a transaction is broadcast.

use alloy::primitives::B256;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::FusionConfig;
use crate::coordinator::{SessionInvite, TierTicket};
use crate::error::{FusionError, Result};
use crate::participant::{Participant, Review};
use crate::server::{CandidateStatus, CoordinatorHandle, Notice};
use crate::session::{Progress, Verdict};
use crate::tier::JoinRequest;
use crate::types::{
    BlindedOutputRequest, BlindedSignature, CommitmentOpening, InputSignature, ParticipantHandle,
    PlayerId, Registration, RevealedOutput, SessionId,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Worth retrying: the message may not have arrived
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error(transparent)]
    Rejected(FusionError),
}

impl From<FusionError> for TransportError {
    fn from(err: FusionError) -> Self {
        if err.is_transient() {
            TransportError::Transient(err.to_string())
        } else {
            TransportError::Rejected(err)
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Message-oriented link from one participant to the coordinator.
/// `reveal` must not carry the participant's identity.
#[async_trait]
pub trait CoordinatorTransport: Send + Sync {
    async fn join_tier(&self, request: JoinRequest) -> TransportResult<TierTicket>;

    async fn next_notice(&self) -> TransportResult<Notice>;

    async fn register(
        &self,
        session: SessionId,
        handle: ParticipantHandle,
        registration: Registration,
    ) -> TransportResult<Progress>;

    async fn blind_sign(
        &self,
        session: SessionId,
        handle: ParticipantHandle,
        requests: Vec<BlindedOutputRequest>,
    ) -> TransportResult<Vec<BlindedSignature>>;

    async fn reveal(
        &self,
        session: SessionId,
        revealed: RevealedOutput,
    ) -> TransportResult<Verdict>;

    async fn await_candidate(&self, session: SessionId) -> TransportResult<CandidateStatus>;

    async fn sign_inputs(
        &self,
        session: SessionId,
        handle: ParticipantHandle,
        signatures: Vec<InputSignature>,
    ) -> TransportResult<Verdict>;

    async fn open_commitments(
        &self,
        session: SessionId,
        handle: ParticipantHandle,
        openings: Vec<CommitmentOpening>,
    ) -> TransportResult<Progress>;

    async fn withdraw(
        &self,
        session: SessionId,
        handle: ParticipantHandle,
    ) -> TransportResult<Progress>;
}

/// In-process transport over a [`CoordinatorHandle`]
pub struct LocalTransport {
    coordinator: CoordinatorHandle,
    player: PlayerId,
    notices: Mutex<mpsc::UnboundedReceiver<Notice>>,
}

impl LocalTransport {
    pub async fn connect(coordinator: CoordinatorHandle) -> Result<Self> {
        let (player, notices) = coordinator.connect().await?;
        Ok(Self {
            coordinator,
            player,
            notices: Mutex::new(notices),
        })
    }

    pub fn player(&self) -> PlayerId {
        self.player
    }
}

#[async_trait]
impl CoordinatorTransport for LocalTransport {
    async fn join_tier(&self, request: JoinRequest) -> TransportResult<TierTicket> {
        Ok(self.coordinator.join_tier(self.player, request).await?)
    }

    async fn next_notice(&self) -> TransportResult<Notice> {
        let closed = || FusionError::Transport("coordinator closed the connection".into());
        let notice = self.notices.lock().await.recv().await;
        notice.ok_or_else(|| TransportError::Rejected(closed()))
    }

    async fn register(
        &self,
        session: SessionId,
        handle: ParticipantHandle,
        registration: Registration,
    ) -> TransportResult<Progress> {
        Ok(self
            .coordinator
            .register(self.player, session, handle, registration)
            .await?)
    }

    async fn blind_sign(
        &self,
        session: SessionId,
        handle: ParticipantHandle,
        requests: Vec<BlindedOutputRequest>,
    ) -> TransportResult<Vec<BlindedSignature>> {
        Ok(self
            .coordinator
            .blind_sign(self.player, session, handle, requests)
            .await?)
    }

    async fn reveal(
        &self,
        session: SessionId,
        revealed: RevealedOutput,
    ) -> TransportResult<Verdict> {
        Ok(self.coordinator.reveal(session, revealed).await?)
    }

    async fn await_candidate(&self, session: SessionId) -> TransportResult<CandidateStatus> {
        Ok(self.coordinator.await_candidate(session).await?)
    }

    async fn sign_inputs(
        &self,
        session: SessionId,
        handle: ParticipantHandle,
        signatures: Vec<InputSignature>,
    ) -> TransportResult<Verdict> {
        Ok(self
            .coordinator
            .sign_inputs(self.player, session, handle, signatures)
            .await?)
    }

    async fn open_commitments(
        &self,
        session: SessionId,
        handle: ParticipantHandle,
        openings: Vec<CommitmentOpening>,
    ) -> TransportResult<Progress> {
        Ok(self
            .coordinator
            .open_commitments(self.player, session, handle, openings)
            .await?)
    }

    async fn withdraw(
        &self,
        session: SessionId,
        handle: ParticipantHandle,
    ) -> TransportResult<Progress> {
        Ok(self
            .coordinator
            .withdraw(self.player, session, handle)
            .await?)
    }
}

pub struct FusionClient<T> {
    transport: T,
    participant: Participant,
    retries: u32,
    retry_delay: Duration,
    max_sessions: usize,
}

impl<T: CoordinatorTransport> FusionClient<T> {
    pub fn new(transport: T, participant: Participant, config: &FusionConfig) -> Self {
        Self {
            transport,
            participant,
            retries: config.transport_retries,
            retry_delay: config.transport_retry_delay(),
            max_sessions: 8,
        }
    }

    /// Gives up after taking part in this many sessions
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Calls `op` until it succeeds, is rejected, or transient failures
    /// exhaust the retry budget
    async fn retry<R, F, Fut>(&self, what: &str, op: F) -> Result<R>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = TransportResult<R>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(TransportError::Transient(reason)) if attempt < self.retries => {
                    attempt += 1;
                    warn!(what, attempt, %reason, "transient failure, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(TransportError::Transient(reason)) => {
                    return Err(FusionError::Transport(reason));
                }
                Err(TransportError::Rejected(err)) => return Err(err),
            }
        }
    }

    async fn join(&self) -> Result<TierTicket> {
        let transport = &self.transport;
        let request = self.participant.join_request();
        let ticket = self
            .retry("join tier", move || transport.join_tier(request.clone()))
            .await?;
        info!(tier = ticket.tier.0, "joined tier");
        Ok(ticket)
    }

    /// Mixes until a transaction containing our outputs is broadcast.
    /// Returns its id.
    pub async fn run(&mut self) -> Result<B256> {
        self.join().await?;
        let mut sessions = 0;
        loop {
            let transport = &self.transport;
            let notice = self.retry("next notice", move || transport.next_notice()).await?;
            match notice {
                Notice::SessionStarted(invite) => {
                    sessions += 1;
                    if sessions > self.max_sessions {
                        return Err(FusionError::Aborted(invite.session));
                    }
                    if let Err(err) = self.run_session(&invite).await {
                        match err {
                            FusionError::Aborted(_)
                            | FusionError::Timeout(_)
                            | FusionError::WrongPhase { .. } => {
                                debug!(session = %invite.session, %err, "round ended early");
                            }
                            err => {
                                warn!(session = %invite.session, %err, "leaving the session");
                                let transport = &self.transport;
                                let _ = transport.withdraw(invite.session, invite.handle).await;
                                return Err(err);
                            }
                        }
                    }
                }
                Notice::SessionCompleted { session, txid } => {
                    if self.participant.session() == Some(session) {
                        info!(session = %session, txid = %txid, "mix complete");
                        return Ok(txid);
                    }
                }
                Notice::SessionAborted {
                    session, requeued, ..
                } => {
                    if self.participant.session() != Some(session) {
                        continue;
                    }
                    self.participant.reset();
                    if requeued {
                        info!(session = %session, "session aborted, waiting for the next one");
                    } else {
                        info!(session = %session, "session aborted, joining again");
                        self.join().await?;
                    }
                }
            }
        }
    }

    async fn run_session(&mut self, invite: &SessionInvite) -> Result<()> {
        let session = invite.session;
        let handle = invite.handle;
        let registration = {
            let mut rng = rand::thread_rng();
            self.participant.commit_inputs(invite, &mut rng)?
        };

        let transport = &self.transport;
        self.retry("register", move || {
            transport.register(session, handle, registration.clone())
        })
        .await?;

        let requests = self.participant.request_blind_signatures()?;
        let signatures = self
            .retry("blind sign", move || {
                transport.blind_sign(session, handle, requests.clone())
            })
            .await?;
        self.participant.unblind(&signatures)?;

        let transport = &self.transport;
        for revealed in self.participant.reveal()? {
            let verdict = self
                .retry("reveal", move || transport.reveal(session, revealed.clone()))
                .await?;
            if let Verdict::Rejected(reason) = verdict {
                warn!(session = %session, %reason, "reveal rejected");
            }
        }

        let status = self
            .retry("await candidate", move || transport.await_candidate(session))
            .await?;
        match status {
            CandidateStatus::Ready(candidate) => {
                if let Review::Reject(reason) = self.participant.review_transaction(&candidate) {
                    return Err(FusionError::Misbehavior(reason));
                }
                let signatures = self.participant.sign_inputs()?;
                let transport = &self.transport;
                let verdict = self
                    .retry("sign inputs", move || {
                        transport.sign_inputs(session, handle, signatures.clone())
                    })
                    .await?;
                if let Verdict::Rejected(reason) = verdict {
                    return Err(FusionError::Malformed(reason));
                }
            }
            CandidateStatus::BlameRequested => {
                let openings = self.participant.blame_openings()?;
                let transport = &self.transport;
                self.retry("open commitments", move || {
                    transport.open_commitments(session, handle, openings.clone())
                })
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::wallet::MemoryWallet;

    /// Fails `join_tier` transiently a fixed number of times
    struct FlakyTransport {
        failures: u32,
        calls: AtomicU32,
        rejection: Option<FusionError>,
    }

    fn unused<T>() -> TransportResult<T> {
        Err(TransportError::Rejected(FusionError::Malformed("unused".into())))
    }

    #[async_trait]
    impl CoordinatorTransport for FlakyTransport {
        async fn join_tier(&self, _request: JoinRequest) -> TransportResult<TierTicket> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = &self.rejection {
                return Err(err.clone().into());
            }
            if call < self.failures {
                return Err(TransportError::Transient("connection reset".into()));
            }
            Ok(TierTicket {
                player: PlayerId(1),
                tier: crate::types::TierId(0),
                params: crate::tier::TierParams {
                    min_amount: 0,
                    max_amount: None,
                    min_players: 3,
                    max_players: 5,
                },
            })
        }

        async fn next_notice(&self) -> TransportResult<Notice> {
            unused()
        }

        async fn register(
            &self,
            _: SessionId,
            _: ParticipantHandle,
            _: Registration,
        ) -> TransportResult<Progress> {
            unused()
        }

        async fn blind_sign(
            &self,
            _: SessionId,
            _: ParticipantHandle,
            _: Vec<BlindedOutputRequest>,
        ) -> TransportResult<Vec<BlindedSignature>> {
            unused()
        }

        async fn reveal(&self, _: SessionId, _: RevealedOutput) -> TransportResult<Verdict> {
            unused()
        }

        async fn await_candidate(&self, _: SessionId) -> TransportResult<CandidateStatus> {
            unused()
        }

        async fn sign_inputs(
            &self,
            _: SessionId,
            _: ParticipantHandle,
            _: Vec<InputSignature>,
        ) -> TransportResult<Verdict> {
            unused()
        }

        async fn open_commitments(
            &self,
            _: SessionId,
            _: ParticipantHandle,
            _: Vec<CommitmentOpening>,
        ) -> TransportResult<Progress> {
            unused()
        }

        async fn withdraw(&self, _: SessionId, _: ParticipantHandle) -> TransportResult<Progress> {
            unused()
        }
    }

    fn client(failures: u32, rejection: Option<FusionError>) -> FusionClient<FlakyTransport> {
        let config = FusionConfig {
            transport_retries: 2,
            transport_retry_delay_ms: 1,
            ..FusionConfig::default()
        };
        let wallet = MemoryWallet::with_coins(&mut rand::thread_rng(), &[100_000_000]);
        let participant = Participant::consolidating(Arc::new(wallet), config.fee_rate);
        let transport = FlakyTransport {
            failures,
            calls: AtomicU32::new(0),
            rejection,
        };
        FusionClient::new(transport, participant, &config)
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let client = client(2, None);
        let ticket = client.join().await.unwrap();
        assert_eq!(ticket.tier.0, 0);
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let client = client(10, None);
        let err = client.join().await.unwrap_err();
        assert!(matches!(err, FusionError::Transport(_)));
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let client = client(0, Some(FusionError::Banned { remaining_secs: 60 }));
        let err = client.join().await.unwrap_err();
        assert_eq!(err, FusionError::Banned { remaining_secs: 60 });
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            TransportError::from(FusionError::Transport("eof".into())),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            TransportError::from(FusionError::Misbehavior("bad".into())),
            TransportError::Rejected(_)
        ));
    }
}
