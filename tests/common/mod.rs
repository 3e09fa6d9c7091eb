#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use alloy::primitives::B256;
use blind_fusion::{
    BlindSigner, Broadcaster, Coordinator, CoordinatorEvent, FusionConfig, MemoryWallet,
    Participant, PlayerId, RequestOutcome, Review, SessionId, SessionInvite, SignedTransaction,
    Verdict,
};
use tracing_subscriber::EnvFilter;

pub const COIN: u64 = 100_000_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn signer() -> Arc<BlindSigner> {
    static SIGNER: OnceLock<Arc<BlindSigner>> = OnceLock::new();
    SIGNER
        .get_or_init(|| {
            let signer =
                BlindSigner::generate(&mut rand::thread_rng(), 2048).expect("generate key");
            Arc::new(signer)
        })
        .clone()
}

pub fn config(min_players: usize, max_players: usize) -> FusionConfig {
    FusionConfig {
        min_players,
        max_players,
        wait_window_ms: 1_000,
        ..FusionConfig::default()
    }
}

pub fn wallet(amounts: &[u64]) -> Arc<MemoryWallet> {
    Arc::new(MemoryWallet::with_coins(&mut rand::thread_rng(), amounts))
}

#[derive(Default)]
pub struct RecordingBroadcaster {
    pub sent: Mutex<Vec<SignedTransaction>>,
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, tx: &SignedTransaction) -> blind_fusion::Result<B256> {
        self.sent.lock().expect("broadcaster lock").push(tx.clone());
        Ok(tx.txid())
    }
}

/// Drives a synchronous coordinator and a set of participants on a manual
/// clock
pub struct Table {
    pub coordinator: Coordinator,
    pub players: HashMap<PlayerId, Participant>,
    pub now: Instant,
    next_player: u64,
}

impl Table {
    pub fn new(config: FusionConfig) -> Self {
        init_tracing();
        Self {
            coordinator: Coordinator::new(config, signer()).expect("coordinator"),
            players: HashMap::new(),
            now: Instant::now(),
            next_player: 0,
        }
    }

    pub fn advance(&mut self, millis: u64) {
        self.now += Duration::from_millis(millis);
    }

    /// Joins a player that consolidates a fresh wallet holding `amounts`
    pub fn join(&mut self, amounts: &[u64]) -> PlayerId {
        let fee_rate = self.coordinator.config().fee_rate;
        let participant = Participant::consolidating(wallet(amounts), fee_rate);
        self.join_with(participant)
    }

    pub fn join_with(&mut self, participant: Participant) -> PlayerId {
        let player = PlayerId(self.next_player);
        self.next_player += 1;
        self.coordinator
            .join_tier(player, participant.join_request(), self.now)
            .expect("join tier");
        self.players.insert(player, participant);
        player
    }

    pub fn tick(&mut self) -> Vec<CoordinatorEvent> {
        self.coordinator.tick(self.now)
    }

    pub fn register(
        &mut self,
        player: PlayerId,
        invite: &SessionInvite,
    ) -> blind_fusion::Result<()> {
        let participant = self.players.get_mut(&player).expect("known player");
        let registration = participant.commit_inputs(invite, &mut rand::thread_rng())?;
        self.coordinator
            .register_player(invite.session, invite.handle, registration, self.now)?;
        Ok(())
    }

    pub fn register_all(&mut self, invites: &[(PlayerId, SessionInvite)]) {
        for (player, invite) in invites {
            self.register(*player, invite).expect("registration");
        }
    }

    /// Submits every seat's blinded requests, then hands each participant
    /// its released signatures
    pub fn blind_sign_all(&mut self, invites: &[(PlayerId, SessionInvite)]) {
        let mut released = false;
        for (player, invite) in invites {
            let requests = self.players[player].request_blind_signatures().expect("requests");
            for request in requests {
                let outcome = self
                    .coordinator
                    .submit_blinded_request(invite.session, invite.handle, request, self.now)
                    .expect("blinded request");
                released |= matches!(outcome, RequestOutcome::Released(_));
            }
        }
        assert!(released, "barrier should release once every seat submitted");

        for (player, invite) in invites {
            let signatures = self
                .coordinator
                .released_signatures(&invite.session, invite.handle)
                .expect("released signatures");
            self.players
                .get_mut(player)
                .expect("known player")
                .unblind(&signatures)
                .expect("unblind");
        }
    }

    pub fn reveal(&mut self, player: PlayerId, session: SessionId) {
        for revealed in self.players[&player].reveal().expect("reveal") {
            let verdict = self
                .coordinator
                .reveal_output(session, revealed, self.now)
                .expect("reveal accepted");
            assert_eq!(verdict, Verdict::Accepted);
        }
    }

    pub fn review_and_sign_all(&mut self, invites: &[(PlayerId, SessionInvite)]) {
        let session = invites[0].1.session;
        let candidate = self.coordinator.candidate(&session).expect("candidate");
        for (player, invite) in invites {
            let participant = self.players.get_mut(player).expect("known player");
            assert_eq!(participant.review_transaction(&candidate), Review::Approve);
            let signatures = participant.sign_inputs().expect("sign inputs");
            let verdict = self
                .coordinator
                .submit_input_signatures(session, invite.handle, signatures, self.now)
                .expect("signatures");
            assert_eq!(verdict, Verdict::Accepted);
        }
    }

    /// Runs an already started session to completion
    pub fn complete(&mut self, invites: &[(PlayerId, SessionInvite)]) -> Vec<CoordinatorEvent> {
        let session = invites[0].1.session;
        self.register_all(invites);
        self.blind_sign_all(invites);
        for (player, _) in invites {
            self.reveal(*player, session);
        }
        self.review_and_sign_all(invites);
        self.coordinator.take_events()
    }
}

pub fn invites(events: &[CoordinatorEvent]) -> Vec<(PlayerId, SessionInvite)> {
    events
        .iter()
        .filter_map(|e| match e {
            CoordinatorEvent::SessionStarted { invites, .. } => Some(invites.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

pub fn completed(events: &[CoordinatorEvent]) -> Option<SignedTransaction> {
    events.iter().find_map(|e| match e {
        CoordinatorEvent::SessionCompleted { transaction, .. } => Some(transaction.clone()),
        _ => None,
    })
}
