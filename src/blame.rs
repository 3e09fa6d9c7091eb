//! Abort attribution and the backoff applied to players who cause aborts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::info;

use crate::error::{FusionError, Result};
use crate::session::Phase;
use crate::types::{CoinId, ParticipantHandle, PlayerId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlameReason {
    MissedDeadline,
    InvalidCommitment,
    MissingReveal,
    InvalidSignature,
    InvalidOwnershipProof,
    BalanceMismatch,
    ConflictingData,
    BlindingFactorReuse,
    Withdrew,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Culprit {
    pub player: PlayerId,
    pub handle: ParticipantHandle,
    pub reason: BlameReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlameVerdict {
    Attributed(Vec<Culprit>),
    /// Fault could not be pinned on a single participant. Suspects are
    /// dropped from the retry but not penalized.
    Inconclusive {
        suspects: Vec<PlayerId>,
        reason: BlameReason,
    },
}

/// Who caused an abort, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameRecord {
    pub session: SessionId,
    pub phase: Phase,
    pub verdict: BlameVerdict,
    /// Went silent alongside attributed culprits; left out of the retry
    /// without a strike
    pub dropped: Vec<PlayerId>,
}

impl BlameRecord {
    pub fn attributed(session: SessionId, phase: Phase, culprits: Vec<Culprit>) -> Self {
        Self {
            session,
            phase,
            verdict: BlameVerdict::Attributed(culprits),
            dropped: Vec::new(),
        }
    }

    /// An abort nobody is at fault for, such as too few players left
    pub fn unattributed(session: SessionId, phase: Phase, reason: BlameReason) -> Self {
        Self {
            session,
            phase,
            verdict: BlameVerdict::Inconclusive {
                suspects: Vec::new(),
                reason,
            },
            dropped: Vec::new(),
        }
    }

    /// Attribution for participants that went silent at a deadline. A lone
    /// dropout is blamed; several at once are treated as inconclusive.
    pub fn from_dropouts(
        session: SessionId,
        phase: Phase,
        dropped: &[(PlayerId, ParticipantHandle)],
        reason: BlameReason,
    ) -> Self {
        let verdict = match dropped {
            [(player, handle)] => BlameVerdict::Attributed(vec![Culprit {
                player: *player,
                handle: *handle,
                reason,
            }]),
            _ => BlameVerdict::Inconclusive {
                suspects: dropped.iter().map(|(player, _)| *player).collect(),
                reason,
            },
        };
        Self {
            session,
            phase,
            verdict,
            dropped: Vec::new(),
        }
    }

    pub fn culprits(&self) -> &[Culprit] {
        match &self.verdict {
            BlameVerdict::Attributed(culprits) => culprits,
            BlameVerdict::Inconclusive { .. } => &[],
        }
    }

    /// Everyone excluded from the retry, blamed or merely suspected
    pub fn excluded(&self) -> Vec<PlayerId> {
        let mut excluded = match &self.verdict {
            BlameVerdict::Attributed(culprits) => culprits.iter().map(|c| c.player).collect(),
            BlameVerdict::Inconclusive { suspects, .. } => suspects.clone(),
        };
        excluded.extend(self.dropped.iter().copied());
        excluded
    }

    pub fn names(&self, handle: ParticipantHandle) -> bool {
        self.culprits().iter().any(|c| c.handle == handle)
    }

    pub fn is_inconclusive(&self) -> bool {
        matches!(self.verdict, BlameVerdict::Inconclusive { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct BanEntry {
    strikes: u32,
    until: Instant,
}

/// Exponential backoff for players, and the coins they pledged, that caused
/// aborts. Strikes outlive the ban itself so repeat offenders escalate.
#[derive(Debug, Clone)]
pub struct BanList {
    players: HashMap<PlayerId, BanEntry>,
    coins: HashMap<CoinId, BanEntry>,
    base: Duration,
    max: Duration,
}

impl BanList {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            players: HashMap::new(),
            coins: HashMap::new(),
            base,
            max,
        }
    }

    fn backoff(&self, strikes: u32) -> Duration {
        let factor = 1u32.checked_shl(strikes.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Records a strike and returns the resulting ban length
    pub fn penalize(&mut self, player: PlayerId, coins: &[CoinId], now: Instant) -> Duration {
        let strikes = self.players.get(&player).map_or(0, |e| e.strikes) + 1;
        let length = self.backoff(strikes);
        let entry = BanEntry {
            strikes,
            until: now + length,
        };
        self.players.insert(player, entry);
        for coin in coins {
            let coin_strikes = self.coins.get(coin).map_or(0, |e| e.strikes) + 1;
            let coin_length = self.backoff(coin_strikes);
            self.coins.insert(
                *coin,
                BanEntry {
                    strikes: coin_strikes,
                    until: now + coin_length,
                },
            );
        }
        info!(
            player = %player,
            strikes,
            ban_secs = length.as_secs(),
            "player banned"
        );
        length
    }

    pub fn strikes(&self, player: PlayerId) -> u32 {
        self.players.get(&player).map_or(0, |e| e.strikes)
    }

    pub fn check(&self, player: PlayerId, coins: &[CoinId], now: Instant) -> Result<()> {
        let player_until = self.players.get(&player).map(|e| e.until);
        let coin_until = coins.iter().filter_map(|c| self.coins.get(c)).map(|e| e.until);
        let latest = player_until.into_iter().chain(coin_until).max();
        match latest {
            Some(until) if until > now => Err(FusionError::Banned {
                remaining_secs: until.duration_since(now).as_secs().max(1),
            }),
            _ => Ok(()),
        }
    }

    /// Forgets records whose ban ended more than `max` ago
    pub fn prune(&mut self, now: Instant) {
        let max = self.max;
        let keep = |e: &mut BanEntry| e.until + max > now;
        self.players.retain(|_, e| keep(e));
        self.coins.retain(|_, e| keep(e));
    }
}
