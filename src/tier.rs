//! Pool matcher: groups waiting players into amount tiers and decides when a
//! tier has enough of them to start a round.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::FusionConfig;
use crate::error::{FusionError, Result};
use crate::types::{checked_total, Coin, PlayerId, TierId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierParams {
    pub min_amount: u64,
    /// Exclusive upper bound; `None` for the top tier
    pub max_amount: Option<u64>,
    pub min_players: usize,
    pub max_players: usize,
}

impl TierParams {
    pub fn contains(&self, amount: u64) -> bool {
        amount >= self.min_amount && self.max_amount.map_or(true, |max| amount < max)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_players < 2 || self.max_players < self.min_players {
            return Err(FusionError::Malformed(format!(
                "tier wants {}..={} players",
                self.min_players, self.max_players
            )));
        }
        if self.max_amount.map_or(false, |max| max <= self.min_amount) {
            return Err(FusionError::Malformed("tier amount range is empty".into()));
        }
        Ok(())
    }
}

/// What a player asks for when joining: the coins it will pledge and the
/// output amounts it wants back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub coins: Vec<Coin>,
    pub desired_outputs: Vec<u64>,
}

impl JoinRequest {
    /// `None` when the stated amounts overflow
    pub fn input_total(&self) -> Option<u64> {
        checked_total(self.coins.iter().map(|c| c.amount))
    }
}

#[derive(Debug, Clone)]
struct Waiting {
    player: PlayerId,
    request: JoinRequest,
    joined_at: Instant,
    tier_since: Instant,
}

#[derive(Debug)]
struct Tier {
    params: TierParams,
    queue: VecDeque<Waiting>,
}

/// Players taken out of a tier to seat a new session
#[derive(Debug, Clone)]
pub struct Formation {
    pub tier: TierId,
    pub members: Vec<(PlayerId, JoinRequest, Instant)>,
}

#[derive(Debug)]
pub struct TierMatcher {
    tiers: BTreeMap<TierId, Tier>,
    located: HashMap<PlayerId, TierId>,
    next_id: u32,
    wait_window: Duration,
    rebucket_after: Duration,
}

impl TierMatcher {
    /// Opens one tier per configured boundary
    pub fn new(config: &FusionConfig) -> Self {
        let mut matcher = Self {
            tiers: BTreeMap::new(),
            located: HashMap::new(),
            next_id: 0,
            wait_window: config.wait_window(),
            rebucket_after: config.rebucket_after(),
        };
        let bounds = &config.tier_boundaries;
        for (i, min_amount) in bounds.iter().enumerate() {
            matcher.insert_tier(TierParams {
                min_amount: *min_amount,
                max_amount: bounds.get(i + 1).copied(),
                min_players: config.min_players,
                max_players: config.max_players,
            });
        }
        matcher
    }

    pub fn open_tier(&mut self, params: TierParams) -> Result<TierId> {
        params.validate()?;
        Ok(self.insert_tier(params))
    }

    fn insert_tier(&mut self, params: TierParams) -> TierId {
        let id = TierId(self.next_id);
        self.next_id += 1;
        debug!(tier = id.0, min_amount = params.min_amount, "tier opened");
        self.tiers.insert(
            id,
            Tier {
                params,
                queue: VecDeque::new(),
            },
        );
        id
    }

    pub fn params(&self, tier: TierId) -> Option<&TierParams> {
        self.tiers.get(&tier).map(|t| &t.params)
    }

    /// The tightest open tier covering `amount`
    pub fn tier_for(&self, amount: u64) -> Option<TierId> {
        self.tiers
            .iter()
            .filter(|(_, tier)| tier.params.contains(amount))
            .max_by_key(|(_, tier)| tier.params.min_amount)
            .map(|(id, _)| *id)
    }

    pub fn join(&mut self, player: PlayerId, request: JoinRequest, now: Instant) -> Result<TierId> {
        if self.located.contains_key(&player) {
            return Err(FusionError::Malformed(format!("{} is already waiting", player)));
        }
        let amount = request
            .input_total()
            .ok_or_else(|| FusionError::Malformed("coin amounts overflow".into()))?;
        let tier = self
            .tier_for(amount)
            .ok_or_else(|| FusionError::Malformed(format!("no tier accepts amount {}", amount)))?;
        let waiting = Waiting {
            player,
            request,
            joined_at: now,
            tier_since: now,
        };
        self.push(tier, waiting, false);
        Ok(tier)
    }

    /// Returns a player from an aborted session. They keep their original
    /// join time and go to the front of the queue.
    pub fn requeue(
        &mut self,
        tier: TierId,
        player: PlayerId,
        request: JoinRequest,
        joined_at: Instant,
        now: Instant,
    ) {
        let tier = if self.tiers.contains_key(&tier) {
            tier
        } else {
            match request.input_total().and_then(|amount| self.tier_for(amount)) {
                Some(tier) => tier,
                None => return,
            }
        };
        let waiting = Waiting {
            player,
            request,
            joined_at,
            tier_since: now,
        };
        self.push(tier, waiting, true);
    }

    fn push(&mut self, tier: TierId, waiting: Waiting, front: bool) {
        let Some(slot) = self.tiers.get_mut(&tier) else {
            return;
        };
        self.located.insert(waiting.player, tier);
        if front {
            slot.queue.push_front(waiting);
        } else {
            slot.queue.push_back(waiting);
        }
    }

    pub fn leave(&mut self, player: PlayerId) -> Option<JoinRequest> {
        let tier = self.located.remove(&player)?;
        let slot = self.tiers.get_mut(&tier)?;
        let index = slot.queue.iter().position(|w| w.player == player)?;
        slot.queue.remove(index).map(|w| w.request)
    }

    pub fn is_waiting(&self, player: PlayerId) -> bool {
        self.located.contains_key(&player)
    }

    pub fn waiting_in(&self, tier: TierId) -> usize {
        self.tiers.get(&tier).map_or(0, |t| t.queue.len())
    }

    /// Moves stale players down a tier, then seats every tier that is ready
    pub fn form(&mut self, now: Instant) -> Vec<Formation> {
        self.rebucket(now);

        let mut formations = Vec::new();
        for (id, tier) in self.tiers.iter_mut() {
            let params = &tier.params;
            let len = tier.queue.len();
            let take = if len >= params.max_players {
                params.max_players
            } else if len >= params.min_players
                && tier
                    .queue
                    .iter()
                    .map(|w| w.joined_at)
                    .min()
                    .map_or(false, |oldest| oldest + self.wait_window <= now)
            {
                len
            } else {
                continue;
            };

            let members: Vec<_> = tier
                .queue
                .drain(..take)
                .map(|w| (w.player, w.request, w.joined_at))
                .collect();
            for (player, _, _) in &members {
                self.located.remove(player);
            }
            info!(tier = id.0, players = members.len(), "tier filled");
            formations.push(Formation { tier: *id, members });
        }
        formations
    }

    fn rebucket(&mut self, now: Instant) {
        let order: Vec<(TierId, u64)> = self
            .tiers
            .iter()
            .map(|(id, t)| (*id, t.params.min_amount))
            .collect();

        for (id, min_amount) in &order {
            let Some(lower) = order
                .iter()
                .filter(|(_, other)| other < min_amount)
                .max_by_key(|(_, other)| *other)
                .map(|(lower, _)| *lower)
            else {
                continue;
            };

            let Some(tier) = self.tiers.get_mut(id) else {
                continue;
            };
            if tier.queue.len() >= tier.params.min_players {
                continue;
            }
            let mut stale = Vec::new();
            let mut i = 0;
            while i < tier.queue.len() {
                if tier.queue[i].tier_since + self.rebucket_after <= now {
                    if let Some(w) = tier.queue.remove(i) {
                        stale.push(w);
                    }
                } else {
                    i += 1;
                }
            }
            for mut waiting in stale {
                debug!(player = %waiting.player, from = id.0, to = lower.0, "rebucketing player");
                waiting.tier_since = now;
                self.push(lower, waiting, false);
            }
        }
    }
}
