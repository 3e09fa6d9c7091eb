//! Coordinator and participant settings.
//!
//! Amounts are in base units (1 coin = 100_000_000). Durations are stored as
//! whole milliseconds so the JSON form stays flat.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FusionError, Result};

/// Outputs below this are refused; they would be uneconomic to spend.
pub const DEFAULT_DUST_LIMIT: u64 = 546;

/// Fee per input or output component (0.005 coin)
pub const DEFAULT_FEE_RATE: u64 = 500_000;

/// Smallest modulus the blind signature key may use
pub const MIN_RSA_MODULUS_BITS: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub min_players: usize,
    pub max_players: usize,
    /// Lower bounds of the amount tiers, ascending. Tier `i` covers
    /// `[tier_boundaries[i], tier_boundaries[i + 1])`.
    pub tier_boundaries: Vec<u64>,
    pub registration_timeout_ms: u64,
    pub blind_signing_timeout_ms: u64,
    pub reveal_timeout_ms: u64,
    pub blame_timeout_ms: u64,
    pub signing_timeout_ms: u64,
    /// How long a filled-to-minimum tier waits for more players
    pub wait_window_ms: u64,
    /// How long an under-filled tier keeps a player before moving them down
    pub rebucket_after_ms: u64,
    pub max_outputs_per_participant: usize,
    pub max_inputs_per_participant: usize,
    pub fee_rate: u64,
    pub dust_limit: u64,
    pub ban_base_ms: u64,
    pub ban_max_ms: u64,
    /// How long finished session ids and spent coins are remembered
    pub retired_retention_ms: u64,
    pub tick_interval_ms: u64,
    pub transport_retries: u32,
    pub transport_retry_delay_ms: u64,
    pub rsa_modulus_bits: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_players: 3,
            max_players: 10,
            tier_boundaries: vec![
                1_000_000,
                10_000_000,
                100_000_000,
                1_000_000_000,
                10_000_000_000,
            ],
            registration_timeout_ms: 30_000,
            blind_signing_timeout_ms: 20_000,
            reveal_timeout_ms: 20_000,
            blame_timeout_ms: 20_000,
            signing_timeout_ms: 30_000,
            wait_window_ms: 60_000,
            rebucket_after_ms: 300_000,
            max_outputs_per_participant: 4,
            max_inputs_per_participant: 8,
            fee_rate: DEFAULT_FEE_RATE,
            dust_limit: DEFAULT_DUST_LIMIT,
            ban_base_ms: 60_000,
            ban_max_ms: 86_400_000,
            retired_retention_ms: 3_600_000,
            tick_interval_ms: 250,
            transport_retries: 3,
            transport_retry_delay_ms: 200,
            rsa_modulus_bits: MIN_RSA_MODULUS_BITS,
        }
    }
}

impl FusionConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: FusionConfig =
            serde_json::from_str(json).map_err(|e| FusionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_players < 2 {
            return Err(FusionError::Config("min_players must be at least 2".into()));
        }
        if self.max_players < self.min_players {
            return Err(FusionError::Config(format!(
                "max_players {} below min_players {}",
                self.max_players, self.min_players
            )));
        }
        if self.tier_boundaries.is_empty() {
            return Err(FusionError::Config("no amount tiers configured".into()));
        }
        if self.tier_boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(FusionError::Config(
                "tier boundaries must be strictly ascending".into(),
            ));
        }
        if self.max_outputs_per_participant == 0 || self.max_inputs_per_participant == 0 {
            return Err(FusionError::Config(
                "participants need at least one input and one output".into(),
            ));
        }
        if self.rsa_modulus_bits < MIN_RSA_MODULUS_BITS {
            return Err(FusionError::Config(format!(
                "rsa_modulus_bits {} below {}",
                self.rsa_modulus_bits, MIN_RSA_MODULUS_BITS
            )));
        }
        let phases = [
            self.registration_timeout_ms,
            self.blind_signing_timeout_ms,
            self.reveal_timeout_ms,
            self.blame_timeout_ms,
            self.signing_timeout_ms,
        ];
        if phases.iter().any(|ms| *ms == 0) {
            return Err(FusionError::Config("phase timeouts must be non-zero".into()));
        }
        if self.ban_base_ms > self.ban_max_ms {
            return Err(FusionError::Config("ban_base_ms above ban_max_ms".into()));
        }
        Ok(())
    }

    /// Fee one participant owes for its share of the joint transaction
    pub fn fee_for(&self, inputs: usize, outputs: usize) -> u64 {
        self.fee_rate.saturating_mul((inputs + outputs) as u64)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn blind_signing_timeout(&self) -> Duration {
        Duration::from_millis(self.blind_signing_timeout_ms)
    }

    pub fn reveal_timeout(&self) -> Duration {
        Duration::from_millis(self.reveal_timeout_ms)
    }

    pub fn blame_timeout(&self) -> Duration {
        Duration::from_millis(self.blame_timeout_ms)
    }

    pub fn signing_timeout(&self) -> Duration {
        Duration::from_millis(self.signing_timeout_ms)
    }

    pub fn wait_window(&self) -> Duration {
        Duration::from_millis(self.wait_window_ms)
    }

    pub fn rebucket_after(&self) -> Duration {
        Duration::from_millis(self.rebucket_after_ms)
    }

    pub fn ban_base(&self) -> Duration {
        Duration::from_millis(self.ban_base_ms)
    }

    pub fn ban_max(&self) -> Duration {
        Duration::from_millis(self.ban_max_ms)
    }

    pub fn retired_retention(&self) -> Duration {
        Duration::from_millis(self.retired_retention_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn transport_retry_delay(&self) -> Duration {
        Duration::from_millis(self.transport_retry_delay_ms)
    }
}
