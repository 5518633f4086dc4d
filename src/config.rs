//! Engine configuration: batching/heartbeat/poll cadence, the smear
//! fraction, throttle rules, and the initialize retry backoff.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial_delay_ms: 1_000, max_delay_ms: 60_000, multiplier: 2.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleRuleConfig {
    pub window_ms: u64,
    pub max_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Nominal period of the outbound batcher.
    pub batching_delay_ms: u64,
    /// Nominal floor for heartbeats until server overrides.
    pub heartbeat_interval_ms: u64,
    /// Inbound poll cadence.
    pub poll_interval_ms: u64,
    /// Argument to the Smearer, in `(0, 1]`.
    pub smear_percent: f64,
    /// Throttler rule set.
    pub throttle_rules: Vec<ThrottleRuleConfig>,
    /// First heartbeat delay after start.
    pub initial_persistent_heartbeat_delay_ms: u64,
    /// Echoed verbatim in every header.
    pub protocol_version: u32,
    /// How long to wait for a TokenControl response before resending
    /// Initialize.
    pub initialize_timeout_ms: u64,
    /// Backoff schedule for repeated Initialize resends.
    pub initialize_backoff: BackoffConfig,
    /// Outbound message size bound enforced by the validator.
    pub max_message_bytes: usize,
    /// Seed for the deterministic smearer RNG. `None` seeds from entropy.
    pub smear_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batching_delay_ms: 500,
            heartbeat_interval_ms: 20 * 60 * 1000,
            poll_interval_ms: 20 * 60 * 1000,
            smear_percent: 0.20,
            throttle_rules: vec![
                ThrottleRuleConfig { window_ms: 1_000, max_count: 1 },
                ThrottleRuleConfig { window_ms: 60_000, max_count: 6 },
            ],
            initial_persistent_heartbeat_delay_ms: 2_000,
            protocol_version: 1,
            initialize_timeout_ms: 20_000,
            initialize_backoff: BackoffConfig::default(),
            max_message_bytes: 1 << 20,
            smear_seed: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, crate::error::EngineError> {
        toml::from_str(text).map_err(|e| crate::error::EngineError::Internal(format!("invalid config: {e}")))
    }
}
