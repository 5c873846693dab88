//! Runtime configuration for the bridge
//!
//! Tunables that are not part of a game profile: tick rate, death-link
//! policy, reconnect backoff. Loaded from JSON; every field has a default so
//! an empty object (`{}`) is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Default tick interval in milliseconds
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 250;

/// Default capacity for the event broadcast channel
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bridge tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Interval between ticks
    pub tick_interval_ms: u64,
    /// Number of session id bytes compared (clipped to the profile field)
    pub session_id_width: usize,
    /// Consecutive identical non-blank mismatches before giving up
    pub session_mismatch_confirmations: u32,
    /// Relay deaths to and from the session
    pub death_link: bool,
    /// Minimum time between two relayed outgoing deaths
    pub death_link_cooldown_ms: u64,
    /// First reconnect delay; later delays grow along the Fibonacci sequence
    pub reconnect_base_ms: u64,
    /// Upper bound for the reconnect delay
    pub reconnect_max_ms: u64,
    /// Capacity of the status/event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            session_id_width: 16,
            session_mismatch_confirmations: 3,
            death_link: false,
            death_link_cooldown_ms: 3_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl BridgeConfig {
    /// Parse a configuration from JSON text and validate it.
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Reject values the loop cannot work with.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.tick_interval_ms == 0 {
            return Err(BridgeError::Config("tick_interval_ms must be > 0".into()));
        }
        if self.session_id_width == 0 {
            return Err(BridgeError::Config("session_id_width must be > 0".into()));
        }
        if self.session_mismatch_confirmations == 0 {
            return Err(BridgeError::Config(
                "session_mismatch_confirmations must be > 0".into(),
            ));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(BridgeError::Config(
                "reconnect delays must satisfy 0 < base <= max".into(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(BridgeError::Config("event_channel_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Tick interval as a `Duration`
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Death-link cooldown as a `Duration`
    pub fn death_link_cooldown(&self) -> Duration {
        Duration::from_millis(self.death_link_cooldown_ms)
    }

    /// Reconnect delay after `failures` consecutive failed attempts.
    ///
    /// Sequence: base, base, 2×base, 3×base, 5×base, ... capped at the
    /// configured maximum.
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        let delay = fibonacci(failures).saturating_mul(self.reconnect_base_ms);
        Duration::from_millis(delay.min(self.reconnect_max_ms))
    }
}

/// F(0) = 1, F(1) = 1, F(n) = F(n-1) + F(n-2)
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    b
}
