//! Agent configuration

use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Negotiator timing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    /// Probe timeout per remote candidate
    pub probe_timeout: Duration,

    /// How long to wait for the remote's offer or answer before giving up
    /// on direct probing
    pub signal_timeout: Duration,

    /// How long to wait for the remote's relayed endpoint once our own
    /// allocation succeeded
    pub relay_wait: Duration,

    /// Relay allocation and release timeout
    pub allocation_timeout: Duration,

    /// First retry delay after a failed negotiation
    pub backoff_base: Duration,

    /// Retry delay ceiling
    pub backoff_cap: Duration,

    /// Relative jitter applied to every retry delay (0.2 = ±20%)
    pub backoff_jitter: f64,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(2),
            signal_timeout: Duration::from_secs(5),
            relay_wait: Duration::from_secs(5),
            allocation_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            backoff_jitter: 0.2,
        }
    }
}

/// Session supervision timing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keepalive period of an established session
    pub keepalive_interval: Duration,

    /// Missed intervals before an established session is failed
    pub keepalive_misses: u32,

    /// Reconciliation period
    pub reconcile_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(25),
            keepalive_misses: 3,
            reconcile_interval: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Silence after which an established session is failed
    pub fn keepalive_timeout(&self) -> Duration {
        self.keepalive_interval * self.keepalive_misses
    }
}

/// Agent configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub negotiator: NegotiatorConfig,
    pub session: SessionConfig,
}

impl CoreConfig {
    /// Short timers for local testing
    pub fn fast() -> Self {
        Self {
            negotiator: NegotiatorConfig {
                probe_timeout: Duration::from_millis(300),
                signal_timeout: Duration::from_secs(1),
                relay_wait: Duration::from_secs(1),
                allocation_timeout: Duration::from_secs(1),
                backoff_base: Duration::from_millis(200),
                backoff_cap: Duration::from_secs(2),
                ..Default::default()
            },
            session: SessionConfig {
                keepalive_interval: Duration::from_millis(500),
                keepalive_misses: 3,
                reconcile_interval: Duration::from_millis(250),
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        let n = &self.negotiator;
        if n.probe_timeout.is_zero() || n.signal_timeout.is_zero() {
            return Err("Probe and signal timeouts must be positive".into());
        }
        if n.backoff_base.is_zero() || n.backoff_cap < n.backoff_base {
            return Err("Backoff cap must be at least the (positive) base".into());
        }
        if !(0.0..1.0).contains(&n.backoff_jitter) {
            return Err(format!("Backoff jitter {} must be in [0, 1)", n.backoff_jitter));
        }
        let s = &self.session;
        if s.keepalive_interval.is_zero() || s.reconcile_interval.is_zero() {
            return Err("Keepalive and reconcile intervals must be positive".into());
        }
        if s.keepalive_misses == 0 {
            return Err("Keepalive misses must be at least 1".into());
        }
        Ok(())
    }
}
