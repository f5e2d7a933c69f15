//! Control plane configuration

use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};
use crate::model::SetupKey;
use crate::routes::RoutePolicy;

/// Control plane configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub account_id: String,

    /// Overlay address pool for new accounts
    pub network_range: IpNet,

    /// Route tie-break policy
    pub route_policy: RoutePolicy,

    /// Setup keys accepted from startup; more are minted over the API
    pub setup_keys: Vec<SetupKey>,

    /// How long an agent sync request waits for a newer map
    pub long_poll_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            account_id: "default".to_string(),
            network_range: IpNet::V4(ipnet::Ipv4Net::new(std::net::Ipv4Addr::new(100, 64, 0, 0), 10).unwrap_or_default()),
            route_policy: RoutePolicy::default(),
            setup_keys: Vec::new(),
            long_poll_timeout: Duration::from_secs(30),
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> ControlResult<()> {
        if self.account_id.trim().is_empty() {
            return Err(ControlError::Config("account_id must not be empty".into()));
        }
        if self.network_range.hosts().next().is_none() {
            return Err(ControlError::Config(format!("network_range {} has no host addresses", self.network_range)));
        }
        if self.setup_keys.iter().any(|k| k.key.trim().is_empty()) {
            return Err(ControlError::Config("setup keys must not be empty".into()));
        }
        let distinct: std::collections::HashSet<&str> = self.setup_keys.iter().map(|k| k.key.as_str()).collect();
        if distinct.len() != self.setup_keys.len() {
            return Err(ControlError::Config("setup keys must be distinct".into()));
        }
        if self.long_poll_timeout.is_zero() {
            return Err(ControlError::Config("long_poll_timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn setup_key(&self, key: &str) -> Option<&SetupKey> {
        self.setup_keys.iter().find(|k| k.key == key)
    }
}
