//! Client configuration

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use meshlink_core::CoreConfig;
use meshlink_crypto::{KeyPair, SecretKey};
use serde::{Deserialize, Serialize};

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Management server base URL
    pub management_url: String,
    /// Setup key used on the next login
    pub setup_key: Option<String>,
    /// Hostname reported to the management server
    pub hostname: Option<String>,
    /// Base64 X25519 private key, generated on first run
    pub private_key: String,
    /// Network configuration
    pub network: NetworkConfig,
    /// Negotiation and session timing
    #[serde(default)]
    pub agent: CoreConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Peer transport listen port
    pub listen_port: u16,
    /// Signal server address
    pub signal_server: String,
    /// Relay server address
    pub relay_server: Option<String>,
    /// Overlay interface routes are installed on
    pub interface: String,
    /// Install routes with `ip route` (otherwise only logged)
    pub apply_routes: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            management_url: "http://127.0.0.1:33073".to_string(),
            setup_key: None,
            hostname: None,
            private_key: KeyPair::generate().secret.to_base64(),
            network: NetworkConfig {
                listen_port: 51820,
                signal_server: "127.0.0.1:10000".to_string(),
                relay_server: Some("127.0.0.1:3478".to_string()),
                interface: "meshlink0".to_string(),
                apply_routes: false,
            },
            agent: CoreConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.management_url.starts_with("http://") && !self.management_url.starts_with("https://") {
            anyhow::bail!("management_url must be an http(s) URL");
        }
        self.keys()?;
        self.signal_addr()?;
        self.relay_addr()?;
        self.agent.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }

    pub fn keys(&self) -> Result<KeyPair> {
        let secret = SecretKey::from_base64(&self.private_key).context("Invalid private_key")?;
        Ok(KeyPair::from_secret(secret))
    }

    pub fn signal_addr(&self) -> Result<SocketAddr> {
        self.network
            .signal_server
            .parse()
            .with_context(|| format!("Invalid signal_server {}", self.network.signal_server))
    }

    pub fn relay_addr(&self) -> Result<Option<SocketAddr>> {
        self.network
            .relay_server
            .as_deref()
            .map(|addr| addr.parse().with_context(|| format!("Invalid relay_server {}", addr)))
            .transpose()
    }

    /// Hostname to register with
    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "meshlink-peer".to_string())
    }
}
