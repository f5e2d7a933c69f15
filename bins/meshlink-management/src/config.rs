//! Management server configuration

use std::path::Path;

use anyhow::{Context, Result};
use meshlink_control::{ControlConfig, SetupKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// HTTP listen address
    pub listen: String,
    /// Bearer token for the admin routes
    pub admin_token: String,
    /// Account and synchronizer settings
    pub control: ControlConfig,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:33073".to_string(),
            admin_token: uuid::Uuid::new_v4().simple().to_string(),
            control: ControlConfig {
                setup_keys: vec![SetupKey::new(uuid::Uuid::new_v4().to_string(), "default", Vec::new())],
                ..Default::default()
            },
        }
    }
}

impl ManagementConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

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
        if self.admin_token.len() < 16 {
            anyhow::bail!("admin_token must be at least 16 characters");
        }
        self.listen
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid listen address {}", self.listen))?;
        self.control.validate().context("Invalid control configuration")?;
        Ok(())
    }
}
