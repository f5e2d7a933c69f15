//! Management server client

use std::time::Duration;

use anyhow::{Context, Result};
use meshlink_control::api::{ErrorResponse, LoginResponse, PEER_KEY_HEADER};
use meshlink_control::{AgentStatusReport, LoginRequest, NetworkMap};
use meshlink_crypto::PublicKey;
use reqwest::StatusCode;
use tracing::debug;

/// Client-side ceiling for one sync request; the server answers earlier
const SYNC_TIMEOUT: Duration = Duration::from_secs(90);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the agent routes of the management API
#[derive(Clone)]
pub struct ManagementClient {
    http: reqwest::Client,
    base_url: String,
    key: PublicKey,
}

impl ManagementClient {
    pub fn new(base_url: &str, key: PublicKey) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register or reconnect with a setup key
    pub async fn login(&self, request: &LoginRequest) -> Result<LoginResponse> {
        let response = self
            .http
            .post(format!("{}/api/agent/login", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .json(request)
            .send()
            .await
            .context("Management server unreachable")?;

        let response = check(response).await?;
        response.json().await.context("Malformed login response")
    }

    /// Wait for a map newer than `serial`. `None` when the server had
    /// nothing newer before its long-poll timeout.
    pub async fn sync(&self, peer_id: &str, serial: u64) -> Result<Option<NetworkMap>> {
        let response = self
            .http
            .get(format!("{}/api/agent/{}/sync", self.base_url, peer_id))
            .query(&[("serial", serial)])
            .header(PEER_KEY_HEADER, self.key.to_base64())
            .timeout(SYNC_TIMEOUT)
            .send()
            .await
            .context("Sync request failed")?;

        if response.status() == StatusCode::NO_CONTENT {
            debug!("No map newer than {}", serial);
            return Ok(None);
        }
        let response = check(response).await?;
        let map = response.json().await.context("Malformed network map")?;
        Ok(Some(map))
    }

    /// Report connected sessions
    pub async fn report_status(&self, peer_id: &str, report: &AgentStatusReport) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/api/agent/{}/status", self.base_url, peer_id))
            .header(PEER_KEY_HEADER, self.key.to_base64())
            .timeout(REQUEST_TIMEOUT)
            .json(report)
            .send()
            .await
            .context("Status report failed")?;

        check(response).await?;
        Ok(())
    }
}

/// Turn an error response into an error carrying the server's message
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match response.json::<ErrorResponse>().await {
        Ok(body) => anyhow::bail!("{} ({}): {}", status, body.code, body.error),
        Err(_) => anyhow::bail!("Management server returned {}", status),
    }
}
