//! Agent errors

use meshlink_crypto::PublicKey;
use thiserror::Error;

/// Agent errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Negotiation with a peer failed; retried after backoff
    #[error("Negotiation with {peer} failed: {reason}")]
    Negotiation { peer: PublicKey, reason: String },

    /// No session for the peer
    #[error("Session not found: {0}")]
    SessionNotFound(PublicKey),

    /// Invalid state transition
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Applying a route failed
    #[error("Route error: {0}")]
    Route(String),

    /// Tunnel backend failure
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Agent is not running
    #[error("Agent is not running")]
    NotRunning,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out")]
    Timeout,

    /// Crypto error
    #[error("Crypto error: {0}")]
    CryptoError(#[from] meshlink_crypto::CryptoError),

    /// Network error
    #[error("Network error: {0}")]
    NetworkError(#[from] meshlink_network::NetworkError),

    /// Control plane error
    #[error("Control error: {0}")]
    ControlError(#[from] meshlink_control::ControlError),
}

impl CoreError {
    pub fn negotiation(peer: PublicKey, reason: impl Into<String>) -> Self {
        CoreError::Negotiation {
            peer,
            reason: reason.into(),
        }
    }
}

/// Result type for agent operations
pub type CoreResult<T> = Result<T, CoreError>;
