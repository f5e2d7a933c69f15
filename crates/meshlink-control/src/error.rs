//! Control plane errors

use std::net::IpAddr;

use ipnet::IpNet;
use meshlink_crypto::PublicKey;
use thiserror::Error;

/// Control plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// Public key already bound to another peer
    #[error("Public key {key:?} is already registered to peer {existing}")]
    DuplicateIdentity { key: PublicKey, existing: String },

    /// Object not found
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Unknown setup key
    #[error("Invalid setup key")]
    InvalidSetupKey,

    /// Known setup key that may not enroll another peer
    #[error("Setup key {name:?} can not be used: {reason}")]
    SetupKeyRejected { name: String, reason: &'static str },

    /// No free address left in the account range
    #[error("No free overlay address in {0}")]
    PoolExhausted(IpNet),

    /// Address already assigned to another peer
    #[error("Overlay address {ip} is already assigned to peer {owner}")]
    AddressConflict { ip: IpAddr, owner: String },

    /// Address outside the account range
    #[error("Overlay address {ip} is outside {range}")]
    AddressOutOfRange { ip: IpAddr, range: IpNet },

    /// Request rejected by validation
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Bad control plane configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ControlError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ControlError::NotFound { kind, id: id.into() }
    }
}

/// Result type for control plane operations
pub type ControlResult<T> = Result<T, ControlError>;
