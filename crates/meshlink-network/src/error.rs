//! Network error types

use meshlink_crypto::PublicKey;
use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Address already in use
    #[error("Address already in use: {0}")]
    AddressInUse(std::net::SocketAddr),

    /// Bind error
    #[error("Bind error: {0}")]
    BindError(String),

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Receive error
    #[error("Receive error: {0}")]
    ReceiveError(String),

    /// Invalid packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Signal message was not accepted before its TTL ran out
    #[error("Signal to {0:?} expired before delivery")]
    SignalExpired(PublicKey),

    /// Relay refused or did not answer the allocation
    #[error("Relay allocation failed: {0}")]
    RelayAllocationFailed(String),

    /// Not allocated on the relay
    #[error("Not connected to relay")]
    NotConnected,

    /// Peer not found
    #[error("Peer not found: {0:?}")]
    PeerNotFound(PublicKey),

    /// Handshake proof did not verify
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(#[from] meshlink_crypto::CryptoError),

    /// Transport was shut down
    #[error("Transport closed")]
    Closed,

    /// General timeout (without message)
    #[error("Operation timed out")]
    Timeout,
}

impl From<bincode::Error> for NetworkError {
    fn from(e: bincode::Error) -> Self {
        NetworkError::SerializationError(e.to_string())
    }
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
