//! Signal Channel
//!
//! Rendezvous used by peers to exchange connection offers without routing
//! data through it:
//! - best-effort, at-least-once delivery keyed by public key
//! - per-sender order preserved, no order across senders
//! - undelivered payloads dropped after a TTL, nothing persisted
//!
//! `SignalHub` is the in-process implementation; `SignalServer` exposes a
//! hub over UDP and `SignalClient` talks to it.

pub mod hub;
pub mod server;
pub mod client;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use meshlink_crypto::PublicKey;

use crate::error::NetworkResult;
use crate::protocol::SignalEnvelope;

pub use client::SignalClient;
pub use hub::SignalHub;
pub use server::{SignalServer, SignalServerStats};

/// Incoming payloads for one subscriber. Ends only when the subscription is
/// superseded by a newer `subscribe` for the same key.
pub type SignalStream = Pin<Box<dyn Stream<Item = SignalEnvelope> + Send>>;

/// Offer/answer transport between peers
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Queue `payload` for `to`. Success means accepted, not delivered.
    async fn send(&self, from: PublicKey, to: PublicKey, payload: Vec<u8>) -> NetworkResult<()>;

    /// Lazy stream of payloads addressed to `peer`
    fn subscribe(&self, peer: PublicKey) -> SignalStream;
}

/// Signal channel configuration
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// How long an undelivered message is kept
    pub ttl: Duration,
    /// Maximum queued messages per recipient (oldest dropped first)
    pub mailbox_capacity: usize,
    /// Transmissions of one message before giving up (client sends and
    /// server deliveries)
    pub send_attempts: u32,
    /// Wait for an ack per attempt
    pub ack_timeout: Duration,
    /// Client: subscription refresh period
    pub resubscribe_interval: Duration,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            mailbox_capacity: 256,
            send_attempts: 3,
            ack_timeout: Duration::from_secs(1),
            resubscribe_interval: Duration::from_secs(10),
        }
    }
}
