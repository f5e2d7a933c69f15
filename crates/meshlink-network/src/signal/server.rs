//! Signal Server
//!
//! UDP rendezvous in front of a `SignalHub`. A client subscribes with its
//! key; the server remembers the address it saw the client at, pushes
//! queued envelopes there and reports that address back so the client can
//! advertise it as a server-reflexive candidate.
//!
//! Deliveries are retransmitted until the subscriber acks them or the
//! attempts run out, mirroring the client's own send path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use meshlink_crypto::PublicKey;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::{SignalChannel, SignalConfig, SignalHub};
use crate::error::{NetworkError, NetworkResult};
use crate::protocol::{decode, encode, SignalEnvelope, SignalMessage};

/// Registered subscriber
struct Subscriber {
    addr: SocketAddr,
    forwarder: JoinHandle<()>,
}

/// Signal server statistics
#[derive(Debug, Clone)]
pub struct SignalServerStats {
    pub subscribers: usize,
    pub mailboxes: usize,
}

/// Delivery waiting for its ack, keyed by delivery id
type PendingDeliveries = DashMap<u64, (PublicKey, oneshot::Sender<()>)>;

/// UDP signal server
pub struct SignalServer {
    socket: Arc<UdpSocket>,
    hub: SignalHub,
    subscribers: DashMap<PublicKey, Subscriber>,
    next_delivery: Arc<AtomicU64>,
    pending: Arc<PendingDeliveries>,
    config: SignalConfig,
}

impl SignalServer {
    /// Bind a new signal server
    pub async fn bind(bind_addr: &str, config: SignalConfig) -> NetworkResult<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| NetworkError::BindError(e.to_string()))?;

        info!("Signal server listening on {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            hub: SignalHub::new(config.clone()),
            subscribers: DashMap::new(),
            next_delivery: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(DashMap::new()),
            config,
        })
    }

    /// Get local address
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// The hub behind this server
    pub fn hub(&self) -> &SignalHub {
        &self.hub
    }

    /// Serve until the socket fails
    pub async fn run(self: Arc<Self>) -> NetworkResult<()> {
        let purger = {
            let hub = self.hub.clone();
            let period = (self.config.ttl / 2).max(Duration::from_secs(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    hub.purge_expired();
                }
            })
        };

        let mut buf = [0u8; 65536];
        let result = loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    error!("Signal server receive error: {}", e);
                    break Err(NetworkError::ReceiveError(e.to_string()));
                }
            };

            if let Err(e) = self.handle_packet(&buf[..len], from).await {
                trace!("Error handling signal packet from {}: {}", from, e);
            }
        };

        purger.abort();
        result
    }

    async fn handle_packet(&self, data: &[u8], from: SocketAddr) -> NetworkResult<()> {
        let msg: SignalMessage = match decode(data) {
            Ok(m) => m,
            Err(e) => {
                debug!("Failed to decode signal message from {}: {}", from, e);
                return Ok(());
            }
        };

        match msg {
            SignalMessage::Subscribe { peer } => self.handle_subscribe(peer, from).await,
            SignalMessage::Send { id, envelope } => self.handle_send(id, envelope, from).await,
            SignalMessage::DeliverAck { peer, id } => {
                self.handle_deliver_ack(peer, id, from);
                Ok(())
            }
            _ => {
                debug!("Unexpected signal message from {}", from);
                Ok(())
            }
        }
    }

    async fn handle_subscribe(&self, peer: PublicKey, from: SocketAddr) -> NetworkResult<()> {
        let refresh = self
            .subscribers
            .get(&peer)
            .map(|s| s.addr == from && !s.forwarder.is_finished())
            .unwrap_or(false);

        if !refresh {
            let forwarder = self.spawn_forwarder(peer, from);
            if let Some(old) = self.subscribers.insert(peer, Subscriber { addr: from, forwarder }) {
                old.forwarder.abort();
                info!("Peer {:?} moved {} -> {}", peer, old.addr, from);
            } else {
                info!("Peer {:?} subscribed from {}", peer, from);
            }
        } else {
            trace!("Subscription refresh from {:?}", peer);
        }

        self.send_to(&SignalMessage::SubscribeAck { observed_addr: from }, from).await
    }

    fn spawn_forwarder(&self, peer: PublicKey, addr: SocketAddr) -> JoinHandle<()> {
        let mut incoming = self.hub.subscribe(peer);
        let socket = self.socket.clone();
        let next_delivery = self.next_delivery.clone();
        let pending = self.pending.clone();
        let attempts = self.config.send_attempts.max(1);
        let ack_timeout = self.config.ack_timeout;

        tokio::spawn(async move {
            while let Some(envelope) = incoming.next().await {
                let id = next_delivery.fetch_add(1, Ordering::Relaxed);
                let data = match encode(&SignalMessage::Deliver { id, envelope }) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("Failed to encode delivery: {}", e);
                        continue;
                    }
                };

                // One delivery in flight per subscriber keeps same-sender order
                let mut acked = false;
                for attempt in 1..=attempts {
                    let (tx, rx) = oneshot::channel();
                    pending.insert(id, (peer, tx));

                    if let Err(e) = socket.send_to(&data, addr).await {
                        debug!("Delivery to {} failed: {}", addr, e);
                    }
                    if let Ok(Ok(())) = tokio::time::timeout(ack_timeout, rx).await {
                        trace!("Delivery {} to {:?} acked on attempt {}", id, peer, attempt);
                        acked = true;
                        break;
                    }
                }
                if !acked {
                    pending.remove(&id);
                    debug!("Delivery {} to {:?} dropped after {} attempts", id, peer, attempts);
                }
            }
            debug!("Forwarder for {:?} finished", peer);
        })
    }

    fn handle_deliver_ack(&self, peer: PublicKey, id: u64, from: SocketAddr) {
        let known = self
            .subscribers
            .get(&peer)
            .map(|s| s.addr == from)
            .unwrap_or(false);
        if !known {
            trace!("Ignoring delivery ack from {}", from);
            return;
        }
        if let Some((_, (_, tx))) = self.pending.remove_if(&id, |_, (owner, _)| *owner == peer) {
            let _ = tx.send(());
        }
    }

    async fn handle_send(&self, id: u64, envelope: SignalEnvelope, from: SocketAddr) -> NetworkResult<()> {
        // The sender must be the subscriber registered for the `from` key
        let authentic = self
            .subscribers
            .get(&envelope.from)
            .map(|s| s.addr == from)
            .unwrap_or(false);

        if !authentic {
            let error = SignalMessage::Error {
                id: Some(id),
                message: "Sender not subscribed from this address".into(),
            };
            return self.send_to(&error, from).await;
        }

        trace!("Signal {:?} -> {:?} ({} bytes)", envelope.from, envelope.to, envelope.payload.len());
        self.hub.send(envelope.from, envelope.to, envelope.payload).await?;
        self.send_to(&SignalMessage::SendAck { id }, from).await
    }

    async fn send_to(&self, msg: &SignalMessage, addr: SocketAddr) -> NetworkResult<()> {
        let data = encode(msg)?;
        self.socket
            .send_to(&data, addr)
            .await
            .map_err(|e| NetworkError::SendError(e.to_string()))?;
        Ok(())
    }

    /// Get stats
    pub fn stats(&self) -> SignalServerStats {
        SignalServerStats {
            subscribers: self.subscribers.len(),
            mailboxes: self.hub.mailbox_count(),
        }
    }
}

impl Drop for SignalServer {
    fn drop(&mut self) {
        for entry in self.subscribers.iter() {
            entry.forwarder.abort();
        }
    }
}
