//! Peer Transport
//!
//! One UDP socket per agent carrying hole punch probes and session
//! keepalives. Packets from keys that were not authorized are dropped,
//! and punches are only acked once their proof verifies. Keepalives carry
//! a tag over their sequence number and must arrive in increasing order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use meshlink_crypto::{HandshakeProof, KeyPair, Nonce, PublicKey, SharedSecret};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::protocol::{decode, encode, PeerPacket};
use crate::relay::RelayClient;

/// How a packet reached us or should leave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerPath {
    /// Straight to the peer's address
    Direct(SocketAddr),
    /// Through the relay at this address
    Relayed(SocketAddr),
}

/// Something the transport observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A keepalive or keepalive reply arrived from `peer`
    Liveness { peer: PublicKey, path: PeerPath },
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Delay between punch packets while probing
    pub punch_interval: Duration,
    /// Capacity of the event broadcast
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            punch_interval: Duration::from_millis(100),
            event_capacity: 1024,
        }
    }
}

struct Shared {
    socket: Arc<UdpSocket>,
    keys: KeyPair,
    config: TransportConfig,
    /// Authorized peers and the secret shared with each
    peers: DashMap<PublicKey, SharedSecret>,
    probes: DashMap<(PublicKey, Nonce), oneshot::Sender<SocketAddr>>,
    /// Highest keepalive (false) and reply (true) sequence seen per peer
    keepalive_seen: DashMap<(PublicKey, bool), u64>,
    relay: RwLock<Option<Arc<RelayClient>>>,
    events: broadcast::Sender<TransportEvent>,
}

/// UDP transport between peers
pub struct PeerTransport {
    shared: Arc<Shared>,
    keepalive_seq: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerTransport {
    /// Bind the transport socket and start receiving
    pub async fn bind(addr: SocketAddr, keys: KeyPair, config: TransportConfig) -> NetworkResult<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                NetworkError::AddressInUse(addr)
            } else {
                NetworkError::Io(e)
            }
        })?;
        debug!("Peer transport bound to {}", socket.local_addr()?);

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            socket: Arc::new(socket),
            keys,
            config,
            peers: DashMap::new(),
            probes: DashMap::new(),
            keepalive_seen: DashMap::new(),
            relay: RwLock::new(None),
            events,
        });

        let receiver = tokio::spawn(udp_loop(shared.clone()));

        Ok(Arc::new(Self {
            shared,
            keepalive_seq: AtomicU64::new(initial_keepalive_seq()),
            tasks: Mutex::new(vec![receiver]),
        }))
    }

    /// Get local address
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Our public key
    pub fn public_key(&self) -> PublicKey {
        self.shared.keys.public
    }

    /// Accept probes and keepalives from `peer`
    pub fn authorize(&self, peer: PublicKey) {
        if !self.shared.peers.contains_key(&peer) {
            let shared = self.shared.keys.secret.diffie_hellman(&peer);
            self.shared.peers.insert(peer, shared);
            trace!("Authorized {:?}", peer);
        }
    }

    /// Stop accepting packets from `peer`
    pub fn forget(&self, peer: &PublicKey) {
        self.shared.peers.remove(peer);
        self.shared.probes.retain(|(remote, _), _| remote != peer);
        self.shared.keepalive_seen.retain(|(remote, _), _| remote != peer);
    }

    /// Whether `peer` is currently authorized
    pub fn is_authorized(&self, peer: &PublicKey) -> bool {
        self.shared.peers.contains_key(peer)
    }

    /// Subscribe to liveness events
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    /// Route relayed peer packets through this transport
    pub fn attach_relay(&self, relay: Arc<RelayClient>) {
        let data = relay.take_data();
        *self.shared.relay.write().unwrap_or_else(|e| e.into_inner()) = Some(relay.clone());

        let Some(mut data) = data else {
            warn!("Relay data stream already taken; relayed packets will not be seen");
            return;
        };

        let shared = self.shared.clone();
        let relay_addr = relay.relay_addr();
        let task = tokio::spawn(async move {
            while let Some((from, payload)) = data.recv().await {
                let packet: PeerPacket = match decode(&payload) {
                    Ok(p) => p,
                    Err(e) => {
                        trace!("Bad relayed packet from {:?}: {}", from, e);
                        continue;
                    }
                };
                if packet.sender() != from {
                    trace!("Relayed packet sender mismatch");
                    continue;
                }
                if let Some(reply) = shared.handle(packet, PeerPath::Relayed(relay_addr)) {
                    if let Err(e) = shared.send(&reply, from, PeerPath::Relayed(relay_addr)).await {
                        debug!("Relayed reply to {:?} failed: {}", from, e);
                    }
                }
            }
        });
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(task);
    }

    /// The relay client, if one is attached
    pub fn relay(&self) -> Option<Arc<RelayClient>> {
        self.shared.relay.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Punch towards `addr` until `remote` acks with a valid proof for
    /// `nonce`. Returns the address the ack came from and the round trip.
    pub async fn probe(
        &self,
        remote: PublicKey,
        addr: SocketAddr,
        nonce: Nonce,
        timeout: Duration,
    ) -> NetworkResult<(SocketAddr, Duration)> {
        let proof = {
            let secret = self
                .shared
                .peers
                .get(&remote)
                .ok_or(NetworkError::PeerNotFound(remote))?;
            HandshakeProof::create(&secret, &self.shared.keys.public, &nonce)
        };

        let (tx, mut rx) = oneshot::channel();
        self.shared.probes.insert((remote, nonce), tx);

        let started = Instant::now();
        let deadline = started + timeout;
        let mut seq = 0u32;

        let outcome = loop {
            let packet = PeerPacket::Punch {
                from: self.shared.keys.public,
                nonce,
                proof,
                seq,
                timestamp: started.elapsed().as_micros() as u64,
            };
            if let Err(e) = self.shared.send(&packet, remote, PeerPath::Direct(addr)).await {
                debug!("Failed to send punch to {}: {}", addr, e);
            }
            seq = seq.wrapping_add(1);

            let next = (Instant::now() + self.shared.config.punch_interval).min(deadline);
            tokio::select! {
                acked = &mut rx => break acked.map_err(|_| NetworkError::Closed),
                _ = tokio::time::sleep_until(next) => {
                    if Instant::now() >= deadline {
                        break Err(NetworkError::Timeout);
                    }
                }
            }
        };

        self.shared.probes.remove(&(remote, nonce));

        let from = outcome?;
        let rtt = started.elapsed();
        info!("Direct path to {:?} via {} ({} punches, {:?})", remote, from, seq, rtt);
        Ok((from, rtt))
    }

    /// Send a keepalive to `peer` over `path`
    pub async fn send_keepalive(&self, peer: PublicKey, path: PeerPath) -> NetworkResult<()> {
        let seq = self.keepalive_seq.fetch_add(1, Ordering::Relaxed);
        let tag = {
            let secret = self
                .shared
                .peers
                .get(&peer)
                .ok_or(NetworkError::PeerNotFound(peer))?;
            HandshakeProof::keepalive(&secret, &self.shared.keys.public, seq, false)
        };
        let packet = PeerPacket::Keepalive {
            from: self.shared.keys.public,
            seq,
            tag,
        };
        self.shared.send(&packet, peer, path).await
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            task.abort();
        }
    }
}

impl Shared {
    /// Process one packet and return the reply to send, if any
    fn handle(&self, packet: PeerPacket, path: PeerPath) -> Option<PeerPacket> {
        let sender = packet.sender();
        let secret = match self.peers.get(&sender) {
            Some(secret) => secret,
            None => {
                trace!("Dropping packet from unauthorized {:?}", sender);
                return None;
            }
        };

        match packet {
            PeerPacket::Punch { nonce, proof, seq, timestamp, .. } => {
                if let Err(e) = proof.check(&secret, &sender, &nonce) {
                    debug!("Rejected punch from {:?}: {}", sender, e);
                    return None;
                }
                trace!("Punch {} from {:?} via {:?}", seq, sender, path);
                Some(PeerPacket::PunchAck {
                    from: self.keys.public,
                    nonce,
                    proof: HandshakeProof::create(&secret, &self.keys.public, &nonce),
                    ack_seq: seq,
                    echo_timestamp: timestamp,
                })
            }
            PeerPacket::PunchAck { nonce, proof, .. } => {
                if !proof.verify(&secret, &sender, &nonce) {
                    debug!("Rejected punch ack from {:?}", sender);
                    return None;
                }
                drop(secret);
                if let (Some((_, tx)), PeerPath::Direct(addr)) = (self.probes.remove(&(sender, nonce)), path) {
                    let _ = tx.send(addr);
                }
                None
            }
            PeerPacket::Keepalive { seq, tag, .. } => {
                if !tag.verify_keepalive(&secret, &sender, seq, false) {
                    debug!("Rejected keepalive from {:?}", sender);
                    return None;
                }
                let reply = PeerPacket::KeepaliveAck {
                    from: self.keys.public,
                    seq,
                    tag: HandshakeProof::keepalive(&secret, &self.keys.public, seq, true),
                };
                drop(secret);
                if !self.advance_keepalive(sender, false, seq) {
                    return None;
                }
                let _ = self.events.send(TransportEvent::Liveness { peer: sender, path });
                Some(reply)
            }
            PeerPacket::KeepaliveAck { seq, tag, .. } => {
                if !tag.verify_keepalive(&secret, &sender, seq, true) {
                    debug!("Rejected keepalive reply from {:?}", sender);
                    return None;
                }
                drop(secret);
                if self.advance_keepalive(sender, true, seq) {
                    let _ = self.events.send(TransportEvent::Liveness { peer: sender, path });
                }
                None
            }
        }
    }

    /// Record `seq` unless an equal or later one was already seen
    fn advance_keepalive(&self, peer: PublicKey, reply: bool, seq: u64) -> bool {
        let mut last = self.keepalive_seen.entry((peer, reply)).or_insert(0);
        if seq <= *last {
            trace!("Stale keepalive {} from {:?}", seq, peer);
            return false;
        }
        *last = seq;
        true
    }

    async fn send(&self, packet: &PeerPacket, peer: PublicKey, path: PeerPath) -> NetworkResult<()> {
        let data = encode(packet)?;
        match path {
            PeerPath::Direct(addr) => {
                self.socket
                    .send_to(&data, addr)
                    .await
                    .map_err(|e| NetworkError::SendError(e.to_string()))?;
                Ok(())
            }
            PeerPath::Relayed(_) => {
                let relay = self
                    .relay
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .ok_or(NetworkError::NotConnected)?;
                relay.send_data(peer, data).await
            }
        }
    }
}

/// Sequence numbers start from the clock so a restarted agent is not
/// taken for a replay
fn initial_keepalive_seq() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(1)
}

async fn udp_loop(shared: Arc<Shared>) {
    let mut buf = [0u8; 2048];
    loop {
        let (len, from) = match shared.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP unreachable shows up here on some platforms
                trace!("Transport receive error: {}", e);
                continue;
            }
        };

        let packet: PeerPacket = match decode(&buf[..len]) {
            Ok(p) => p,
            Err(_) => {
                trace!("Ignoring {} bytes from {}", len, from);
                continue;
            }
        };

        let sender = packet.sender();
        if let Some(reply) = shared.handle(packet, PeerPath::Direct(from)) {
            if let Err(e) = shared.send(&reply, sender, PeerPath::Direct(from)).await {
                debug!("Reply to {} failed: {}", from, e);
            }
        }
    }
}
