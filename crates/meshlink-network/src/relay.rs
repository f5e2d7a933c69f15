//! Relay
//!
//! Forwards peer packets for pairs that could not reach each other
//! directly. An allocation belongs to one side of one pair: the owner
//! allocates towards a remote, and data flows once both sides hold an
//! allocation towards each other.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use meshlink_crypto::PublicKey;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::protocol::{decode, encode, RelayEndpoint};

/// Relay message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Request a slot for `owner` towards `remote`
    Allocate { owner: PublicKey, remote: PublicKey },
    /// Allocation granted
    Allocated { remote: PublicKey, ttl_secs: u32 },
    /// Allocation refused
    Refused { remote: PublicKey, reason: String },
    /// Relayed payload
    Data {
        from: PublicKey,
        to: PublicKey,
        payload: Vec<u8>,
    },
    /// Extend an allocation
    Keepalive { owner: PublicKey, remote: PublicKey },
    /// Drop an allocation
    Release { owner: PublicKey, remote: PublicKey },
}

/// Relay allocation info
#[derive(Debug, Clone)]
struct RelayAllocation {
    client_addr: SocketAddr,
    expires_at: Instant,
    bytes_relayed: u64,
}

impl RelayAllocation {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub max_allocations: usize,
    pub allocation_ttl: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_allocations: 1000,
            allocation_ttl: Duration::from_secs(300),
        }
    }
}

/// Relay statistics
#[derive(Debug, Clone)]
pub struct RelayStats {
    pub active_allocations: usize,
    pub total_bytes_relayed: u64,
}

/// Relay Server - forwards packets between peers
pub struct RelayServer {
    socket: Arc<UdpSocket>,
    /// Allocations by (owner, remote)
    allocations: RwLock<HashMap<(PublicKey, PublicKey), RelayAllocation>>,
    config: RelayServerConfig,
}

impl RelayServer {
    /// Create a new relay server
    pub async fn bind(bind_addr: &str, config: RelayServerConfig) -> NetworkResult<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| NetworkError::BindError(e.to_string()))?;

        info!("Relay server listening on {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            allocations: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Get local address
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until the socket fails
    pub async fn run(self: Arc<Self>) -> NetworkResult<()> {
        let cleaner = {
            let server = Arc::downgrade(&self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                loop {
                    interval.tick().await;
                    let Some(server) = server.upgrade() else { break };
                    server.remove_expired().await;
                }
            })
        };

        let mut buf = [0u8; 65536];
        let result = loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => break Err(NetworkError::ReceiveError(e.to_string())),
            };

            if let Err(e) = self.handle_packet(&buf[..len], from).await {
                trace!("Error handling relay packet from {}: {}", from, e);
            }
        };

        cleaner.abort();
        result
    }

    async fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut allocations = self.allocations.write().await;
        let before = allocations.len();
        allocations.retain(|_, a| !a.is_expired(now));
        let removed = before - allocations.len();
        if removed > 0 {
            info!("Cleaned up {} expired relay allocations", removed);
        }
        removed
    }

    async fn handle_packet(&self, data: &[u8], from: SocketAddr) -> NetworkResult<()> {
        match decode::<RelayMessage>(data)? {
            RelayMessage::Allocate { owner, remote } => self.handle_allocate(owner, remote, from).await,
            RelayMessage::Data { from: sender, to, payload } => {
                self.handle_data(sender, to, payload, from).await
            }
            RelayMessage::Keepalive { owner, remote } => {
                let mut allocations = self.allocations.write().await;
                if let Some(alloc) = allocations.get_mut(&(owner, remote)) {
                    alloc.expires_at = Instant::now() + self.config.allocation_ttl;
                    // NAT rebinding
                    alloc.client_addr = from;
                    trace!("Keepalive from {:?}", owner);
                }
                Ok(())
            }
            RelayMessage::Release { owner, remote } => {
                let mut allocations = self.allocations.write().await;
                if let Some(alloc) = allocations.get(&(owner, remote)) {
                    if alloc.client_addr == from {
                        allocations.remove(&(owner, remote));
                        info!("Released relay slot {:?} -> {:?}", owner, remote);
                    }
                }
                Ok(())
            }
            RelayMessage::Allocated { .. } | RelayMessage::Refused { .. } => Ok(()),
        }
    }

    async fn handle_allocate(&self, owner: PublicKey, remote: PublicKey, from: SocketAddr) -> NetworkResult<()> {
        let mut allocations = self.allocations.write().await;
        let key = (owner, remote);
        let expires_at = Instant::now() + self.config.allocation_ttl;

        if let Some(existing) = allocations.get_mut(&key) {
            existing.client_addr = from;
            existing.expires_at = expires_at;
        } else if allocations.len() >= self.config.max_allocations {
            drop(allocations);
            warn!("Relay at capacity, refusing {:?}", owner);
            let refused = RelayMessage::Refused {
                remote,
                reason: "Relay at capacity".into(),
            };
            return self.send_to(&refused, from).await;
        } else {
            allocations.insert(
                key,
                RelayAllocation {
                    client_addr: from,
                    expires_at,
                    bytes_relayed: 0,
                },
            );
            info!("Allocated relay slot {:?} -> {:?} at {}", owner, remote, from);
        }
        drop(allocations);

        let granted = RelayMessage::Allocated {
            remote,
            ttl_secs: self.config.allocation_ttl.as_secs() as u32,
        };
        self.send_to(&granted, from).await
    }

    async fn handle_data(
        &self,
        sender: PublicKey,
        to: PublicKey,
        payload: Vec<u8>,
        from: SocketAddr,
    ) -> NetworkResult<()> {
        let target = {
            let mut allocations = self.allocations.write().await;
            match allocations.get_mut(&(sender, to)) {
                Some(alloc) if alloc.client_addr == from => {
                    alloc.bytes_relayed += payload.len() as u64;
                }
                _ => {
                    trace!("Data from unallocated {:?} at {}", sender, from);
                    return Ok(());
                }
            }
            match allocations.get_mut(&(to, sender)) {
                Some(alloc) => {
                    alloc.bytes_relayed += payload.len() as u64;
                    alloc.client_addr
                }
                None => {
                    trace!("Target {:?} has no slot towards {:?}", to, sender);
                    return Ok(());
                }
            }
        };

        trace!("Relaying {} bytes {:?} -> {:?}", payload.len(), sender, to);
        self.send_to(&RelayMessage::Data { from: sender, to, payload }, target).await
    }

    async fn send_to(&self, msg: &RelayMessage, addr: SocketAddr) -> NetworkResult<()> {
        let data = encode(msg)?;
        self.socket
            .send_to(&data, addr)
            .await
            .map_err(|e| NetworkError::SendError(e.to_string()))?;
        Ok(())
    }

    /// Get stats
    pub async fn stats(&self) -> RelayStats {
        let allocations = self.allocations.read().await;
        RelayStats {
            active_allocations: allocations.len(),
            total_bytes_relayed: allocations.values().map(|a| a.bytes_relayed).sum(),
        }
    }
}

type AllocationWaiter = oneshot::Sender<Result<(), String>>;

/// Relay Client - one socket per relay server, shared by every pair
pub struct RelayClient {
    socket: Arc<UdpSocket>,
    owner: PublicKey,
    relay_addr: SocketAddr,
    allocation_timeout: Duration,
    /// Remotes we hold a slot towards
    allocated: DashMap<PublicKey, ()>,
    waiters: Arc<DashMap<PublicKey, AllocationWaiter>>,
    data_rx: Mutex<Option<mpsc::Receiver<(PublicKey, Vec<u8>)>>>,
    receiver: JoinHandle<()>,
}

impl RelayClient {
    /// Create a new relay client
    pub async fn connect(owner: PublicKey, relay_addr: SocketAddr) -> NetworkResult<Arc<Self>> {
        let bind_addr = if relay_addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| NetworkError::BindError(e.to_string()))?;
        let socket = Arc::new(socket);

        let waiters: Arc<DashMap<PublicKey, AllocationWaiter>> = Arc::new(DashMap::new());
        let (data_tx, data_rx) = mpsc::channel(1024);

        let receiver = {
            let socket = socket.clone();
            let waiters = waiters.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 65536];
                loop {
                    let (len, from) = match socket.recv_from(&mut buf).await {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("Relay client receive error: {}", e);
                            continue;
                        }
                    };
                    if from != relay_addr {
                        continue;
                    }
                    match decode::<RelayMessage>(&buf[..len]) {
                        Ok(RelayMessage::Allocated { remote, .. }) => {
                            if let Some((_, tx)) = waiters.remove(&remote) {
                                let _ = tx.send(Ok(()));
                            }
                        }
                        Ok(RelayMessage::Refused { remote, reason }) => {
                            if let Some((_, tx)) = waiters.remove(&remote) {
                                let _ = tx.send(Err(reason));
                            }
                        }
                        Ok(RelayMessage::Data { from, payload, .. }) => {
                            if data_tx.try_send((from, payload)).is_err() {
                                debug!("Relay data queue full, dropping packet from {:?}", from);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => trace!("Bad relay packet: {}", e),
                    }
                }
            })
        };

        Ok(Arc::new(Self {
            socket,
            owner,
            relay_addr,
            allocation_timeout: Duration::from_secs(5),
            allocated: DashMap::new(),
            waiters,
            data_rx: Mutex::new(Some(data_rx)),
            receiver,
        }))
    }

    /// Relay server address
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Allocate a slot towards `remote` and return where it reaches us
    pub async fn allocate(&self, remote: PublicKey) -> NetworkResult<RelayEndpoint> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(remote, tx);

        self.send(&RelayMessage::Allocate { owner: self.owner, remote }).await?;

        let outcome = tokio::time::timeout(self.allocation_timeout, rx).await;
        self.waiters.remove(&remote);

        match outcome {
            Ok(Ok(Ok(()))) => {
                self.allocated.insert(remote, ());
                info!("Got relay slot at {} towards {:?}", self.relay_addr, remote);
                Ok(RelayEndpoint {
                    relay_addr: self.relay_addr,
                    peer: self.owner,
                })
            }
            Ok(Ok(Err(reason))) => Err(NetworkError::RelayAllocationFailed(reason)),
            Ok(Err(_)) => Err(NetworkError::Closed),
            Err(_) => Err(NetworkError::RelayAllocationFailed(format!(
                "no answer from {}",
                self.relay_addr
            ))),
        }
    }

    /// Whether we hold a slot towards `remote`
    pub fn is_allocated(&self, remote: &PublicKey) -> bool {
        self.allocated.contains_key(remote)
    }

    /// Send a payload to `to` through the relay
    pub async fn send_data(&self, to: PublicKey, payload: Vec<u8>) -> NetworkResult<()> {
        if !self.is_allocated(&to) {
            return Err(NetworkError::NotConnected);
        }
        self.send(&RelayMessage::Data { from: self.owner, to, payload }).await
    }

    /// Take the stream of relayed payloads. Only the first caller gets it.
    pub fn take_data(&self) -> Option<mpsc::Receiver<(PublicKey, Vec<u8>)>> {
        self.data_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Extend the slot towards `remote`
    pub async fn keepalive(&self, remote: PublicKey) -> NetworkResult<()> {
        self.send(&RelayMessage::Keepalive { owner: self.owner, remote }).await
    }

    /// Release the slot towards `remote`
    pub async fn release(&self, remote: PublicKey) -> NetworkResult<()> {
        self.allocated.remove(&remote);
        self.send(&RelayMessage::Release { owner: self.owner, remote }).await
    }

    async fn send(&self, msg: &RelayMessage) -> NetworkResult<()> {
        let data = encode(msg)?;
        self.socket
            .send_to(&data, self.relay_addr)
            .await
            .map_err(|e| NetworkError::SendError(e.to_string()))?;
        Ok(())
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}
