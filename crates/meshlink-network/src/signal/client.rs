//! Signal Client
//!
//! Talks to a `SignalServer` over UDP. Sends are retransmitted until the
//! server acks them, and the server does the same with deliveries, so a
//! receiver may see the same payload more than once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream;
use meshlink_crypto::PublicKey;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{SignalChannel, SignalConfig, SignalStream};
use crate::error::{NetworkError, NetworkResult};
use crate::protocol::{decode, encode, SignalEnvelope, SignalMessage};

type AckSender = oneshot::Sender<Result<(), String>>;

/// Receiving half handed out by `subscribe`
struct Inbox {
    tx: mpsc::Sender<SignalEnvelope>,
    /// Receiver created at connect time, before anyone subscribed
    initial: Option<mpsc::Receiver<SignalEnvelope>>,
}

/// UDP signal client
pub struct SignalClient {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    local_key: PublicKey,
    config: SignalConfig,
    next_id: AtomicU64,
    pending: Arc<DashMap<u64, AckSender>>,
    inbox: Arc<Mutex<Inbox>>,
    observed: watch::Receiver<Option<SocketAddr>>,
    resubscribe: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalClient {
    /// Bind a local socket and subscribe `local_key` at `server_addr`
    pub async fn connect(
        server_addr: SocketAddr,
        local_key: PublicKey,
        config: SignalConfig,
    ) -> NetworkResult<Arc<Self>> {
        let bind_addr = if server_addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| NetworkError::BindError(e.to_string()))?;
        let socket = Arc::new(socket);

        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let inbox = Arc::new(Mutex::new(Inbox { tx, initial: Some(rx) }));
        let pending: Arc<DashMap<u64, AckSender>> = Arc::new(DashMap::new());
        let (observed_tx, observed) = watch::channel(None);
        let resubscribe = Arc::new(Notify::new());

        let receiver = tokio::spawn(recv_loop(
            socket.clone(),
            server_addr,
            pending.clone(),
            inbox.clone(),
            observed_tx,
        ));

        let subscriber = {
            let socket = socket.clone();
            let resubscribe = resubscribe.clone();
            let period = config.resubscribe_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = resubscribe.notified() => {}
                    }
                    let msg = SignalMessage::Subscribe { peer: local_key };
                    match encode(&msg) {
                        Ok(data) => {
                            if let Err(e) = socket.send_to(&data, server_addr).await {
                                debug!("Subscribe to {} failed: {}", server_addr, e);
                            }
                        }
                        Err(e) => warn!("Failed to encode subscribe: {}", e),
                    }
                }
            })
        };

        info!("Signal client for {:?} using server {}", local_key, server_addr);

        Ok(Arc::new(Self {
            socket,
            server_addr,
            local_key,
            config,
            next_id: AtomicU64::new(1),
            pending,
            inbox,
            observed,
            resubscribe,
            tasks: vec![receiver, subscriber],
        }))
    }

    /// Key this client is subscribed under
    pub fn local_key(&self) -> PublicKey {
        self.local_key
    }

    /// Our address as seen by the server, once it answered a subscribe
    pub fn observed_addr(&self) -> Option<SocketAddr> {
        *self.observed.borrow()
    }

    /// Wait until the server reported our observed address
    pub async fn wait_observed(&self, timeout: std::time::Duration) -> NetworkResult<SocketAddr> {
        let mut observed = self.observed.clone();
        let wait = async {
            loop {
                let current = *observed.borrow_and_update();
                if let Some(addr) = current {
                    return Ok(addr);
                }
                if observed.changed().await.is_err() {
                    return Err(NetworkError::Closed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| NetworkError::Timeout)?
    }

    /// Ask the subscribe loop to refresh now
    pub fn resubscribe_now(&self) {
        self.resubscribe.notify_one();
    }
}

#[async_trait]
impl SignalChannel for SignalClient {
    async fn send(&self, from: PublicKey, to: PublicKey, payload: Vec<u8>) -> NetworkResult<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let data = encode(&SignalMessage::Send {
            id,
            envelope: SignalEnvelope { from, to, payload },
        })?;

        for attempt in 1..=self.config.send_attempts.max(1) {
            let (tx, rx) = oneshot::channel();
            self.pending.insert(id, tx);

            self.socket
                .send_to(&data, self.server_addr)
                .await
                .map_err(|e| NetworkError::SendError(e.to_string()))?;

            match tokio::time::timeout(self.config.ack_timeout, rx).await {
                Ok(Ok(Ok(()))) => {
                    trace!("Signal {} to {:?} acked on attempt {}", id, to, attempt);
                    return Ok(());
                }
                Ok(Ok(Err(message))) => {
                    debug!("Signal {} refused: {}", id, message);
                    self.resubscribe_now();
                }
                Ok(Err(_)) | Err(_) => {
                    trace!("No ack for signal {} (attempt {})", id, attempt);
                }
            }
        }

        self.pending.remove(&id);
        Err(NetworkError::SignalExpired(to))
    }

    fn subscribe(&self, peer: PublicKey) -> SignalStream {
        if peer != self.local_key {
            warn!("Signal client for {:?} cannot subscribe {:?}", self.local_key, peer);
            return Box::pin(stream::empty());
        }

        let rx = {
            let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
            match inbox.initial.take() {
                Some(rx) => rx,
                None => {
                    // Replacing the sender ends the previous stream
                    let (tx, rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
                    inbox.tx = tx;
                    rx
                }
            }
        };
        self.resubscribe_now();

        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|envelope| (envelope, rx))
        }))
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    pending: Arc<DashMap<u64, AckSender>>,
    inbox: Arc<Mutex<Inbox>>,
    observed: watch::Sender<Option<SocketAddr>>,
) {
    let mut buf = [0u8; 65536];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("Signal client receive error: {}", e);
                continue;
            }
        };
        if from != server_addr {
            trace!("Ignoring packet from {}", from);
            continue;
        }

        let msg: SignalMessage = match decode(&buf[..len]) {
            Ok(m) => m,
            Err(e) => {
                debug!("Bad signal packet: {}", e);
                continue;
            }
        };

        match msg {
            SignalMessage::SubscribeAck { observed_addr } => {
                observed.send_if_modified(|current| {
                    if *current != Some(observed_addr) {
                        info!("Signal server sees us at {}", observed_addr);
                        *current = Some(observed_addr);
                        true
                    } else {
                        false
                    }
                });
            }
            SignalMessage::SendAck { id } => {
                if let Some((_, tx)) = pending.remove(&id) {
                    let _ = tx.send(Ok(()));
                }
            }
            SignalMessage::Error { id: Some(id), message } => {
                if let Some((_, tx)) = pending.remove(&id) {
                    let _ = tx.send(Err(message));
                }
            }
            SignalMessage::Error { id: None, message } => {
                warn!("Signal server error: {}", message);
            }
            SignalMessage::Deliver { id, envelope } => {
                match encode(&SignalMessage::DeliverAck { peer: envelope.to, id }) {
                    Ok(ack) => {
                        if let Err(e) = socket.send_to(&ack, server_addr).await {
                            debug!("Delivery ack to {} failed: {}", server_addr, e);
                        }
                    }
                    Err(e) => warn!("Failed to encode delivery ack: {}", e),
                }
                let tx = inbox.lock().unwrap_or_else(|e| e.into_inner()).tx.clone();
                if let Err(e) = tx.try_send(envelope) {
                    debug!("Dropping signal delivery: {}", e);
                }
            }
            SignalMessage::Subscribe { .. } | SignalMessage::Send { .. } | SignalMessage::DeliverAck { .. } => {
                trace!("Unexpected request from server");
            }
        }
    }
}
