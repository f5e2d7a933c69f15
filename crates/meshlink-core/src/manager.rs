//! Tunnel Session Manager
//!
//! Keeps one session and one negotiator per desired peer. The desired set
//! comes from the network map; the manager reconciles towards it on a
//! timer and whenever it changes, supervises established sessions with
//! keepalives and restarts negotiation when a path dies.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use meshlink_control::model::NetworkMap;
use meshlink_control::PeerId;
use meshlink_crypto::PublicKey;
use meshlink_network::protocol::decode;
use meshlink_network::{NegotiationMessage, PeerPath, PeerTransport, SignalEnvelope};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::CoreResult;
use crate::negotiator::{
    NegotiatorDeps, NegotiatorHandle, NegotiatorInbox, NegotiatorUpdate, PairNegotiator, Report,
};
use crate::session::{SessionInfo, SessionState, SessionTable};

/// Grace period for a negotiator to signal teardown on the way out
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Local tunnel resources for established sessions
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Accept handshakes and keepalives from `peer`
    async fn authorize(&self, peer: PublicKey) -> CoreResult<()>;

    /// Install the tunnel for an established path
    async fn install(&self, peer: PublicKey, path: PeerPath) -> CoreResult<()>;

    /// Remove the tunnel but keep accepting handshakes
    async fn uninstall(&self, peer: PublicKey) -> CoreResult<()>;

    /// Remove everything held for `peer`
    async fn forget(&self, peer: PublicKey) -> CoreResult<()>;

    /// Send one keepalive over `path`
    async fn keepalive(&self, peer: PublicKey, path: PeerPath) -> CoreResult<()>;
}

/// Backend on top of the UDP peer transport
pub struct TransportBackend {
    transport: Arc<PeerTransport>,
    installed: DashMap<PublicKey, PeerPath>,
}

impl TransportBackend {
    pub fn new(transport: Arc<PeerTransport>) -> Self {
        Self {
            transport,
            installed: DashMap::new(),
        }
    }

    /// Paths currently installed
    pub fn installed(&self) -> BTreeMap<PublicKey, PeerPath> {
        self.installed.iter().map(|e| (*e.key(), *e.value())).collect()
    }
}

#[async_trait]
impl TunnelBackend for TransportBackend {
    async fn authorize(&self, peer: PublicKey) -> CoreResult<()> {
        self.transport.authorize(peer);
        Ok(())
    }

    async fn install(&self, peer: PublicKey, path: PeerPath) -> CoreResult<()> {
        debug!("Installing tunnel to {} via {:?}", peer.short(), path);
        self.installed.insert(peer, path);
        Ok(())
    }

    async fn uninstall(&self, peer: PublicKey) -> CoreResult<()> {
        if self.installed.remove(&peer).is_some() {
            debug!("Removed tunnel to {}", peer.short());
        }
        Ok(())
    }

    async fn forget(&self, peer: PublicKey) -> CoreResult<()> {
        self.installed.remove(&peer);
        self.transport.forget(&peer);
        Ok(())
    }

    async fn keepalive(&self, peer: PublicKey, path: PeerPath) -> CoreResult<()> {
        if let PeerPath::Relayed(_) = path {
            if let Some(relay) = self.transport.relay() {
                relay.keepalive(peer).await?;
            }
        }
        self.transport.send_keepalive(peer, path).await?;
        Ok(())
    }
}

/// A peer we want a session with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredPeer {
    pub public_key: PublicKey,
    pub peer_id: PeerId,
    pub hostname: String,
}

/// Desired peers of a network map: peers sharing a group with us plus the
/// gateways our routes point at, never ourselves
pub fn desired_peers(map: &NetworkMap) -> Vec<DesiredPeer> {
    let me = &map.peer;
    let desired: BTreeMap<PublicKey, DesiredPeer> = map
        .remote_peers
        .iter()
        .filter(|r| r.id != me.id && r.public_key != me.public_key)
        .map(|r| {
            (
                r.public_key,
                DesiredPeer {
                    public_key: r.public_key,
                    peer_id: r.id.clone(),
                    hostname: r.hostname.clone(),
                },
            )
        })
        .collect();

    for gateway in map.routes.remote_gateways(&me.id) {
        if !desired.values().any(|d| &d.peer_id == gateway) {
            warn!("Route gateway {} missing from the remote peers of map {}", gateway, map.serial);
        }
    }

    desired.into_values().collect()
}

/// What one reconcile pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<PublicKey>,
    pub stopped: Vec<PublicKey>,
    pub failed: Vec<PublicKey>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.failed.is_empty()
    }
}

/// Tunnel Session Manager
pub struct TunnelSessionManager {
    local: PublicKey,
    config: SessionConfig,
    deps: NegotiatorDeps,
    backend: Arc<dyn TunnelBackend>,
    sessions: SessionTable,
    negotiators: DashMap<PublicKey, NegotiatorHandle>,
    desired: RwLock<BTreeMap<PublicKey, DesiredPeer>>,
    changed: Notify,
    updates_tx: mpsc::Sender<NegotiatorUpdate>,
    updates_rx: Mutex<Option<mpsc::Receiver<NegotiatorUpdate>>>,
    cancel: CancellationToken,
}

impl TunnelSessionManager {
    pub fn new(config: SessionConfig, deps: NegotiatorDeps, backend: Arc<dyn TunnelBackend>) -> Arc<Self> {
        let (updates_tx, updates_rx) = mpsc::channel(256);
        Arc::new(Self {
            local: deps.local,
            config,
            deps,
            backend,
            sessions: SessionTable::new(),
            negotiators: DashMap::new(),
            desired: RwLock::new(BTreeMap::new()),
            changed: Notify::new(),
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_key(&self) -> PublicKey {
        self.local
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Replace the desired peer set and reconcile soon
    pub fn set_desired(&self, peers: impl IntoIterator<Item = DesiredPeer>) {
        let next: BTreeMap<PublicKey, DesiredPeer> = peers
            .into_iter()
            .filter(|p| p.public_key != self.local)
            .map(|p| (p.public_key, p))
            .collect();

        let mut desired = self.desired.write().unwrap_or_else(|e| e.into_inner());
        if *desired != next {
            debug!("Desired peers: {} -> {}", desired.len(), next.len());
            *desired = next;
            drop(desired);
            self.changed.notify_one();
        }
    }

    pub fn desired(&self) -> Vec<DesiredPeer> {
        self.desired.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    fn desired_keys(&self) -> BTreeSet<PublicKey> {
        self.desired.read().unwrap_or_else(|e| e.into_inner()).keys().copied().collect()
    }

    fn is_desired(&self, peer: &PublicKey) -> bool {
        self.desired.read().unwrap_or_else(|e| e.into_inner()).contains_key(peer)
    }

    /// Established peers
    pub fn connected_peers(&self) -> Vec<PublicKey> {
        self.sessions.active().iter().map(|s| s.remote()).collect()
    }

    pub fn session_info(&self) -> BTreeMap<PublicKey, SessionInfo> {
        self.sessions.snapshot()
    }

    fn inbox(&self, peer: &PublicKey) -> Option<NegotiatorInbox> {
        self.negotiators.get(peer).map(|h| h.inbox())
    }

    /// Record liveness seen from `peer`
    pub fn observe_liveness(&self, peer: &PublicKey) {
        if let Some(session) = self.sessions.get(peer) {
            if session.state() == SessionState::Established {
                session.touch();
                trace!("Liveness from {}", peer.short());
            }
        }
    }

    /// Route a signal envelope to the negotiator of its sender
    pub async fn handle_signal(&self, envelope: SignalEnvelope) {
        let msg: NegotiationMessage = match decode(&envelope.payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Undecodable signal from {}: {}", envelope.from.short(), e);
                return;
            }
        };
        match self.inbox(&envelope.from) {
            Some(inbox) => inbox.deliver(msg).await,
            None => trace!("Signal from undesired peer {}", envelope.from.short()),
        }
    }

    /// Apply a negotiator outcome to the session
    pub async fn handle_update(&self, update: NegotiatorUpdate) {
        let peer = update.peer;
        if !self.negotiators.contains_key(&peer) {
            trace!("Update from a stopped negotiator for {}", peer.short());
            return;
        }
        let session = self.sessions.open(self.local, peer);

        match update.report {
            Report::Established(path) => {
                if session.state() == SessionState::Established {
                    session.reconnect();
                }
                if session.establish(path) {
                    if let Err(e) = self.backend.install(peer, path).await {
                        warn!("Failed to install tunnel to {}: {}", peer.short(), e);
                    }
                    info!("Session with {} established ({:?})", peer.short(), session.mode());
                }
            }
            Report::Lost => {
                if session.reconnect() {
                    if let Err(e) = self.backend.uninstall(peer).await {
                        warn!("Failed to remove tunnel to {}: {}", peer.short(), e);
                    }
                }
            }
            Report::Failed { attempt, retry_in } => {
                debug!("Negotiation with {} failed ({}), retry in {:?}", peer.short(), attempt, retry_in);
            }
        }
    }

    /// Fail established sessions that stopped answering. Each one is
    /// removed from the active set and renegotiated if still desired.
    pub async fn check_liveness(&self) -> Vec<PublicKey> {
        let timeout = self.config.keepalive_timeout();
        let mut failed = Vec::new();

        for session in self.sessions.active() {
            if !session.is_stale(timeout) {
                continue;
            }
            if !session.transition(SessionState::Established, SessionState::Failed) {
                continue;
            }
            let peer = session.remote();
            warn!("Session with {} missed keepalives for {:?}", peer.short(), timeout);

            if let Err(e) = self.backend.uninstall(peer).await {
                warn!("Failed to remove tunnel to {}: {}", peer.short(), e);
            }
            self.sessions.remove(&peer);

            if self.is_desired(&peer) {
                self.sessions.open(self.local, peer);
                if let Some(inbox) = self.inbox(&peer) {
                    inbox.path_lost().await;
                }
            }
            failed.push(peer);
        }
        failed
    }

    /// Keepalive every established session
    pub async fn send_keepalives(&self) {
        for session in self.sessions.active() {
            let Some(path) = session.path() else { continue };
            if let Err(e) = self.backend.keepalive(session.remote(), path).await {
                debug!("Keepalive to {} failed: {}", session.remote().short(), e);
            }
        }
    }

    /// Start negotiators for new peers, tear down the ones no longer wanted
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport {
            failed: self.check_liveness().await,
            ..Default::default()
        };

        let desired = self.desired_keys();

        // A negotiator that died on its own is restarted below
        self.negotiators.retain(|_, h| !h.is_finished());
        let running: BTreeSet<PublicKey> = self.negotiators.iter().map(|h| *h.key()).collect();

        for peer in desired.difference(&running) {
            if let Err(e) = self.backend.authorize(*peer).await {
                warn!("Failed to authorize {}: {}", peer.short(), e);
                continue;
            }
            self.sessions.open(self.local, *peer);
            let handle = PairNegotiator::spawn(
                *peer,
                self.deps.clone(),
                self.updates_tx.clone(),
                self.cancel.child_token(),
            );
            self.negotiators.insert(*peer, handle);
            report.started.push(*peer);
        }

        for peer in running.difference(&desired) {
            self.teardown(peer).await;
            report.stopped.push(*peer);
        }

        if !report.is_empty() {
            info!(
                "Reconciled: {} started, {} stopped, {} failed ({} desired)",
                report.started.len(),
                report.stopped.len(),
                report.failed.len(),
                desired.len()
            );
        }
        report
    }

    /// Cancel the negotiator, signal teardown, release the relay slot and
    /// remove local tunnel resources
    pub async fn teardown(&self, peer: &PublicKey) {
        if let Some((_, handle)) = self.negotiators.remove(peer) {
            handle.shutdown(TEARDOWN_GRACE).await;
        }
        if let Some(session) = self.sessions.remove(peer) {
            let previous = session.close();
            debug!("Session with {} closed from {}", peer.short(), previous);
        }
        if let Err(e) = self.backend.forget(*peer).await {
            warn!("Failed to remove tunnel to {}: {}", peer.short(), e);
        }
        info!("Tore down session with {}", peer.short());
    }

    /// Tear down every session
    pub async fn shutdown(&self) {
        let peers: Vec<PublicKey> = self.negotiators.iter().map(|h| *h.key()).collect();
        for peer in peers {
            self.teardown(&peer).await;
        }
        self.cancel.cancel();
    }

    /// Run the reconcile loop, the keepalive loop, the update consumer and
    /// the signal dispatcher until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(updates) = self.updates_rx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            warn!("Session manager is already running");
            return;
        };
        info!("Session manager started");

        let tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(self.clone().update_loop(updates, cancel.clone())),
            tokio::spawn(self.clone().keepalive_loop(cancel.clone())),
            tokio::spawn(self.clone().signal_loop(cancel.clone())),
        ];

        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.changed.notified() => {}
            }
            self.reconcile().await;
        }

        for task in tasks {
            task.abort();
        }
        self.shutdown().await;
        info!("Session manager stopped");
    }

    async fn update_loop(self: Arc<Self>, mut updates: mpsc::Receiver<NegotiatorUpdate>, cancel: CancellationToken) {
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            self.handle_update(update).await;
        }
    }

    async fn keepalive_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.keepalive_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.send_keepalives().await;
            self.check_liveness().await;
        }
    }

    async fn signal_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let mut stream = self.deps.signal.subscribe(self.local);
            loop {
                let envelope = tokio::select! {
                    _ = cancel.cancelled() => return,
                    envelope = stream.next() => envelope,
                };
                match envelope {
                    Some(envelope) => self.handle_signal(envelope).await,
                    None => break,
                }
            }
            debug!("Signal subscription ended, subscribing again");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }
}
