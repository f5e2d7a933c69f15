//! Agent engine
//!
//! Wires the peer transport, the signal client, the relay client and the
//! Tunnel Session Manager together, and applies the network maps pushed by
//! the control plane.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::IpNet;
use meshlink_control::{AgentStatusReport, NetworkMap, PeerId};
use meshlink_crypto::{KeyPair, PublicKey};
use meshlink_network::candidates::gather;
use meshlink_network::{
    Candidate, PeerTransport, RelayClient, SignalChannel, SignalClient, SignalConfig, TransportConfig,
    TransportEvent,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::manager::{desired_peers, TransportBackend, TunnelSessionManager};
use crate::negotiator::{DirectProber, NegotiatorDeps, RelayAllocator};
use crate::routes::{ApplyOutcome, LocalRoutes, RouteApplier};
use crate::session::{SessionState, TransportMode};

/// How long to wait for the signal server to report our public address
const OBSERVED_WAIT: Duration = Duration::from_secs(2);

/// Candidate refresh period
const CANDIDATE_REFRESH: Duration = Duration::from_secs(30);

/// How long `stop` waits for sessions to tear down
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Agent state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Where the agent listens and which servers it uses
#[derive(Clone)]
pub struct AgentSetup {
    pub keys: KeyPair,
    /// Peer transport bind address
    pub listen_addr: SocketAddr,
    pub signal_server: SocketAddr,
    pub relay_server: Option<SocketAddr>,
    pub signal: SignalConfig,
    /// Advertise exactly these candidates instead of discovering them
    pub candidates: Option<Vec<Candidate>>,
}

/// One session as shown by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub public_key: PublicKey,
    pub peer_id: Option<PeerId>,
    pub hostname: Option<String>,
    pub state: SessionState,
    pub mode: Option<TransportMode>,
    pub last_keepalive_secs: u64,
}

/// Agent status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub state: AgentState,
    pub public_key: PublicKey,
    pub peer_id: Option<PeerId>,
    pub overlay_ip: Option<IpAddr>,
    /// Serial of the applied network map
    pub serial: u64,
    pub connected_peers: usize,
    pub total_peers: usize,
    /// Destinations reachable through the mesh
    pub networks: Vec<IpNet>,
    /// Every route of the applied map is installed
    pub routes_converged: bool,
    pub sessions: Vec<PeerStatus>,
    pub uptime_secs: u64,
}

impl AgentStatus {
    /// Running with every route installed
    pub fn is_healthy(&self) -> bool {
        self.state == AgentState::Running && self.routes_converged
    }
}

/// Components alive while the agent runs
struct Runtime {
    transport: Arc<PeerTransport>,
    manager: Arc<TunnelSessionManager>,
    candidates: watch::Receiver<Vec<Candidate>>,
    cancel: CancellationToken,
    manager_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

/// The agent
pub struct Agent {
    setup: AgentSetup,
    config: CoreConfig,
    state: RwLock<AgentState>,
    start_time: RwLock<Option<Instant>>,
    runtime: Mutex<Option<Runtime>>,
    routes: LocalRoutes,
    applier: Arc<dyn RouteApplier>,
    map: RwLock<Option<NetworkMap>>,
}

impl Agent {
    /// Create a stopped agent
    pub fn new(setup: AgentSetup, config: CoreConfig, applier: Arc<dyn RouteApplier>) -> CoreResult<Arc<Self>> {
        config.validate().map_err(CoreError::Config)?;

        Ok(Arc::new(Self {
            setup,
            config,
            state: RwLock::new(AgentState::Stopped),
            start_time: RwLock::new(None),
            runtime: Mutex::new(None),
            routes: LocalRoutes::new(),
            applier,
            map: RwLock::new(None),
        }))
    }

    pub fn public_key(&self) -> PublicKey {
        self.setup.keys.public
    }

    pub async fn state(&self) -> AgentState {
        *self.state.read().await
    }

    /// Start the agent
    pub async fn start(self: &Arc<Self>) -> CoreResult<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            debug!("Agent already running");
            return Ok(());
        }

        info!("Starting agent {}", self.public_key().short());
        *self.state.write().await = AgentState::Starting;

        match self.launch().await {
            Ok(started) => {
                *runtime = Some(started);
                *self.start_time.write().await = Some(Instant::now());
                *self.state.write().await = AgentState::Running;
            }
            Err(e) => {
                warn!("Agent failed to start: {}", e);
                *self.state.write().await = AgentState::Error;
                return Err(e);
            }
        }
        drop(runtime);

        // Re-apply the map we held while stopped
        let map = self.map.read().await.clone();
        if let Some(map) = map {
            self.apply_map(map).await;
        }

        info!("Agent started");
        Ok(())
    }

    async fn launch(&self) -> CoreResult<Runtime> {
        let local = self.public_key();

        let transport = PeerTransport::bind(
            self.setup.listen_addr,
            self.setup.keys.clone(),
            TransportConfig::default(),
        )
        .await?;
        let local_addr = transport.local_addr()?;
        info!("Peer transport bound to {}", local_addr);

        let signal = SignalClient::connect(self.setup.signal_server, local, self.setup.signal.clone()).await?;

        let relay = match self.setup.relay_server {
            Some(addr) => {
                let relay = RelayClient::connect(local, addr).await?;
                transport.attach_relay(relay.clone());
                info!("Using relay {}", addr);
                Some(relay)
            }
            None => None,
        };

        let discover = self.setup.candidates.is_none();
        let initial = match &self.setup.candidates {
            Some(fixed) => fixed.clone(),
            None => {
                let observed = match signal.wait_observed(OBSERVED_WAIT).await {
                    Ok(addr) => Some(addr),
                    Err(e) => {
                        debug!("No observed address from signal server: {}", e);
                        None
                    }
                };
                gather(local_addr, observed)
            }
        };
        debug!("Advertising {} candidates", initial.len());
        let (candidates_tx, candidates) = watch::channel(initial);

        let deps = NegotiatorDeps {
            local,
            signal: signal.clone() as Arc<dyn SignalChannel>,
            prober: transport.clone() as Arc<dyn DirectProber>,
            relay: relay.map(|r| r as Arc<dyn RelayAllocator>),
            candidates: candidates.clone(),
            config: self.config.negotiator.clone(),
        };
        let backend = Arc::new(TransportBackend::new(transport.clone()));
        let manager = TunnelSessionManager::new(self.config.session.clone(), deps, backend);

        let cancel = CancellationToken::new();
        let manager_task = tokio::spawn(manager.clone().run(cancel.clone()));

        let mut tasks = vec![tokio::spawn(forward_liveness(
            transport.events(),
            manager.clone(),
            cancel.clone(),
        ))];
        if discover {
            tasks.push(tokio::spawn(refresh_candidates(
                signal,
                local_addr,
                candidates_tx,
                cancel.clone(),
            )));
        }

        Ok(Runtime {
            transport,
            manager,
            candidates,
            cancel,
            manager_task,
            tasks,
        })
    }

    /// Stop the agent and remove its routes. The last network map is kept
    /// and re-applied on the next start.
    pub async fn stop(&self) -> CoreResult<()> {
        let Some(runtime) = self.runtime.lock().await.take() else {
            return Err(CoreError::NotRunning);
        };

        info!("Stopping agent");
        *self.state.write().await = AgentState::Stopping;

        runtime.cancel.cancel();
        let mut manager_task = runtime.manager_task;
        if tokio::time::timeout(STOP_GRACE, &mut manager_task).await.is_err() {
            warn!("Session manager did not stop in time");
            manager_task.abort();
        }
        for task in runtime.tasks {
            task.abort();
        }
        drop(runtime.transport);

        let outcome = self.routes.clear(self.applier.as_ref()).await;
        if !outcome.converged() {
            warn!("{} routes could not be removed", outcome.failed.len());
        }

        *self.start_time.write().await = None;
        *self.state.write().await = AgentState::Stopped;
        info!("Agent stopped");
        Ok(())
    }

    /// Apply a network map: converge local routes and hand the desired peer
    /// set to the session manager. Older maps are ignored.
    pub async fn apply_map(&self, map: NetworkMap) -> ApplyOutcome {
        // Held until the map is stored so concurrent applies serialize
        let mut current = self.map.write().await;
        if let Some(held) = current.as_ref() {
            if map.serial < held.serial {
                debug!("Ignoring map {} older than {}", map.serial, held.serial);
                return ApplyOutcome::default();
            }
        }

        info!(
            "Applying network map {}: {} peers, {} routes",
            map.serial,
            map.remote_peers.len(),
            map.routes.len()
        );

        let manager = self.manager().await;
        let outcome = if manager.is_some() {
            self.routes.apply(&map.routes, self.applier.as_ref()).await
        } else {
            ApplyOutcome::default()
        };
        if let Some(manager) = manager {
            manager.set_desired(desired_peers(&map));
        }

        *current = Some(map);
        outcome
    }

    /// Last applied network map
    pub async fn network_map(&self) -> Option<NetworkMap> {
        self.map.read().await.clone()
    }

    /// Serial of the last applied map, 0 before the first
    pub async fn serial(&self) -> u64 {
        self.map.read().await.as_ref().map_or(0, |m| m.serial)
    }

    /// Candidates we currently advertise
    pub async fn candidates(&self) -> Vec<Candidate> {
        match self.runtime.lock().await.as_ref() {
            Some(runtime) => runtime.candidates.borrow().clone(),
            None => Vec::new(),
        }
    }

    /// Local peer transport address, while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let runtime = self.runtime.lock().await;
        runtime.as_ref().and_then(|r| r.transport.local_addr().ok())
    }

    async fn manager(&self) -> Option<Arc<TunnelSessionManager>> {
        self.runtime.lock().await.as_ref().map(|r| r.manager.clone())
    }

    /// Current status
    pub async fn status(&self) -> AgentStatus {
        let state = self.state().await;
        let map = self.map.read().await.clone();
        let manager = self.manager().await;
        let uptime_secs = self
            .start_time
            .read()
            .await
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);

        let known: BTreeMap<PublicKey, (PeerId, String)> = map
            .iter()
            .flat_map(|m| m.remote_peers.iter())
            .map(|r| (r.public_key, (r.id.clone(), r.hostname.clone())))
            .collect();

        let sessions: Vec<PeerStatus> = manager
            .as_ref()
            .map(|m| m.session_info())
            .unwrap_or_default()
            .into_values()
            .map(|info| {
                let known = known.get(&info.peer);
                PeerStatus {
                    public_key: info.peer,
                    peer_id: known.map(|k| k.0.clone()),
                    hostname: known.map(|k| k.1.clone()),
                    state: info.state,
                    mode: info.mode,
                    last_keepalive_secs: info.last_keepalive_secs,
                }
            })
            .collect();

        let total_peers = match (&manager, &map) {
            (Some(manager), _) => manager.desired().len(),
            (None, Some(map)) => desired_peers(map).len(),
            (None, None) => 0,
        };

        AgentStatus {
            state,
            public_key: self.public_key(),
            peer_id: map.as_ref().map(|m| m.peer.id.clone()),
            overlay_ip: map.as_ref().map(|m| m.peer.overlay_ip),
            serial: map.as_ref().map_or(0, |m| m.serial),
            connected_peers: sessions.iter().filter(|s| s.state == SessionState::Established).count(),
            total_peers,
            networks: map
                .as_ref()
                .map(|m| m.routes.iter().map(|e| e.cidr).collect())
                .unwrap_or_default(),
            routes_converged: self.routes.converged(),
            sessions,
            uptime_secs,
        }
    }

    /// Status in the shape the management server accepts
    pub async fn status_report(&self) -> AgentStatusReport {
        let status = self.status().await;
        AgentStatusReport {
            up: status.state == AgentState::Running,
            connected_peers: status
                .sessions
                .iter()
                .filter(|s| s.state == SessionState::Established)
                .filter_map(|s| s.peer_id.clone())
                .collect(),
            total_peers: status.total_peers,
            networks: status.networks,
        }
    }
}

async fn forward_liveness(
    mut events: broadcast::Receiver<TransportEvent>,
    manager: Arc<TunnelSessionManager>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(TransportEvent::Liveness { peer, .. }) => manager.observe_liveness(&peer),
            Err(broadcast::error::RecvError::Lagged(n)) => debug!("Missed {} transport events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Re-gather candidates when the address seen by the signal server changes
async fn refresh_candidates(
    signal: Arc<SignalClient>,
    local_addr: SocketAddr,
    candidates: watch::Sender<Vec<Candidate>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(CANDIDATE_REFRESH);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let next = gather(local_addr, signal.observed_addr());
        candidates.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!("Address candidates changed: {} -> {}", current.len(), next.len());
            *current = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::LoggingApplier;
    use meshlink_control::model::{PeerConfig, RouteTable};

    fn setup() -> AgentSetup {
        AgentSetup {
            keys: KeyPair::generate(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            signal_server: "127.0.0.1:9".parse().unwrap(),
            relay_server: None,
            signal: SignalConfig::default(),
            candidates: Some(Vec::new()),
        }
    }

    fn map(serial: u64, hostname: &str) -> NetworkMap {
        NetworkMap {
            serial,
            peer: PeerConfig {
                id: "me".into(),
                public_key: KeyPair::generate().public,
                hostname: hostname.into(),
                overlay_ip: "100.64.0.1".parse().unwrap(),
                network_range: "100.64.0.0/24".parse().unwrap(),
            },
            remote_peers: Vec::new(),
            routes: RouteTable::default(),
        }
    }

    #[tokio::test]
    async fn test_older_map_never_replaces_newer() {
        let agent = Agent::new(setup(), CoreConfig::default(), Arc::new(LoggingApplier)).unwrap();

        let (a, b) = (agent.clone(), agent.clone());
        tokio::join!(a.apply_map(map(7, "newer")), b.apply_map(map(3, "older")));
        assert_eq!(agent.serial().await, 7);

        agent.apply_map(map(5, "stale")).await;
        let held = agent.network_map().await.unwrap();
        assert_eq!(held.serial, 7);
        assert_eq!(held.peer.hostname, "newer");

        // Same serial is re-applied, as on restart
        agent.apply_map(map(7, "again")).await;
        assert_eq!(agent.network_map().await.unwrap().peer.hostname, "again");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = CoreConfig::default();
        config.session.keepalive_misses = 0;
        assert!(matches!(
            Agent::new(setup(), config, Arc::new(LoggingApplier)),
            Err(CoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_stopped_status() {
        let agent = Agent::new(setup(), CoreConfig::default(), Arc::new(LoggingApplier)).unwrap();
        let status = agent.status().await;
        assert_eq!(status.state, AgentState::Stopped);
        assert_eq!(status.total_peers, 0);
        assert!(!status.is_healthy());
        assert!(matches!(agent.stop().await, Err(CoreError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_stop() {
        let agent = Agent::new(setup(), CoreConfig::fast(), Arc::new(LoggingApplier)).unwrap();
        agent.start().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Running);
        assert!(agent.local_addr().await.is_some());

        // Starting twice is a no-op
        agent.start().await.unwrap();

        agent.stop().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Stopped);
        assert!(agent.local_addr().await.is_none());
    }
}
