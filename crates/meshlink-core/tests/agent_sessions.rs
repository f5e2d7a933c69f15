use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use meshlink_control::model::{PeerConfig, RemotePeer};
use meshlink_control::{NetworkMap, RouteEntry, RouteTable};
use meshlink_core::{
    Agent, AgentSetup, AgentState, CoreConfig, LoggingApplier, SessionState, TransportMode,
};
use meshlink_crypto::{KeyPair, PublicKey};
use meshlink_network::{
    Candidate, RelayServer, RelayServerConfig, SignalConfig, SignalServer,
};

const DEADLINE: Duration = Duration::from_secs(15);

struct Servers {
    signal: SocketAddr,
    relay: SocketAddr,
}

async fn servers() -> Servers {
    let signal = Arc::new(SignalServer::bind("127.0.0.1:0", SignalConfig::default()).await.unwrap());
    let signal_addr = signal.local_addr().unwrap();
    tokio::spawn(signal.run());

    let relay = Arc::new(RelayServer::bind("127.0.0.1:0", RelayServerConfig::default()).await.unwrap());
    let relay_addr = relay.local_addr().unwrap();
    tokio::spawn(relay.run());

    Servers {
        signal: signal_addr,
        relay: relay_addr,
    }
}

fn signal_config() -> SignalConfig {
    SignalConfig {
        ack_timeout: Duration::from_millis(200),
        resubscribe_interval: Duration::from_millis(500),
        ..Default::default()
    }
}

/// Port nobody listens on
fn dead_candidate() -> Candidate {
    let addr = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    Candidate::host(addr)
}

fn agent(servers: &Servers, keys: KeyPair, candidates: Option<Vec<Candidate>>) -> Arc<Agent> {
    let setup = AgentSetup {
        keys,
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        signal_server: servers.signal,
        relay_server: Some(servers.relay),
        signal: signal_config(),
        candidates,
    };
    Agent::new(setup, CoreConfig::fast(), Arc::new(LoggingApplier)).unwrap()
}

struct Member {
    id: &'static str,
    key: PublicKey,
    ip: &'static str,
    candidates: Vec<Candidate>,
}

fn map_for(serial: u64, me: &Member, others: &[&Member], routes: Vec<RouteEntry>) -> NetworkMap {
    NetworkMap {
        serial,
        peer: PeerConfig {
            id: me.id.into(),
            public_key: me.key,
            hostname: me.id.into(),
            overlay_ip: me.ip.parse().unwrap(),
            network_range: "100.64.0.0/24".parse().unwrap(),
        },
        remote_peers: others
            .iter()
            .map(|m| RemotePeer {
                id: m.id.into(),
                public_key: m.key,
                hostname: m.id.into(),
                overlay_ip: m.ip.parse().unwrap(),
                candidates: m.candidates.clone(),
            })
            .collect(),
        routes: RouteTable {
            entries: routes.into_iter().map(|e| (e.cidr, e)).collect(),
        },
    }
}

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + DEADLINE;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

async fn session_mode(agent: &Agent, peer: &PublicKey) -> Option<TransportMode> {
    agent
        .status()
        .await
        .sessions
        .into_iter()
        .find(|s| &s.public_key == peer && s.state == SessionState::Established)
        .and_then(|s| s.mode)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_peers_fall_back_to_relay() {
    let servers = servers().await;
    let (a_keys, b_keys) = (KeyPair::generate(), KeyPair::generate());
    let a = Member {
        id: "a",
        key: a_keys.public,
        ip: "100.64.0.1",
        candidates: vec![dead_candidate()],
    };
    let b = Member {
        id: "b",
        key: b_keys.public,
        ip: "100.64.0.2",
        candidates: vec![dead_candidate()],
    };

    let agent_a = agent(&servers, a_keys, Some(a.candidates.clone()));
    let agent_b = agent(&servers, b_keys, Some(b.candidates.clone()));
    agent_a.start().await.unwrap();
    agent_b.start().await.unwrap();

    agent_a.apply_map(map_for(1, &a, &[&b], Vec::new())).await;
    agent_b.apply_map(map_for(1, &b, &[&a], Vec::new())).await;

    let (ra, rb, ka, kb) = (&*agent_a, &*agent_b, a.key, b.key);
    assert!(wait_for(|| async move { session_mode(ra, &kb).await == Some(TransportMode::Relayed) }).await);
    assert!(wait_for(|| async move { session_mode(rb, &ka).await == Some(TransportMode::Relayed) }).await);

    // Keepalives over the relay keep the session up past the timeout
    tokio::time::sleep(Duration::from_secs(3)).await;
    let status = agent_a.status().await;
    assert_eq!(status.connected_peers, 1);
    assert_eq!(status.total_peers, 1);

    agent_a.stop().await.unwrap();
    agent_b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reachable_peers_connect_directly() {
    let servers = servers().await;
    let (a_keys, b_keys) = (KeyPair::generate(), KeyPair::generate());

    // Candidates are discovered from the bound loopback sockets
    let agent_a = agent(&servers, a_keys.clone(), None);
    let agent_b = agent(&servers, b_keys.clone(), None);
    agent_a.start().await.unwrap();
    agent_b.start().await.unwrap();

    let a = Member {
        id: "a",
        key: a_keys.public,
        ip: "100.64.0.1",
        candidates: agent_a.candidates().await,
    };
    let b = Member {
        id: "b",
        key: b_keys.public,
        ip: "100.64.0.2",
        candidates: agent_b.candidates().await,
    };
    assert!(!a.candidates.is_empty());

    agent_a.apply_map(map_for(1, &a, &[&b], Vec::new())).await;
    agent_b.apply_map(map_for(1, &b, &[&a], Vec::new())).await;

    let (ra, rb, ka, kb) = (&*agent_a, &*agent_b, a.key, b.key);
    assert!(wait_for(|| async move { session_mode(ra, &kb).await == Some(TransportMode::Direct) }).await);
    assert!(wait_for(|| async move { session_mode(rb, &ka).await == Some(TransportMode::Direct) }).await);

    agent_a.stop().await.unwrap();
    agent_b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_peer_leaves_active_set() {
    let servers = servers().await;
    let (a_keys, b_keys) = (KeyPair::generate(), KeyPair::generate());
    let a = Member {
        id: "a",
        key: a_keys.public,
        ip: "100.64.0.1",
        candidates: vec![dead_candidate()],
    };
    let b = Member {
        id: "b",
        key: b_keys.public,
        ip: "100.64.0.2",
        candidates: vec![dead_candidate()],
    };

    let agent_a = agent(&servers, a_keys, Some(a.candidates.clone()));
    let agent_b = agent(&servers, b_keys, Some(b.candidates.clone()));
    agent_a.start().await.unwrap();
    agent_b.start().await.unwrap();
    agent_a.apply_map(map_for(1, &a, &[&b], Vec::new())).await;
    agent_b.apply_map(map_for(1, &b, &[&a], Vec::new())).await;

    let ra = &*agent_a;
    assert!(wait_for(|| async move { ra.status().await.connected_peers == 1 }).await);

    agent_b.stop().await.unwrap();

    // 3 missed 500ms keepalives plus one reconcile
    assert!(wait_for(|| async move { ra.status().await.connected_peers == 0 }).await);
    let status = agent_a.status().await;
    assert_eq!(status.total_peers, 1);
    assert!(status
        .sessions
        .iter()
        .all(|s| s.state != SessionState::Established));

    agent_a.stop().await.unwrap();
}

#[tokio::test]
async fn routes_follow_network_map() {
    let servers = servers().await;
    let (a_keys, b_keys) = (KeyPair::generate(), KeyPair::generate());
    let a = Member {
        id: "a",
        key: a_keys.public,
        ip: "100.64.0.1",
        candidates: Vec::new(),
    };
    let b = Member {
        id: "b",
        key: b_keys.public,
        ip: "100.64.0.2",
        candidates: Vec::new(),
    };
    let route = RouteEntry {
        cidr: "10.50.0.0/24".parse().unwrap(),
        gateway_peer_id: "b".into(),
        gateway_ip: "100.64.0.2".parse().unwrap(),
        network_id: "office".into(),
        resource_id: "lan".into(),
        metric: 100,
        masquerade: true,
        is_local_gateway: false,
    };

    let agent_a = agent(&servers, a_keys, Some(Vec::new()));
    agent_a.start().await.unwrap();

    let outcome = agent_a.apply_map(map_for(2, &a, &[&b], vec![route.clone()])).await;
    assert!(outcome.converged());

    let status = agent_a.status().await;
    assert_eq!(status.state, AgentState::Running);
    assert_eq!(status.serial, 2);
    assert_eq!(status.networks, vec![route.cidr]);
    assert!(status.is_healthy());

    // Stale maps are ignored
    agent_a.apply_map(map_for(1, &a, &[], Vec::new())).await;
    assert_eq!(agent_a.serial().await, 2);

    agent_a.stop().await.unwrap();
    let status = agent_a.status().await;
    assert_eq!(status.state, AgentState::Stopped);
    // The map survives a stop
    assert_eq!(status.networks, vec![route.cidr]);
}
