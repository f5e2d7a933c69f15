//! Tunnel sessions
//!
//! Each agent tracks its own half of every session. State lives in an
//! atomic so the keepalive checker, the negotiator updates and teardown can
//! race without a lock; every transition is a compare-and-set.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use meshlink_crypto::PublicKey;
use meshlink_network::PeerPath;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    /// Negotiator is looking for a path
    Connecting = 0,
    /// Path found, keepalives flowing
    Established = 1,
    /// Keepalives stopped; waiting for the next reconcile
    Failed = 2,
    /// Torn down
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Established,
            2 => SessionState::Failed,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How session traffic flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMode {
    Direct,
    Relayed,
}

impl From<PeerPath> for TransportMode {
    fn from(path: PeerPath) -> Self {
        match path {
            PeerPath::Direct(_) => TransportMode::Direct,
            PeerPath::Relayed(_) => TransportMode::Relayed,
        }
    }
}

#[derive(Debug)]
struct Timing {
    path: Option<PeerPath>,
    established_at: Option<Instant>,
    last_keepalive_at: Instant,
}

/// Our half of a session with one peer
#[derive(Debug)]
pub struct Session {
    local: PublicKey,
    remote: PublicKey,
    state: AtomicU8,
    timing: Mutex<Timing>,
}

impl Session {
    pub fn new(local: PublicKey, remote: PublicKey) -> Self {
        Self {
            local,
            remote,
            state: AtomicU8::new(SessionState::Connecting as u8),
            timing: Mutex::new(Timing {
                path: None,
                established_at: None,
                last_keepalive_at: Instant::now(),
            }),
        }
    }

    pub fn local(&self) -> PublicKey {
        self.local
    }

    pub fn remote(&self) -> PublicKey {
        self.remote
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `from -> to`. Fails if another task moved the session first.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            debug!("Session {} state: {} -> {}", self.remote.short(), from, to);
        }
        moved
    }

    /// Connecting -> Established over `path`
    pub fn establish(&self, path: PeerPath) -> bool {
        if !self.transition(SessionState::Connecting, SessionState::Established) {
            return false;
        }
        let now = Instant::now();
        let mut timing = self.timing();
        timing.path = Some(path);
        timing.established_at = Some(now);
        timing.last_keepalive_at = now;
        true
    }

    /// Established or Failed -> Connecting, forgetting the path
    pub fn reconnect(&self) -> bool {
        let moved = self.transition(SessionState::Established, SessionState::Connecting)
            || self.transition(SessionState::Failed, SessionState::Connecting);
        if moved {
            let mut timing = self.timing();
            timing.path = None;
            timing.established_at = None;
        }
        moved
    }

    /// Any state -> Closed. Returns the previous state.
    pub fn close(&self) -> SessionState {
        SessionState::from_u8(self.state.swap(SessionState::Closed as u8, Ordering::AcqRel))
    }

    /// Record liveness seen on the session path
    pub fn touch(&self) {
        self.timing().last_keepalive_at = Instant::now();
    }

    pub fn path(&self) -> Option<PeerPath> {
        self.timing().path
    }

    pub fn mode(&self) -> Option<TransportMode> {
        self.path().map(TransportMode::from)
    }

    pub fn established_at(&self) -> Option<Instant> {
        self.timing().established_at
    }

    pub fn last_keepalive_at(&self) -> Instant {
        self.timing().last_keepalive_at
    }

    /// Established with no liveness for longer than `timeout`
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.state() == SessionState::Established && self.last_keepalive_at().elapsed() > timeout
    }

    pub fn info(&self) -> SessionInfo {
        let timing = self.timing();
        SessionInfo {
            peer: self.remote,
            state: self.state(),
            mode: timing.path.map(TransportMode::from),
            established_secs: timing.established_at.map(|at| at.elapsed().as_secs()),
            last_keepalive_secs: timing.last_keepalive_at.elapsed().as_secs(),
        }
    }

    fn timing(&self) -> std::sync::MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub peer: PublicKey,
    pub state: SessionState,
    pub mode: Option<TransportMode>,
    pub established_secs: Option<u64>,
    pub last_keepalive_secs: u64,
}

/// Sessions by remote key
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<PublicKey, Arc<Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing session for `remote`, or a new Connecting one
    pub fn open(&self, local: PublicKey, remote: PublicKey) -> Arc<Session> {
        self.sessions
            .entry(remote)
            .or_insert_with(|| Arc::new(Session::new(local, remote)))
            .clone()
    }

    pub fn get(&self, remote: &PublicKey) -> Option<Arc<Session>> {
        self.sessions.get(remote).map(|s| s.clone())
    }

    pub fn remove(&self, remote: &PublicKey) -> Option<Arc<Session>> {
        self.sessions.remove(remote).map(|(_, s)| s)
    }

    pub fn contains(&self, remote: &PublicKey) -> bool {
        self.sessions.contains_key(remote)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn keys(&self) -> Vec<PublicKey> {
        self.sessions.iter().map(|s| *s.key()).collect()
    }

    /// Sessions currently in `state`
    pub fn in_state(&self, state: SessionState) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|s| s.state() == state)
            .map(|s| s.value().clone())
            .collect()
    }

    /// Established sessions
    pub fn active(&self) -> Vec<Arc<Session>> {
        self.in_state(SessionState::Established)
    }

    pub fn snapshot(&self) -> BTreeMap<PublicKey, SessionInfo> {
        self.sessions.iter().map(|s| (*s.key(), s.info())).collect()
    }
}
