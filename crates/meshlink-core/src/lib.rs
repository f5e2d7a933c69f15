//! MeshLink Peer Agent
//!
//! Everything that runs on a peer:
//! - Relay/NAT-traversal negotiation per peer pair
//! - Tunnel session supervision and keepalives
//! - Local route application
//! - Agent engine tying it to the control plane's network maps

pub mod error;
pub mod config;
pub mod session;
pub mod negotiator;
pub mod manager;
pub mod routes;
pub mod agent;

pub use agent::{Agent, AgentSetup, AgentState, AgentStatus, PeerStatus};
pub use config::{CoreConfig, NegotiatorConfig, SessionConfig};
pub use error::{CoreError, CoreResult};
pub use manager::{desired_peers, DesiredPeer, TransportBackend, TunnelBackend, TunnelSessionManager};
pub use negotiator::{NegotiationState, NegotiatorDeps, NegotiatorHandle, PairNegotiator, Role};
pub use routes::{LinuxRouteApplier, LocalRoutes, LoggingApplier, RouteApplier, RouteDiff};
pub use session::{Session, SessionInfo, SessionState, SessionTable, TransportMode};
