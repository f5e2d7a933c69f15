//! MeshLink Network Layer
//!
//! Provides network primitives:
//! - Wire protocol shared by agents, signal server and relay
//! - Signal channel (in-process hub, UDP server and client)
//! - Relay server and client for pairs without a direct path
//! - UDP peer transport (hole punching, keepalives)
//! - Address candidate discovery

pub mod error;
pub mod protocol;
pub mod signal;
pub mod relay;
pub mod transport;
pub mod candidates;

pub use error::{NetworkError, NetworkResult};
pub use protocol::{
    Candidate, CandidateKind, NegotiationMessage, PeerPacket, RelayEndpoint, SignalEnvelope,
    SignalMessage,
};
pub use relay::{RelayClient, RelayServer, RelayServerConfig, RelayStats};
pub use signal::{SignalChannel, SignalClient, SignalConfig, SignalHub, SignalServer, SignalStream};
pub use transport::{PeerPath, PeerTransport, TransportConfig, TransportEvent};
