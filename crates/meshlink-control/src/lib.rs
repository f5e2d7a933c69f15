//! MeshLink Control Plane
//!
//! Authoritative state of one account and everything derived from it:
//! - Peer registry and overlay address assignment
//! - Groups, networks, resources and routing peers
//! - Per-peer route table computation
//! - Route synchronization to agents
//! - Management HTTP API

pub mod error;
pub mod config;
pub mod model;
pub mod topology;
pub mod store;
pub mod ippool;
pub mod registry;
pub mod routes;
pub mod sync;
pub mod api;

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

pub use api::{ApiState, AgentStatusReport};
pub use config::ControlConfig;
pub use error::{ControlError, ControlResult};
pub use model::{NetworkMap, PeerFilter, PeerId, RouteEntry, RouteTable, SetupKey, SetupKeyType};
pub use registry::{LoginRequest, PeerRegistry};
pub use routes::RoutePolicy;
pub use store::TopologyStore;
pub use sync::{RouteSynchronizer, SyncReport};
pub use topology::Topology;

/// Store, registry and synchronizer of one account, wired together
#[derive(Clone)]
pub struct ControlPlane {
    pub store: TopologyStore,
    pub registry: PeerRegistry,
    pub sync: Arc<RouteSynchronizer>,
    config: ControlConfig,
}

impl ControlPlane {
    pub fn new(config: ControlConfig) -> ControlResult<Self> {
        config.validate()?;

        let topology =
            Topology::new(&config.account_id, config.network_range).with_setup_keys(config.setup_keys.clone());
        let store = TopologyStore::new(topology);
        let registry = PeerRegistry::new(store.clone());
        let sync = RouteSynchronizer::new(store.clone(), config.route_policy);

        Ok(Self {
            store,
            registry,
            sync,
            config,
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Start the synchronizer loop
    pub fn spawn_sync(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.sync.clone().run(cancel))
    }

    /// State for the management API
    pub fn api_state(&self, admin_token: impl Into<String>) -> Arc<ApiState> {
        Arc::new(ApiState {
            store: self.store.clone(),
            registry: self.registry.clone(),
            sync: self.sync.clone(),
            admin_token: admin_token.into(),
            long_poll_timeout: self.config.long_poll_timeout,
            statuses: DashMap::new(),
        })
    }
}
