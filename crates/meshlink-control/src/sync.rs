//! Route Table Synchronizer
//!
//! Recomputes every peer's network map after each topology commit and
//! publishes the maps that changed on a per-peer `watch` slot. Publishing
//! never waits for the agent; an agent that falls behind only ever sees
//! the latest map.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ControlResult;
use crate::model::{NetworkMap, PeerId};
use crate::routes::{consistency_warnings, network_map, ConsistencyWarning, RoutePolicy};
use crate::store::TopologyStore;

type Slot = watch::Sender<Option<Arc<NetworkMap>>>;

/// Outcome of one synchronization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub serial: u64,
    pub published: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Consistency warnings that appeared in this pass
    pub new_warnings: usize,
}

/// Route Table Synchronizer
pub struct RouteSynchronizer {
    store: TopologyStore,
    policy: RoutePolicy,
    slots: DashMap<PeerId, Slot>,
    /// Warnings already logged; each is logged again only after it clears
    warned: Mutex<BTreeSet<ConsistencyWarning>>,
}

impl RouteSynchronizer {
    pub fn new(store: TopologyStore, policy: RoutePolicy) -> Arc<Self> {
        Arc::new(Self {
            store,
            policy,
            slots: DashMap::new(),
            warned: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn policy(&self) -> RoutePolicy {
        self.policy
    }

    fn slot(&self, peer_id: &str) -> watch::Receiver<Option<Arc<NetworkMap>>> {
        self.slots
            .entry(peer_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Follow the maps published for `peer_id`
    pub fn subscribe(&self, peer_id: &str) -> watch::Receiver<Option<Arc<NetworkMap>>> {
        self.slot(peer_id)
    }

    /// Last map published for `peer_id`
    pub fn current(&self, peer_id: &str) -> Option<Arc<NetworkMap>> {
        self.slots.get(peer_id).and_then(|s| s.borrow().clone())
    }

    /// Recompute all peers from the current snapshot and publish changes
    pub async fn sync_all(&self) -> ControlResult<SyncReport> {
        let topology = self.store.snapshot().await;
        let mut report = SyncReport {
            serial: topology.serial,
            ..Default::default()
        };

        for peer_id in topology.peers.keys() {
            let map = network_map(&topology, peer_id, self.policy)?;
            let slot = self
                .slots
                .entry(peer_id.clone())
                .or_insert_with(|| watch::channel(None).0);

            let changed = slot.send_if_modified(|current| match current {
                Some(previous) if previous.same_content(&map) => false,
                _ => {
                    *current = Some(Arc::new(map));
                    true
                }
            });
            if changed {
                debug!("Published map for {} at serial {}", peer_id, topology.serial);
                report.published += 1;
            } else {
                report.unchanged += 1;
            }
        }

        // Peers that no longer exist
        let live: HashSet<&PeerId> = topology.peers.keys().collect();
        let stale: Vec<PeerId> = self
            .slots
            .iter()
            .filter(|s| !live.contains(s.key()) && s.value().borrow().is_some())
            .map(|s| s.key().clone())
            .collect();
        for peer_id in stale {
            if let Some((_, slot)) = self.slots.remove(&peer_id) {
                slot.send_replace(None);
                report.removed += 1;
                debug!("Dropped map slot for removed peer {}", peer_id);
            }
        }

        report.new_warnings = self.report_warnings(&consistency_warnings(&topology));
        Ok(report)
    }

    /// Log warnings not seen in the previous pass
    fn report_warnings(&self, current: &BTreeSet<ConsistencyWarning>) -> usize {
        let mut warned = self.warned.lock().unwrap_or_else(|e| e.into_inner());
        let fresh: Vec<&ConsistencyWarning> = current.difference(&warned).collect();
        for w in &fresh {
            warn!(
                network = %w.network_id,
                resource = %w.resource_id,
                cidr = %w.cidr,
                "TopologyConsistencyWarning: no enabled router for entitled resource"
            );
        }
        let count = fresh.len();
        *warned = current.clone();
        count
    }

    /// Wait until a map newer than `serial` is published for `peer_id`.
    /// Returns the current map on timeout, or `None` if there is none.
    pub async fn wait_for_newer(
        &self,
        peer_id: &str,
        serial: u64,
        timeout: Duration,
    ) -> Option<Arc<NetworkMap>> {
        let mut rx = self.slot(peer_id);
        let newer = async {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(map) = current.filter(|m| m.serial > serial) {
                    return Some(map);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        match tokio::time::timeout(timeout, newer).await {
            Ok(found) => found,
            Err(_) => self.current(peer_id),
        }
    }

    /// Resync after every commit until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut changes = self.store.changes();
        info!("Route synchronizer started ({:?})", self.policy);

        loop {
            match self.sync_all().await {
                Ok(report) if report.published > 0 || report.removed > 0 => {
                    info!(
                        "Serial {}: {} maps published, {} unchanged, {} removed",
                        report.serial, report.published, report.unchanged, report.removed
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Route synchronization failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Route synchronizer stopped");
    }
}
