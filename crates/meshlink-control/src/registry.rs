//! Peer Registry
//!
//! Registration, lookup and removal of peers, and ownership of the overlay
//! address of each one. Every operation is a single store edit, so a
//! failed update leaves the peer exactly as it was.

use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;

use chrono::{Duration, Utc};
use ipnet::IpNet;
use meshlink_crypto::PublicKey;
use meshlink_network::Candidate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ControlError, ControlResult};
use crate::ippool::IpPool;
use crate::model::*;
use crate::store::TopologyStore;
use crate::topology::Topology;

/// Agent login request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoginRequest {
    pub setup_key: String,
    pub public_key: PublicKey,
    pub hostname: String,
    #[serde(default)]
    pub address_candidates: Vec<Candidate>,
}

/// Account settings update
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AccountUpdate {
    pub network_range: Option<IpNet>,
}

/// Longest expiry a new setup key may ask for
const MAX_KEY_LIFETIME_SECS: u64 = 10 * 365 * 24 * 3600;

/// Peer Registry
#[derive(Clone)]
pub struct PeerRegistry {
    store: TopologyStore,
}

impl PeerRegistry {
    pub fn new(store: TopologyStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &TopologyStore {
        &self.store
    }

    /// Register a peer, or refresh it when the same id comes back with the
    /// same key. Returns the overlay address.
    pub async fn register(&self, req: NewPeer) -> ControlResult<IpAddr> {
        let ip = self.store.mutate(|t| register_in(t, req)).await?;
        Ok(ip)
    }

    /// Update a peer. All fields apply or none do.
    pub async fn update(&self, peer_id: &str, req: PeerUpdate) -> ControlResult<PeerView> {
        self.store
            .mutate(|t| {
                let pool = IpPool::new(t.network_range());

                if let Some(ip) = req.assigned_overlay_ip {
                    pool.validate(ip)?;
                    if let Some(owner) = t.peer_by_ip(&ip).filter(|p| p.id != peer_id) {
                        return Err(ControlError::AddressConflict { ip, owner: owner.id.clone() });
                    }
                }
                if let Some(groups) = &req.groups {
                    t.peer(peer_id)?;
                    t.set_peer_groups(peer_id, groups)?;
                }

                let peer = t
                    .peers
                    .get_mut(peer_id)
                    .ok_or_else(|| ControlError::not_found("peer", peer_id))?;
                if let Some(hostname) = req.hostname {
                    peer.hostname = hostname;
                }
                if let Some(ip) = req.assigned_overlay_ip {
                    if peer.assigned_overlay_ip != ip {
                        info!("Peer {} moved {} -> {}", peer.id, peer.assigned_overlay_ip, ip);
                        peer.assigned_overlay_ip = ip;
                    }
                }
                if let Some(candidates) = req.address_candidates {
                    peer.address_candidates = candidates;
                }

                t.peer_view(peer_id)
            })
            .await
    }

    pub async fn lookup(&self, peer_id: &str) -> ControlResult<PeerView> {
        self.store.snapshot().await.peer_view(peer_id)
    }

    pub async fn list(&self, filter: &PeerFilter) -> Vec<PeerView> {
        let topology = self.store.snapshot().await;
        topology
            .peers
            .keys()
            .filter_map(|id| topology.peer_view(id).ok())
            .filter(|view| filter.matches(view))
            .collect()
    }

    /// Remove a peer, its memberships and the routers it ran
    pub async fn deregister(&self, peer_id: &str) -> ControlResult<Peer> {
        let peer = self.store.mutate(|t| t.remove_peer(peer_id)).await?;
        info!("Deregistered peer {} ({})", peer.id, peer.hostname);
        Ok(peer)
    }

    /// Agent login with a setup key. A known public key logs back into its
    /// peer; only enrolling a new peer spends a use of the key.
    pub async fn login(&self, req: LoginRequest) -> ControlResult<PeerView> {
        self.store
            .mutate(|t| {
                let setup_key = t
                    .setup_keys
                    .get(&req.setup_key)
                    .cloned()
                    .ok_or(ControlError::InvalidSetupKey)?;

                let (id, is_new) = match t.peer_by_key(&req.public_key) {
                    Some(existing) => (existing.id.clone(), false),
                    None => (new_id(), true),
                };

                if is_new {
                    if let Some(reason) = setup_key.rejection(Utc::now()) {
                        return Err(ControlError::SetupKeyRejected {
                            name: setup_key.name.clone(),
                            reason,
                        });
                    }
                }

                register_in(
                    t,
                    NewPeer {
                        id: id.clone(),
                        public_key: req.public_key,
                        hostname: req.hostname,
                        address_candidates: req.address_candidates,
                    },
                )?;

                if is_new {
                    for group in &setup_key.auto_groups {
                        let group_id = if t.groups.contains_key(group) {
                            group.clone()
                        } else {
                            match t.group_by_name(group) {
                                Some(existing) => existing.id.clone(),
                                None => t.create_group(NewGroup { name: group.clone(), ..Default::default() })?.id,
                            }
                        };
                        if let Some(group) = t.groups.get_mut(&group_id) {
                            group.member_peer_ids.insert(id.clone());
                        }
                    }
                    if let Some(key) = t.setup_keys.get_mut(&req.setup_key) {
                        key.used_times = key.used_times.saturating_add(1);
                    }
                    info!("Peer {} joined with setup key {:?}", id, setup_key.name);
                }

                t.peer_view(&id)
            })
            .await
    }

    /// Mint a new setup key
    pub async fn create_setup_key(&self, req: NewSetupKey) -> ControlResult<SetupKey> {
        if req.name.trim().is_empty() {
            return Err(ControlError::Invalid("setup key name must not be empty".into()));
        }
        if req.expires_in > MAX_KEY_LIFETIME_SECS {
            return Err(ControlError::Invalid(format!(
                "expires_in must be at most {} seconds",
                MAX_KEY_LIFETIME_SECS
            )));
        }

        let key = SetupKey {
            key: uuid::Uuid::new_v4().to_string().to_uppercase(),
            key_type: req.key_type,
            expires_at: (req.expires_in > 0).then(|| Utc::now() + Duration::seconds(req.expires_in as i64)),
            usage_limit: req.usage_limit,
            ..SetupKey::new("", req.name, req.auto_groups)
        };

        self.store
            .mutate(|t| {
                t.setup_keys.insert(key.key.clone(), key.clone());
                Ok(())
            })
            .await?;
        info!("Created setup key {:?} ({:?})", key.name, key.key_type);
        Ok(key)
    }

    pub async fn setup_keys(&self) -> Vec<SetupKey> {
        self.store.snapshot().await.setup_keys.values().cloned().collect()
    }

    /// Record whether the agent currently reports itself up
    pub async fn mark_connected(&self, peer_id: &str, connected: bool) -> ControlResult<()> {
        let current = self.store.snapshot().await;
        if current.peer(peer_id)?.connected == connected {
            return Ok(());
        }
        self.store
            .mutate(|t| {
                let peer = t
                    .peers
                    .get_mut(peer_id)
                    .ok_or_else(|| ControlError::not_found("peer", peer_id))?;
                peer.connected = connected;
                peer.last_seen = Some(Utc::now());
                debug!("Peer {} connected={}", peer_id, connected);
                Ok(())
            })
            .await
    }

    pub async fn account(&self) -> Account {
        self.store.snapshot().await.account.clone()
    }

    /// Update account settings. A new range re-assigns the peers that fall
    /// outside it; the list of moved peers is returned.
    pub async fn update_account(
        &self,
        account_id: &str,
        req: AccountUpdate,
        onboarding: Option<Onboarding>,
    ) -> ControlResult<(Account, Vec<(PeerId, IpAddr)>)> {
        self.store
            .mutate(|t| {
                if t.account.id != account_id {
                    return Err(ControlError::not_found("account", account_id));
                }
                if let Some(onboarding) = onboarding {
                    t.account.onboarding = onboarding;
                }
                let moved = match req.network_range {
                    Some(range) => reassign_range(t, range)?,
                    None => Vec::new(),
                };
                Ok((t.account.clone(), moved))
            })
            .await
    }
}

fn register_in(t: &mut Topology, req: NewPeer) -> ControlResult<IpAddr> {
    if let Some(bound) = t.peer_by_key(&req.public_key) {
        if bound.id != req.id {
            return Err(ControlError::DuplicateIdentity {
                key: req.public_key,
                existing: bound.id.clone(),
            });
        }
    }

    if let Some(existing) = t.peers.get_mut(&req.id) {
        if existing.public_key != req.public_key {
            return Err(ControlError::Invalid(format!(
                "peer {} is registered with another key",
                req.id
            )));
        }
        existing.hostname = req.hostname;
        existing.address_candidates = req.address_candidates;
        existing.last_seen = Some(Utc::now());
        debug!("Peer {} reconnected", req.id);
        return Ok(existing.assigned_overlay_ip);
    }

    let used: HashSet<IpAddr> = t.peers.values().map(|p| p.assigned_overlay_ip).collect();
    let ip = IpPool::new(t.network_range()).allocate(&used)?;

    let id = req.id.clone();
    t.peers.insert(
        id.clone(),
        Peer {
            id: req.id,
            public_key: req.public_key,
            hostname: req.hostname,
            address_candidates: req.address_candidates,
            assigned_overlay_ip: ip,
            connected: false,
            last_seen: Some(Utc::now()),
        },
    );
    t.set_peer_groups(&id, &BTreeSet::new())?;

    info!("Registered peer {} at {}", id, ip);
    Ok(ip)
}

fn reassign_range(t: &mut Topology, range: IpNet) -> ControlResult<Vec<(PeerId, IpAddr)>> {
    let pool = IpPool::new(range);
    if range.hosts().next().is_none() {
        return Err(ControlError::Invalid(format!("{} has no host addresses", range)));
    }
    t.account.settings.network_range = pool.range();

    let mut used: HashSet<IpAddr> = t
        .peers
        .values()
        .map(|p| p.assigned_overlay_ip)
        .filter(|ip| pool.contains(ip))
        .collect();

    let mut moved = Vec::new();
    for peer in t.peers.values_mut() {
        if pool.contains(&peer.assigned_overlay_ip) {
            continue;
        }
        let ip = pool.allocate(&used)?;
        used.insert(ip);
        info!("Re-assigned peer {} {} -> {}", peer.id, peer.assigned_overlay_ip, ip);
        peer.assigned_overlay_ip = ip;
        moved.push((peer.id.clone(), ip));
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_crypto::KeyPair;

    fn registry(range: &str) -> PeerRegistry {
        let topology = Topology::new("acct", range.parse().unwrap())
            .with_setup_keys([SetupKey::new("setup-123", "ci", vec!["servers".into()])]);
        PeerRegistry::new(TopologyStore::new(topology))
    }

    fn login_as(setup_key: &str, hostname: &str) -> LoginRequest {
        LoginRequest {
            setup_key: setup_key.into(),
            public_key: KeyPair::generate().public,
            hostname: hostname.into(),
            address_candidates: Vec::new(),
        }
    }

    fn new_peer(id: &str) -> NewPeer {
        NewPeer {
            id: id.into(),
            public_key: KeyPair::generate().public,
            hostname: format!("{}-host", id),
            address_candidates: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_register_assigns_unique_addresses() {
        let registry = registry("100.64.0.0/24");
        let a = registry.register(new_peer("a")).await.unwrap();
        let b = registry.register(new_peer("b")).await.unwrap();

        assert_eq!(a, "100.64.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(b, "100.64.0.2".parse::<IpAddr>().unwrap());

        let view = registry.lookup("a").await.unwrap();
        let all = registry.store().snapshot().await.all_group_id().cloned().unwrap();
        assert!(view.in_group(&all));
        assert_eq!(view.groups[0].name, ALL_GROUP);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let registry = registry("100.64.0.0/24");
        let first = new_peer("a");
        let key = first.public_key;
        registry.register(first).await.unwrap();

        let mut second = new_peer("b");
        second.public_key = key;
        let err = registry.register(second).await.unwrap_err();

        assert!(matches!(err, ControlError::DuplicateIdentity { existing, .. } if existing == "a"));
    }

    #[tokio::test]
    async fn test_reconnect_keeps_address() {
        let registry = registry("100.64.0.0/24");
        let peer = new_peer("a");
        let ip = registry.register(peer.clone()).await.unwrap();

        let mut again = peer;
        again.hostname = "renamed".into();
        assert_eq!(registry.register(again).await.unwrap(), ip);
        assert_eq!(registry.lookup("a").await.unwrap().peer.hostname, "renamed");
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        // /29 leaves six host addresses
        let registry = registry("10.9.0.0/29");
        for i in 0..6 {
            registry.register(new_peer(&format!("p{}", i))).await.unwrap();
        }
        let err = registry.register(new_peer("p6")).await.unwrap_err();
        assert!(matches!(err, ControlError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_update_conflict_is_all_or_nothing() {
        let registry = registry("100.64.0.0/24");
        registry.register(new_peer("a")).await.unwrap();
        let b_ip = registry.register(new_peer("b")).await.unwrap();

        let err = registry
            .update(
                "a",
                PeerUpdate {
                    hostname: Some("changed".into()),
                    assigned_overlay_ip: Some(b_ip),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::AddressConflict { .. }));
        assert_eq!(registry.lookup("a").await.unwrap().peer.hostname, "a-host");
    }

    #[tokio::test]
    async fn test_update_out_of_range() {
        let registry = registry("100.64.0.0/24");
        registry.register(new_peer("a")).await.unwrap();
        let err = registry
            .update("a", PeerUpdate { assigned_overlay_ip: Some("10.0.0.5".parse().unwrap()), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::AddressOutOfRange { .. }));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let registry = registry("100.64.0.0/24");
        registry.register(new_peer("a")).await.unwrap();
        registry.register(new_peer("b")).await.unwrap();
        registry.mark_connected("b", true).await.unwrap();

        let connected = registry
            .list(&PeerFilter { connected: Some(true), ..Default::default() })
            .await;
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].peer.id, "b");

        let by_host = registry
            .list(&PeerFilter { hostname: Some("a-host".into()), ..Default::default() })
            .await;
        assert_eq!(by_host.len(), 1);
    }

    #[tokio::test]
    async fn test_login_with_setup_key() {
        let registry = registry("100.64.0.0/24");
        let key = KeyPair::generate().public;
        let req = LoginRequest {
            setup_key: "setup-123".into(),
            public_key: key,
            hostname: "laptop".into(),
            address_candidates: Vec::new(),
        };

        let first = registry.login(req.clone()).await.unwrap();
        let again = registry.login(req.clone()).await.unwrap();
        assert_eq!(first.peer.id, again.peer.id);
        assert_eq!(first.peer.assigned_overlay_ip, again.peer.assigned_overlay_ip);

        let servers = registry.store().snapshot().await.group_by_name("servers").cloned().unwrap();
        assert!(first.in_group(&servers.id));

        let bad = LoginRequest { setup_key: "nope".into(), ..req };
        assert!(matches!(registry.login(bad).await, Err(ControlError::InvalidSetupKey)));

        // Reconnects do not count as uses
        let keys = registry.setup_keys().await;
        assert_eq!(keys[0].used_times, 1);
    }

    #[tokio::test]
    async fn test_one_off_key_enrolls_a_single_peer() {
        let registry = registry("100.64.0.0/24");
        let key = registry
            .create_setup_key(NewSetupKey {
                name: "once".into(),
                key_type: SetupKeyType::OneOff,
                expires_in: 3600,
                auto_groups: Vec::new(),
                usage_limit: 0,
            })
            .await
            .unwrap();
        assert!(key.expires_at.is_some());

        let first = login_as(&key.key, "first");
        let view = registry.login(first.clone()).await.unwrap();

        let err = registry.login(login_as(&key.key, "second")).await.unwrap_err();
        assert!(matches!(err, ControlError::SetupKeyRejected { .. }));
        assert_eq!(registry.list(&PeerFilter::default()).await.len(), 1);

        // The enrolled peer can still come back
        assert_eq!(registry.login(first).await.unwrap().peer.id, view.peer.id);
    }

    #[tokio::test]
    async fn test_usage_limit_and_expiry_enforced_on_login() {
        let registry = registry("100.64.0.0/24");
        let limited = registry
            .create_setup_key(NewSetupKey {
                name: "two".into(),
                key_type: SetupKeyType::Reusable,
                expires_in: 0,
                auto_groups: Vec::new(),
                usage_limit: 2,
            })
            .await
            .unwrap();
        assert!(limited.expires_at.is_none());

        registry.login(login_as(&limited.key, "a")).await.unwrap();
        registry.login(login_as(&limited.key, "b")).await.unwrap();
        let err = registry.login(login_as(&limited.key, "c")).await.unwrap_err();
        assert!(matches!(err, ControlError::SetupKeyRejected { reason: "usage limit reached", .. }));

        let mut expired = SetupKey::new("old", "old", Vec::new());
        expired.expires_at = Some(Utc::now() - Duration::seconds(5));
        registry
            .store()
            .mutate(|t| {
                t.setup_keys.insert(expired.key.clone(), expired);
                Ok(())
            })
            .await
            .unwrap();
        let err = registry.login(login_as("old", "d")).await.unwrap_err();
        assert!(matches!(err, ControlError::SetupKeyRejected { reason: "expired", .. }));
    }

    #[tokio::test]
    async fn test_auto_groups_accept_ids() {
        let registry = registry("100.64.0.0/24");
        let ops = registry
            .store()
            .mutate(|t| t.create_group(NewGroup { name: "ops".into(), ..Default::default() }))
            .await
            .unwrap();
        let key = registry
            .create_setup_key(NewSetupKey {
                name: "ops".into(),
                key_type: SetupKeyType::Reusable,
                expires_in: 0,
                auto_groups: vec![ops.id.clone()],
                usage_limit: 0,
            })
            .await
            .unwrap();

        let view = registry.login(login_as(&key.key, "box")).await.unwrap();
        assert!(view.in_group(&ops.id));
        assert_eq!(registry.store().snapshot().await.groups.len(), 2);
    }

    #[tokio::test]
    async fn test_setup_key_requires_name() {
        let registry = registry("100.64.0.0/24");
        let err = registry
            .create_setup_key(NewSetupKey {
                name: " ".into(),
                key_type: SetupKeyType::Reusable,
                expires_in: 0,
                auto_groups: Vec::new(),
                usage_limit: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_range_change_reassigns_outside_peers() {
        let registry = registry("100.64.0.0/24");
        registry.register(new_peer("a")).await.unwrap();
        registry.register(new_peer("b")).await.unwrap();

        let (account, moved) = registry
            .update_account("acct", AccountUpdate { network_range: Some("10.10.0.0/24".parse().unwrap()) }, None)
            .await
            .unwrap();

        assert_eq!(account.settings.network_range.to_string(), "10.10.0.0/24");
        assert_eq!(moved.len(), 2);
        let a = registry.lookup("a").await.unwrap();
        assert_eq!(a.peer.assigned_overlay_ip, "10.10.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_deregister_removes_peer() {
        let registry = registry("100.64.0.0/24");
        registry.register(new_peer("a")).await.unwrap();
        registry.deregister("a").await.unwrap();
        assert!(matches!(registry.lookup("a").await, Err(ControlError::NotFound { .. })));
        assert!(registry.deregister("a").await.is_err());
    }
}
