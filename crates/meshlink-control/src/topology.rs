//! Topology state and its administrative edits
//!
//! `Topology` is the whole control-plane state of one account. It is only
//! ever edited on a private copy inside `TopologyStore::mutate`, so every
//! method here may fail half-way without leaving a trace.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use ipnet::IpNet;
use meshlink_crypto::PublicKey;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Bumped by the store on every committed edit
    pub serial: u64,
    pub account: Account,
    pub peers: BTreeMap<PeerId, Peer>,
    pub groups: BTreeMap<GroupId, Group>,
    pub networks: BTreeMap<NetworkId, Network>,
    pub routers: BTreeMap<RouterId, Router>,
    /// Setup keys by secret
    #[serde(default)]
    pub setup_keys: BTreeMap<String, SetupKey>,
}

impl Topology {
    /// Fresh account state with the built-in `All` group
    pub fn new(account_id: impl Into<String>, network_range: IpNet) -> Self {
        let all = Group {
            id: new_id(),
            name: ALL_GROUP.to_string(),
            member_peer_ids: BTreeSet::new(),
        };
        let mut groups = BTreeMap::new();
        groups.insert(all.id.clone(), all);

        Self {
            serial: 0,
            account: Account {
                id: account_id.into(),
                settings: AccountSettings { network_range },
                onboarding: Onboarding::default(),
            },
            peers: BTreeMap::new(),
            groups,
            networks: BTreeMap::new(),
            routers: BTreeMap::new(),
            setup_keys: BTreeMap::new(),
        }
    }

    /// Same state with `keys` accepted for login
    pub fn with_setup_keys(mut self, keys: impl IntoIterator<Item = SetupKey>) -> Self {
        for key in keys {
            self.setup_keys.insert(key.key.clone(), key);
        }
        self
    }

    pub fn network_range(&self) -> IpNet {
        self.account.settings.network_range
    }

    // ============ Reads ============

    pub fn peer(&self, id: &str) -> ControlResult<&Peer> {
        self.peers.get(id).ok_or_else(|| ControlError::not_found("peer", id))
    }

    pub fn peer_by_key(&self, key: &PublicKey) -> Option<&Peer> {
        self.peers.values().find(|p| &p.public_key == key)
    }

    pub fn peer_by_ip(&self, ip: &IpAddr) -> Option<&Peer> {
        self.peers.values().find(|p| &p.assigned_overlay_ip == ip)
    }

    pub fn all_group_id(&self) -> Option<&GroupId> {
        self.groups.values().find(|g| g.name == ALL_GROUP).map(|g| &g.id)
    }

    pub fn group_by_name(&self, name: &str) -> Option<&Group> {
        self.groups.values().find(|g| g.name == name)
    }

    /// Groups `peer_id` is a member of
    pub fn peer_groups(&self, peer_id: &str) -> BTreeSet<GroupId> {
        self.groups
            .values()
            .filter(|g| g.member_peer_ids.contains(peer_id))
            .map(|g| g.id.clone())
            .collect()
    }

    pub fn peer_view(&self, id: &str) -> ControlResult<PeerView> {
        let peer = self.peer(id)?.clone();
        let groups = self
            .groups
            .values()
            .filter(|g| g.member_peer_ids.contains(id))
            .map(|g| GroupSummary {
                id: g.id.clone(),
                name: g.name.clone(),
            })
            .collect();
        Ok(PeerView { peer, groups })
    }

    /// Whether two peers are members of at least one common group
    pub fn share_group(&self, a: &str, b: &str) -> bool {
        self.groups
            .values()
            .any(|g| g.member_peer_ids.contains(a) && g.member_peer_ids.contains(b))
    }

    pub fn network(&self, id: &str) -> ControlResult<&Network> {
        self.networks.get(id).ok_or_else(|| ControlError::not_found("network", id))
    }

    fn network_mut(&mut self, id: &str) -> ControlResult<&mut Network> {
        self.networks.get_mut(id).ok_or_else(|| ControlError::not_found("network", id))
    }

    fn check_groups_exist(&self, ids: &BTreeSet<GroupId>) -> ControlResult<()> {
        match ids.iter().find(|id| !self.groups.contains_key(*id)) {
            Some(missing) => Err(ControlError::not_found("group", missing.clone())),
            None => Ok(()),
        }
    }

    fn check_peers_exist(&self, ids: &BTreeSet<PeerId>) -> ControlResult<()> {
        match ids.iter().find(|id| !self.peers.contains_key(*id)) {
            Some(missing) => Err(ControlError::not_found("peer", missing.clone())),
            None => Ok(()),
        }
    }

    // ============ Membership ============

    /// Replace the set of non-`All` groups `peer_id` belongs to
    pub fn set_peer_groups(&mut self, peer_id: &str, groups: &BTreeSet<GroupId>) -> ControlResult<()> {
        self.check_groups_exist(groups)?;
        let all = self.all_group_id().cloned();
        for group in self.groups.values_mut() {
            if Some(&group.id) == all.as_ref() {
                group.member_peer_ids.insert(peer_id.to_string());
            } else if groups.contains(&group.id) {
                group.member_peer_ids.insert(peer_id.to_string());
            } else {
                group.member_peer_ids.remove(peer_id);
            }
        }
        Ok(())
    }

    /// Remove a peer with its memberships and the routers it ran
    pub fn remove_peer(&mut self, peer_id: &str) -> ControlResult<Peer> {
        let peer = self
            .peers
            .remove(peer_id)
            .ok_or_else(|| ControlError::not_found("peer", peer_id))?;
        for group in self.groups.values_mut() {
            group.member_peer_ids.remove(peer_id);
        }
        let before = self.routers.len();
        self.routers.retain(|_, r| r.peer_id != peer_id);
        debug!(
            "Removed peer {} ({} routers dropped)",
            peer_id,
            before - self.routers.len()
        );
        Ok(peer)
    }

    // ============ Groups ============

    pub fn create_group(&mut self, req: NewGroup) -> ControlResult<Group> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(ControlError::Invalid("group name must not be empty".into()));
        }
        if self.group_by_name(name).is_some() {
            return Err(ControlError::Invalid(format!("group {} already exists", name)));
        }
        self.check_peers_exist(&req.peers)?;

        let group = Group {
            id: new_id(),
            name: name.to_string(),
            member_peer_ids: req.peers,
        };
        self.groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    pub fn update_group(&mut self, id: &str, req: GroupUpdate) -> ControlResult<Group> {
        let is_all = self.all_group_id().map(|a| a == id).unwrap_or(false);
        if let Some(peers) = &req.peers {
            if is_all {
                return Err(ControlError::Invalid("membership of All is managed automatically".into()));
            }
            self.check_peers_exist(peers)?;
        }
        if let Some(name) = &req.name {
            let name = name.trim();
            if is_all && name != ALL_GROUP {
                return Err(ControlError::Invalid("the All group cannot be renamed".into()));
            }
            if name.is_empty() {
                return Err(ControlError::Invalid("group name must not be empty".into()));
            }
            if self.groups.values().any(|g| g.name == name && g.id != id) {
                return Err(ControlError::Invalid(format!("group {} already exists", name)));
            }
        }

        let group = self
            .groups
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found("group", id))?;
        if let Some(name) = req.name {
            group.name = name.trim().to_string();
        }
        if let Some(peers) = req.peers {
            group.member_peer_ids = peers;
        }
        Ok(group.clone())
    }

    // ============ Networks ============

    pub fn create_network(&mut self, req: NewNetwork) -> ControlResult<Network> {
        if req.name.trim().is_empty() {
            return Err(ControlError::Invalid("network name must not be empty".into()));
        }
        let network = Network {
            id: new_id(),
            name: req.name.trim().to_string(),
            description: req.description,
            resources: Vec::new(),
        };
        self.networks.insert(network.id.clone(), network.clone());
        Ok(network)
    }

    pub fn add_resource(&mut self, network_id: &str, req: NewResource) -> ControlResult<Resource> {
        self.check_groups_exist(&req.groups)?;
        let resource = Resource {
            id: new_id(),
            name: req.name,
            cidr: req.cidr.trunc(),
            enabled: req.enabled,
            group_ids: req.groups,
        };
        self.network_mut(network_id)?.resources.push(resource.clone());
        Ok(resource)
    }

    pub fn update_resource(
        &mut self,
        network_id: &str,
        resource_id: &str,
        req: ResourceUpdate,
    ) -> ControlResult<Resource> {
        if let Some(groups) = &req.groups {
            self.check_groups_exist(groups)?;
        }
        let network = self.network_mut(network_id)?;
        let resource = network
            .resources
            .iter_mut()
            .find(|r| r.id == resource_id)
            .ok_or_else(|| ControlError::not_found("resource", resource_id))?;

        if let Some(name) = req.name {
            resource.name = name;
        }
        if let Some(cidr) = req.cidr {
            resource.cidr = cidr.trunc();
        }
        if let Some(enabled) = req.enabled {
            resource.enabled = enabled;
        }
        if let Some(groups) = req.groups {
            resource.group_ids = groups;
        }
        Ok(resource.clone())
    }

    pub fn remove_resource(&mut self, network_id: &str, resource_id: &str) -> ControlResult<Resource> {
        let network = self.network_mut(network_id)?;
        let index = network
            .resources
            .iter()
            .position(|r| r.id == resource_id)
            .ok_or_else(|| ControlError::not_found("resource", resource_id))?;
        Ok(network.resources.remove(index))
    }

    // ============ Routers ============

    pub fn add_router(&mut self, network_id: &str, req: NewRouter) -> ControlResult<Router> {
        self.network(network_id)?;
        self.peer(&req.peer_id)?;
        let router = Router {
            id: new_id(),
            peer_id: req.peer_id,
            network_id: network_id.to_string(),
            metric: req.metric,
            masquerade: req.masquerade,
            enabled: req.enabled,
        };
        self.routers.insert(router.id.clone(), router.clone());
        Ok(router)
    }

    pub fn update_router(&mut self, network_id: &str, router_id: &str, req: RouterUpdate) -> ControlResult<Router> {
        if let Some(peer_id) = &req.peer_id {
            self.peer(peer_id)?;
        }
        let router = self
            .routers
            .get_mut(router_id)
            .filter(|r| r.network_id == network_id)
            .ok_or_else(|| ControlError::not_found("router", router_id))?;

        if let Some(peer_id) = req.peer_id {
            router.peer_id = peer_id;
        }
        if let Some(metric) = req.metric {
            router.metric = metric;
        }
        if let Some(masquerade) = req.masquerade {
            router.masquerade = masquerade;
        }
        if let Some(enabled) = req.enabled {
            router.enabled = enabled;
        }
        Ok(router.clone())
    }

    pub fn remove_router(&mut self, network_id: &str, router_id: &str) -> ControlResult<Router> {
        match self.routers.get(router_id) {
            Some(r) if r.network_id == network_id => {}
            _ => return Err(ControlError::not_found("router", router_id)),
        }
        self.routers
            .remove(router_id)
            .ok_or_else(|| ControlError::not_found("router", router_id))
    }

    /// Routers serving `network_id`
    pub fn network_routers<'a>(&'a self, network_id: &'a str) -> impl Iterator<Item = &'a Router> + 'a {
        self.routers.values().filter(move |r| r.network_id == network_id)
    }
}
