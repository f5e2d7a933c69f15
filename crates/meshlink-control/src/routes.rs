//! Route computation
//!
//! Pure functions from a topology snapshot to one peer's route table and
//! network map. Same snapshot in, same output out.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ControlResult;
use crate::model::*;
use crate::topology::Topology;

/// How equal-metric candidates are ordered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePolicy {
    /// Lowest metric, then smallest gateway peer id, then network id
    #[default]
    LowestMetricThenPeerId,
    /// Lowest metric, then network name (id on equal names), then peer id
    LowestMetricThenNetworkOrder,
}

/// A router able to serve one resource
struct Candidate<'a> {
    network: &'a Network,
    resource: &'a Resource,
    router: &'a Router,
    gateway: &'a Peer,
}

impl RoutePolicy {
    fn compare(&self, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        let by_metric = a.router.metric.cmp(&b.router.metric);
        let by_peer = a.router.peer_id.cmp(&b.router.peer_id);
        let by_network = (&a.network.name, &a.network.id).cmp(&(&b.network.name, &b.network.id));
        let by_network_id = a.network.id.cmp(&b.network.id);
        let by_resource = a.resource.id.cmp(&b.resource.id);

        match self {
            RoutePolicy::LowestMetricThenPeerId => by_metric
                .then(by_peer)
                .then(by_network_id)
                .then(by_resource),
            RoutePolicy::LowestMetricThenNetworkOrder => by_metric
                .then(by_network)
                .then(by_peer)
                .then(by_resource),
        }
    }
}

/// Compute the route table of `peer_id`.
///
/// A resource is included when it is enabled and either shares a group
/// with the peer or is served by the peer itself. Entitled resources with
/// no usable router are left out; see [`consistency_warnings`].
pub fn recompute(topology: &Topology, peer_id: &str, policy: RoutePolicy) -> ControlResult<RouteTable> {
    topology.peer(peer_id)?;
    let groups = topology.peer_groups(peer_id);

    let mut best: BTreeMap<IpNet, Candidate<'_>> = BTreeMap::new();

    for network in topology.networks.values() {
        let routers: Vec<(&Router, &Peer)> = topology
            .network_routers(&network.id)
            .filter(|r| r.enabled)
            .filter_map(|r| topology.peers.get(&r.peer_id).map(|p| (r, p)))
            .collect();
        let serves = routers.iter().any(|(r, _)| r.peer_id == peer_id);

        for resource in network.resources.iter().filter(|r| r.enabled) {
            let entitled = !resource.group_ids.is_disjoint(&groups);
            if !entitled && !serves {
                continue;
            }

            let winner = routers
                .iter()
                .map(|&(router, gateway)| Candidate {
                    network,
                    resource,
                    router,
                    gateway,
                })
                .min_by(|a, b| policy.compare(a, b));

            let Some(winner) = winner else { continue };

            if !entitled && winner.router.peer_id != peer_id {
                continue;
            }

            let replace = match best.get(&resource.cidr) {
                Some(current) => policy.compare(&winner, current) == Ordering::Less,
                None => true,
            };
            if replace {
                best.insert(resource.cidr, winner);
            }
        }
    }

    let entries = best
        .into_iter()
        .map(|(cidr, c)| {
            let entry = RouteEntry {
                cidr,
                gateway_peer_id: c.router.peer_id.clone(),
                gateway_ip: c.gateway.assigned_overlay_ip,
                network_id: c.network.id.clone(),
                resource_id: c.resource.id.clone(),
                metric: c.router.metric,
                masquerade: c.router.masquerade,
                is_local_gateway: c.router.peer_id == peer_id,
            };
            (cidr, entry)
        })
        .collect();

    Ok(RouteTable { entries })
}

/// An enabled resource some peer is entitled to that no enabled router serves
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConsistencyWarning {
    pub network_id: NetworkId,
    pub resource_id: ResourceId,
    pub cidr: IpNet,
}

/// Every resource that is entitled but unroutable in `topology`
pub fn consistency_warnings(topology: &Topology) -> BTreeSet<ConsistencyWarning> {
    let populated: BTreeSet<&GroupId> = topology
        .groups
        .values()
        .filter(|g| !g.member_peer_ids.is_empty())
        .map(|g| &g.id)
        .collect();

    let mut warnings = BTreeSet::new();
    for network in topology.networks.values() {
        let routable = topology
            .network_routers(&network.id)
            .any(|r| r.enabled && topology.peers.contains_key(&r.peer_id));
        if routable {
            continue;
        }
        for resource in network.resources.iter().filter(|r| r.enabled) {
            if resource.group_ids.iter().any(|g| populated.contains(g)) {
                warnings.insert(ConsistencyWarning {
                    network_id: network.id.clone(),
                    resource_id: resource.id.clone(),
                    cidr: resource.cidr,
                });
            }
        }
    }
    warnings
}

/// Build the full network map of `peer_id` at the snapshot's serial
pub fn network_map(topology: &Topology, peer_id: &str, policy: RoutePolicy) -> ControlResult<NetworkMap> {
    let me = topology.peer(peer_id)?;
    let routes = recompute(topology, peer_id, policy)?;

    let mut remote_ids: Vec<&PeerId> = topology
        .peers
        .keys()
        .filter(|id| id.as_str() != peer_id && topology.share_group(peer_id, id))
        .collect();
    remote_ids.extend(routes.remote_gateways(peer_id));
    remote_ids.sort();
    remote_ids.dedup();

    let remote_peers = remote_ids
        .into_iter()
        .filter_map(|id| topology.peers.get(id))
        .map(|p| RemotePeer {
            id: p.id.clone(),
            public_key: p.public_key,
            hostname: p.hostname.clone(),
            overlay_ip: p.assigned_overlay_ip,
            candidates: p.address_candidates.clone(),
        })
        .collect();

    Ok(NetworkMap {
        serial: topology.serial,
        peer: PeerConfig {
            id: me.id.clone(),
            public_key: me.public_key,
            hostname: me.hostname.clone(),
            overlay_ip: me.assigned_overlay_ip,
            network_range: topology.network_range(),
        },
        remote_peers,
        routes,
    })
}
