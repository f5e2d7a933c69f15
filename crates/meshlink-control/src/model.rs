//! Control plane data model

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use meshlink_crypto::PublicKey;
use meshlink_network::Candidate;
use serde::{Deserialize, Deserializer, Serialize};

pub type PeerId = String;
pub type GroupId = String;
pub type NetworkId = String;
pub type ResourceId = String;
pub type RouterId = String;

/// Name of the group every peer belongs to
pub const ALL_GROUP: &str = "All";

/// Generate a new object id
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A registered peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub public_key: PublicKey,
    pub hostname: String,
    /// Where the peer says it can be reached, in preference order
    pub address_candidates: Vec<Candidate>,
    #[serde(rename = "ip", alias = "assigned_overlay_ip")]
    pub assigned_overlay_ip: IpAddr,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Group reference as shown on a peer
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
}

/// A peer together with its derived group memberships
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerView {
    #[serde(flatten)]
    pub peer: Peer,
    pub groups: Vec<GroupSummary>,
}

impl PeerView {
    pub fn group_ids(&self) -> BTreeSet<GroupId> {
        self.groups.iter().map(|g| g.id.clone()).collect()
    }

    pub fn in_group(&self, group_id: &str) -> bool {
        self.groups.iter().any(|g| g.id == group_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub member_peer_ids: BTreeSet<PeerId>,
}

/// A CIDR reachable through a network's routers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    #[serde(rename = "address", alias = "cidr")]
    pub cidr: IpNet,
    pub enabled: bool,
    /// Groups entitled to reach this resource
    pub group_ids: BTreeSet<GroupId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub resources: Vec<Resource>,
}

/// A peer acting as gateway into a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: RouterId,
    #[serde(rename = "peer", alias = "peer_id")]
    pub peer_id: PeerId,
    pub network_id: NetworkId,
    /// Lower wins
    pub metric: u32,
    pub masquerade: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSettings {
    /// Overlay address pool
    pub network_range: IpNet,
}

/// First-run state the admin dashboard clears
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Onboarding {
    pub onboarding_flow_pending: bool,
    pub signup_form_pending: bool,
}

impl Default for Onboarding {
    fn default() -> Self {
        Self {
            onboarding_flow_pending: true,
            signup_form_pending: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub settings: AccountSettings,
    #[serde(default)]
    pub onboarding: Onboarding,
}

/// Whether a setup key survives its first use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetupKeyType {
    #[default]
    Reusable,
    OneOff,
}

/// A key agents present to join the account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupKey {
    #[serde(default = "new_id")]
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub key_type: SetupKeyType,
    /// Groups new peers are placed in, by id or by name (created on demand)
    #[serde(default)]
    pub auto_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Peers this key may enroll, 0 for no limit
    #[serde(default)]
    pub usage_limit: u32,
    #[serde(default)]
    pub used_times: u32,
}

impl SetupKey {
    /// Reusable key without expiry or usage limit
    pub fn new(key: impl Into<String>, name: impl Into<String>, auto_groups: Vec<String>) -> Self {
        Self {
            id: new_id(),
            key: key.into(),
            name: name.into(),
            key_type: SetupKeyType::Reusable,
            auto_groups,
            expires_at: None,
            usage_limit: 0,
            used_times: 0,
        }
    }

    /// Why the key may not enroll another peer at `now`
    pub fn rejection(&self, now: DateTime<Utc>) -> Option<&'static str> {
        if self.expires_at.map_or(false, |at| at <= now) {
            return Some("expired");
        }
        if self.key_type == SetupKeyType::OneOff && self.used_times > 0 {
            return Some("one-off key already used");
        }
        if self.usage_limit > 0 && self.used_times >= self.usage_limit {
            return Some("usage limit reached");
        }
        None
    }
}

// ============ Requests ============

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NewGroup {
    pub name: String,
    #[serde(default)]
    pub peers: BTreeSet<PeerId>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub peers: Option<BTreeSet<PeerId>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NewNetwork {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewResource {
    pub name: String,
    #[serde(rename = "address", alias = "cidr")]
    pub cidr: IpNet,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub groups: BTreeSet<GroupId>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResourceUpdate {
    pub name: Option<String>,
    #[serde(default, rename = "address", alias = "cidr")]
    pub cidr: Option<IpNet>,
    pub enabled: Option<bool>,
    pub groups: Option<BTreeSet<GroupId>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewRouter {
    #[serde(rename = "peer", alias = "peer_id")]
    pub peer_id: PeerId,
    #[serde(default = "default_metric")]
    pub metric: u32,
    #[serde(default)]
    pub masquerade: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouterUpdate {
    #[serde(default, rename = "peer", alias = "peer_id")]
    pub peer_id: Option<PeerId>,
    pub metric: Option<u32>,
    pub masquerade: Option<bool>,
    pub enabled: Option<bool>,
}

/// Registration request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewPeer {
    pub id: PeerId,
    pub public_key: PublicKey,
    pub hostname: String,
    #[serde(default)]
    pub address_candidates: Vec<Candidate>,
}

/// Partial peer update. Applied all-or-nothing. A peer as returned by
/// GET is accepted as is; fields that are not editable are ignored.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PeerUpdate {
    pub hostname: Option<String>,
    #[serde(default, rename = "ip", alias = "assigned_overlay_ip")]
    pub assigned_overlay_ip: Option<IpAddr>,
    /// Group ids, or group objects carrying an `id`
    #[serde(default, deserialize_with = "group_refs")]
    pub groups: Option<BTreeSet<GroupId>>,
    pub address_candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GroupRef {
    Id(GroupId),
    Object { id: GroupId },
}

fn group_refs<'de, D>(deserializer: D) -> Result<Option<BTreeSet<GroupId>>, D::Error>
where
    D: Deserializer<'de>,
{
    let refs: Option<Vec<GroupRef>> = Option::deserialize(deserializer)?;
    Ok(refs.map(|refs| {
        refs.into_iter()
            .map(|r| match r {
                GroupRef::Id(id) | GroupRef::Object { id } => id,
            })
            .collect()
    }))
}

/// Setup key creation request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewSetupKey {
    pub name: String,
    #[serde(default, rename = "type")]
    pub key_type: SetupKeyType,
    /// Seconds until the key expires, 0 for never
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub auto_groups: Vec<String>,
    /// 0 for no limit
    #[serde(default)]
    pub usage_limit: u32,
}

/// Peer list filter
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PeerFilter {
    pub hostname: Option<String>,
    pub group: Option<GroupId>,
    pub connected: Option<bool>,
}

impl PeerFilter {
    pub fn matches(&self, view: &PeerView) -> bool {
        self.hostname.as_ref().map_or(true, |h| &view.peer.hostname == h)
            && self
                .group
                .as_ref()
                .map_or(true, |g| view.groups.iter().any(|s| &s.id == g || &s.name == g))
            && self.connected.map_or(true, |c| view.peer.connected == c)
    }
}

fn default_true() -> bool {
    true
}

fn default_metric() -> u32 {
    9999
}

// ============ Route output ============

/// Where traffic for one CIDR goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub cidr: IpNet,
    pub gateway_peer_id: PeerId,
    pub gateway_ip: IpAddr,
    pub network_id: NetworkId,
    pub resource_id: ResourceId,
    pub metric: u32,
    pub masquerade: bool,
    /// The receiving peer is the gateway for this route
    pub is_local_gateway: bool,
}

/// Routes for one peer, ordered by CIDR
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteTable {
    pub entries: BTreeMap<IpNet, RouteEntry>,
}

impl RouteTable {
    pub fn get(&self, cidr: &IpNet) -> Option<&RouteEntry> {
        self.entries.get(cidr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }

    /// Gateways other than `self_id`
    pub fn remote_gateways<'a>(&'a self, self_id: &'a str) -> impl Iterator<Item = &'a PeerId> + 'a {
        self.entries
            .values()
            .filter(move |e| !e.is_local_gateway && e.gateway_peer_id != self_id)
            .map(|e| &e.gateway_peer_id)
    }
}

/// Configuration of the receiving peer itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: PeerId,
    pub public_key: PublicKey,
    pub hostname: String,
    pub overlay_ip: IpAddr,
    pub network_range: IpNet,
}

/// A peer the receiver may open a session to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeer {
    pub id: PeerId,
    pub public_key: PublicKey,
    pub hostname: String,
    pub overlay_ip: IpAddr,
    pub candidates: Vec<Candidate>,
}

/// Everything an agent needs to converge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMap {
    pub serial: u64,
    pub peer: PeerConfig,
    pub remote_peers: Vec<RemotePeer>,
    pub routes: RouteTable,
}

impl NetworkMap {
    /// Equal apart from the serial
    pub fn same_content(&self, other: &NetworkMap) -> bool {
        self.peer == other.peer && self.remote_peers == other.remote_peers && self.routes == other.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_one_off_key_is_spent_after_first_use() {
        let mut key = SetupKey::new("k", "once", Vec::new());
        key.key_type = SetupKeyType::OneOff;
        assert_eq!(key.rejection(Utc::now()), None);
        key.used_times = 1;
        assert!(key.rejection(Utc::now()).is_some());
    }

    #[test]
    fn test_usage_limit_and_expiry() {
        let now = Utc::now();
        let mut key = SetupKey::new("k", "ci", Vec::new());
        key.usage_limit = 2;
        key.used_times = 1;
        assert_eq!(key.rejection(now), None);
        key.used_times = 2;
        assert_eq!(key.rejection(now), Some("usage limit reached"));

        let mut key = SetupKey::new("k", "ci", Vec::new());
        key.expires_at = Some(now - Duration::seconds(1));
        assert_eq!(key.rejection(now), Some("expired"));
    }

    #[test]
    fn test_setup_key_type_names() {
        let req: NewSetupKey = serde_json::from_value(serde_json::json!({
            "name": "test-setup-key",
            "type": "one-off",
            "expires_in": 86400,
            "auto_groups": [],
            "usage_limit": 0,
        }))
        .unwrap();
        assert_eq!(req.key_type, SetupKeyType::OneOff);
        assert_eq!(serde_json::to_value(SetupKeyType::Reusable).unwrap(), "reusable");
    }

    #[test]
    fn test_wire_names_and_aliases() {
        let resource: NewResource = serde_json::from_value(serde_json::json!({
            "name": "lan",
            "address": "10.50.0.0/24",
        }))
        .unwrap();
        assert_eq!(resource.cidr.to_string(), "10.50.0.0/24");
        let legacy: NewResource = serde_json::from_value(serde_json::json!({
            "name": "lan",
            "cidr": "10.50.0.0/24",
        }))
        .unwrap();
        assert_eq!(legacy.cidr, resource.cidr);

        let router: NewRouter = serde_json::from_value(serde_json::json!({ "peer": "gw" })).unwrap();
        assert_eq!(router.peer_id, "gw");
        let router: NewRouter = serde_json::from_value(serde_json::json!({ "peer_id": "gw" })).unwrap();
        assert_eq!(router.peer_id, "gw");

        let stored = Router {
            id: "r".into(),
            peer_id: "gw".into(),
            network_id: "n".into(),
            metric: 1,
            masquerade: false,
            enabled: true,
        };
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["peer"], "gw");
        assert!(json.get("peer_id").is_none());
    }

    #[test]
    fn test_peer_view_puts_back_as_update() {
        let view = PeerView {
            peer: Peer {
                id: "p".into(),
                public_key: meshlink_crypto::KeyPair::generate().public,
                hostname: "machine2".into(),
                address_candidates: Vec::new(),
                assigned_overlay_ip: "100.64.0.7".parse().unwrap(),
                connected: true,
                last_seen: Some(Utc::now()),
            },
            groups: vec![GroupSummary { id: "g1".into(), name: "All".into() }],
        };

        let mut json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["ip"], "100.64.0.7");
        assert_eq!(json["groups"][0]["name"], "All");
        json["ip"] = "100.64.0.9".into();

        let update: PeerUpdate = serde_json::from_value(json).unwrap();
        assert_eq!(update.assigned_overlay_ip, Some("100.64.0.9".parse().unwrap()));
        assert_eq!(update.groups, Some(BTreeSet::from(["g1".to_string()])));
        assert_eq!(update.hostname.as_deref(), Some("machine2"));

        let by_id: PeerUpdate = serde_json::from_value(serde_json::json!({ "groups": ["g2"] })).unwrap();
        assert_eq!(by_id.groups, Some(BTreeSet::from(["g2".to_string()])));
    }
}
