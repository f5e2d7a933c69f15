//! Local route application
//!
//! The agent keeps the route table it last applied and converges the host
//! towards each new table by diffing the two. Entries for which this peer
//! is the gateway are forwarded, not routed, so they never reach the
//! applier.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use ipnet::IpNet;
use meshlink_control::{RouteEntry, RouteTable};
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};

/// Installs routes on the host
#[async_trait]
pub trait RouteApplier: Send + Sync {
    /// Add a route that is not present yet
    async fn add(&self, entry: &RouteEntry) -> CoreResult<()>;

    /// Point an existing route at a new gateway
    async fn replace(&self, entry: &RouteEntry) -> CoreResult<()>;

    /// Remove a route
    async fn remove(&self, cidr: &IpNet) -> CoreResult<()>;
}

/// Changes needed to go from one table to another
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDiff {
    pub add: Vec<RouteEntry>,
    pub remove: Vec<IpNet>,
    pub replace: Vec<RouteEntry>,
}

impl RouteDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.replace.is_empty()
    }

    pub fn len(&self) -> usize {
        self.add.len() + self.remove.len() + self.replace.len()
    }
}

/// Routes this peer installs on its own host
fn installable(table: &RouteTable) -> BTreeMap<IpNet, &RouteEntry> {
    table
        .iter()
        .filter(|e| !e.is_local_gateway)
        .map(|e| (e.cidr, e))
        .collect()
}

/// Diff two route tables. Local gateway entries are ignored on both sides.
pub fn diff(current: &RouteTable, desired: &RouteTable) -> RouteDiff {
    let current = installable(current);
    let desired = installable(desired);
    let mut out = RouteDiff::default();

    for (cidr, entry) in &desired {
        match current.get(cidr) {
            None => out.add.push((*entry).clone()),
            Some(old) if *old != *entry => out.replace.push((*entry).clone()),
            Some(_) => {}
        }
    }
    for cidr in current.keys() {
        if !desired.contains_key(cidr) {
            out.remove.push(*cidr);
        }
    }

    out
}

/// Result of one apply pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub failed: Vec<IpNet>,
}

impl ApplyOutcome {
    pub fn converged(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
struct Applied {
    table: RouteTable,
    converged: bool,
}

/// Routes currently installed on this host
#[derive(Debug, Default)]
pub struct LocalRoutes {
    applied: Mutex<Applied>,
}

impl LocalRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table as last applied. Failed entries are left out so the next
    /// apply retries them.
    pub fn current(&self) -> RouteTable {
        self.applied().table.clone()
    }

    /// Whether the last apply installed every entry
    pub fn converged(&self) -> bool {
        self.applied().converged
    }

    /// Converge the host towards `desired`
    pub async fn apply(&self, desired: &RouteTable, applier: &dyn RouteApplier) -> ApplyOutcome {
        let current = self.current();
        let changes = diff(&current, desired);
        let mut outcome = ApplyOutcome::default();
        let mut table = current;

        if !changes.is_empty() {
            info!(
                "Applying routes: {} add, {} replace, {} remove",
                changes.add.len(),
                changes.replace.len(),
                changes.remove.len()
            );
        }

        for cidr in &changes.remove {
            match applier.remove(cidr).await {
                Ok(()) => {
                    table.entries.remove(cidr);
                    outcome.applied += 1;
                }
                Err(e) => {
                    warn!("Failed to remove route {}: {}", cidr, e);
                    outcome.failed.push(*cidr);
                }
            }
        }

        for entry in &changes.replace {
            match applier.replace(entry).await {
                Ok(()) => {
                    table.entries.insert(entry.cidr, entry.clone());
                    outcome.applied += 1;
                }
                Err(e) => {
                    warn!("Failed to replace route {}: {}", entry.cidr, e);
                    outcome.failed.push(entry.cidr);
                }
            }
        }

        for entry in &changes.add {
            match applier.add(entry).await {
                Ok(()) => {
                    table.entries.insert(entry.cidr, entry.clone());
                    outcome.applied += 1;
                }
                Err(e) => {
                    warn!("Failed to add route {}: {}", entry.cidr, e);
                    outcome.failed.push(entry.cidr);
                }
            }
        }

        // Forwarded routes are tracked for status, never installed
        table.entries.retain(|_, e| !e.is_local_gateway);
        for entry in desired.iter().filter(|e| e.is_local_gateway) {
            debug!("Serving {} as gateway (masquerade: {})", entry.cidr, entry.masquerade);
            table.entries.insert(entry.cidr, entry.clone());
        }

        let mut applied = self.applied();
        applied.table = table;
        applied.converged = outcome.converged();
        outcome
    }

    /// Remove everything this host installed
    pub async fn clear(&self, applier: &dyn RouteApplier) -> ApplyOutcome {
        self.apply(&RouteTable::default(), applier).await
    }

    fn applied(&self) -> std::sync::MutexGuard<'_, Applied> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Applier that only logs. Used when the agent has no interface to route
/// through.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingApplier;

#[async_trait]
impl RouteApplier for LoggingApplier {
    async fn add(&self, entry: &RouteEntry) -> CoreResult<()> {
        info!("Route {} via {} ({})", entry.cidr, entry.gateway_ip, entry.gateway_peer_id);
        Ok(())
    }

    async fn replace(&self, entry: &RouteEntry) -> CoreResult<()> {
        info!("Route {} now via {} ({})", entry.cidr, entry.gateway_ip, entry.gateway_peer_id);
        Ok(())
    }

    async fn remove(&self, cidr: &IpNet) -> CoreResult<()> {
        info!("Route {} removed", cidr);
        Ok(())
    }
}

/// Applier driving `ip route` on Linux
#[derive(Debug, Clone)]
pub struct LinuxRouteApplier {
    interface: String,
}

impl LinuxRouteApplier {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    async fn ip(&self, args: &[&str]) -> CoreResult<()> {
        use tokio::process::Command;

        debug!("ip {}", args.join(" "));
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| CoreError::Route(format!("Failed to run ip: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::Route(stderr.trim().to_string()));
        }

        Ok(())
    }

    async fn route_via(&self, entry: &RouteEntry) -> CoreResult<()> {
        let cidr = entry.cidr.to_string();
        let gateway = entry.gateway_ip.to_string();
        self.ip(&["route", "replace", &cidr, "via", &gateway, "dev", &self.interface])
            .await
    }
}

#[async_trait]
impl RouteApplier for LinuxRouteApplier {
    async fn add(&self, entry: &RouteEntry) -> CoreResult<()> {
        // `replace` also creates, and tolerates leftovers from a crashed run
        self.route_via(entry).await
    }

    async fn replace(&self, entry: &RouteEntry) -> CoreResult<()> {
        self.route_via(entry).await
    }

    async fn remove(&self, cidr: &IpNet) -> CoreResult<()> {
        let cidr = cidr.to_string();
        self.ip(&["route", "del", &cidr, "dev", &self.interface]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::net::IpAddr;

    fn entry(cidr: &str, gateway: &str, ip: &str) -> RouteEntry {
        RouteEntry {
            cidr: cidr.parse().unwrap(),
            gateway_peer_id: gateway.into(),
            gateway_ip: ip.parse::<IpAddr>().unwrap(),
            network_id: "net".into(),
            resource_id: format!("res-{}", cidr),
            metric: 100,
            masquerade: false,
            is_local_gateway: false,
        }
    }

    fn table(entries: Vec<RouteEntry>) -> RouteTable {
        RouteTable {
            entries: entries.into_iter().map(|e| (e.cidr, e)).collect(),
        }
    }

    /// Records calls; fails for the configured CIDRs
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        failing: BTreeSet<IpNet>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String, cidr: &IpNet) -> CoreResult<()> {
            self.calls.lock().unwrap().push(call);
            if self.failing.contains(cidr) {
                Err(CoreError::Route("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl RouteApplier for Recorder {
        async fn add(&self, entry: &RouteEntry) -> CoreResult<()> {
            self.record(format!("add {}", entry.cidr), &entry.cidr)
        }

        async fn replace(&self, entry: &RouteEntry) -> CoreResult<()> {
            self.record(format!("replace {}", entry.cidr), &entry.cidr)
        }

        async fn remove(&self, cidr: &IpNet) -> CoreResult<()> {
            self.record(format!("remove {}", cidr), cidr)
        }
    }

    #[test]
    fn test_diff() {
        let current = table(vec![
            entry("10.1.0.0/24", "a", "100.64.0.1"),
            entry("10.2.0.0/24", "a", "100.64.0.1"),
        ]);
        let desired = table(vec![
            entry("10.2.0.0/24", "b", "100.64.0.2"),
            entry("10.3.0.0/24", "a", "100.64.0.1"),
        ]);

        let d = diff(&current, &desired);
        assert_eq!(d.add, vec![entry("10.3.0.0/24", "a", "100.64.0.1")]);
        assert_eq!(d.replace, vec![entry("10.2.0.0/24", "b", "100.64.0.2")]);
        assert_eq!(d.remove, vec!["10.1.0.0/24".parse::<IpNet>().unwrap()]);

        assert!(diff(&desired, &desired).is_empty());
    }

    #[test]
    fn test_diff_skips_local_gateway() {
        let mut local = entry("10.50.0.0/24", "me", "100.64.0.9");
        local.is_local_gateway = true;
        let d = diff(&RouteTable::default(), &table(vec![local]));
        assert!(d.is_empty());
    }

    #[tokio::test]
    async fn test_apply_converges() {
        let routes = LocalRoutes::new();
        let applier = Recorder::default();
        let first = table(vec![entry("10.1.0.0/24", "a", "100.64.0.1")]);

        let outcome = routes.apply(&first, &applier).await;
        assert!(outcome.converged());
        assert!(routes.converged());
        assert_eq!(routes.current(), first);

        // Same table again is a no-op
        routes.apply(&first, &applier).await;
        assert_eq!(applier.calls(), vec!["add 10.1.0.0/24"]);

        routes.clear(&applier).await;
        assert!(routes.current().is_empty());
        assert_eq!(applier.calls().last().unwrap(), "remove 10.1.0.0/24");
    }

    #[tokio::test]
    async fn test_failed_entry_is_retried() {
        let routes = LocalRoutes::new();
        let mut applier = Recorder::default();
        applier.failing.insert("10.2.0.0/24".parse().unwrap());
        let desired = table(vec![
            entry("10.1.0.0/24", "a", "100.64.0.1"),
            entry("10.2.0.0/24", "a", "100.64.0.1"),
        ]);

        let outcome = routes.apply(&desired, &applier).await;
        assert_eq!(outcome.applied, 1);
        assert!(!routes.converged());
        assert_eq!(routes.current().len(), 1);

        applier.failing.clear();
        let outcome = routes.apply(&desired, &applier).await;
        assert_eq!(outcome.applied, 1);
        assert!(routes.converged());
        assert_eq!(routes.current(), desired);
    }

    #[tokio::test]
    async fn test_local_gateway_is_tracked_not_installed() {
        let routes = LocalRoutes::new();
        let applier = Recorder::default();
        let mut local = entry("10.50.0.0/24", "me", "100.64.0.9");
        local.is_local_gateway = true;

        routes.apply(&table(vec![local.clone()]), &applier).await;
        assert!(applier.calls().is_empty());
        assert!(routes.converged());
        assert_eq!(routes.current().get(&local.cidr), Some(&local));

        routes.clear(&applier).await;
        assert!(routes.current().is_empty());
        assert!(applier.calls().is_empty());
    }
}
