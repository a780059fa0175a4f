//! The link graph: all inter-router links plus least-cost path
//! computation over the connected subgraph.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;

use trellis_domain::error::CircuitFailureCause;
use trellis_domain::{Error, Result};

use super::link::{Link, LinkState};
use super::router::{RouterRegistry, RouterState};

/// Path cost contributions are capped so one pathological latency sample
/// cannot dominate the additive terminator cost model.
const MAX_PATH_COST: u64 = 1 << 20;

pub struct LinkGraph {
    links: DashMap<String, Arc<Link>>,
    initial_latency_ms: u64,
}

impl LinkGraph {
    pub fn new(initial_latency_ms: u64) -> Self {
        Self {
            links: DashMap::new(),
            initial_latency_ms,
        }
    }

    pub fn get(&self, link_id: &str) -> Option<Arc<Link>> {
        self.links.get(link_id).map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<Link>> {
        self.links.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Register a link both routers will see in their link views.
    pub fn add(&self, link: Arc<Link>, registry: &RouterRegistry) {
        if let Some(src) = registry.get(&link.src) {
            src.links.add(link.clone(), &link.dst);
        }
        if let Some(dst) = registry.get(&link.dst) {
            dst.links.add(link.clone(), &link.src);
        }
        self.links.insert(link.id.clone(), link);
    }

    /// Upsert from a router's link report. Returns the link and whether
    /// it was newly created. A report with a newer iteration replaces
    /// the stale record.
    pub fn router_reported_link(
        &self,
        link_id: &str,
        iteration: u32,
        protocol: &str,
        dial_address: &str,
        src_router_id: &str,
        dst_router_id: &str,
        registry: &RouterRegistry,
    ) -> (Arc<Link>, bool) {
        if let Some(existing) = self.get(link_id) {
            if existing.iteration() >= iteration {
                existing.touch();
                return (existing, false);
            }
            self.remove(&existing, registry);
        }
        let link = Arc::new(Link::new(
            link_id,
            src_router_id,
            dst_router_id,
            protocol,
            dial_address,
            iteration,
            self.initial_latency_ms,
        ));
        link.set_state(LinkState::Connected);
        self.add(link.clone(), registry);
        (link, true)
    }

    pub fn remove(&self, link: &Arc<Link>, registry: &RouterRegistry) {
        self.links.remove(&link.id);
        if let Some(src) = registry.get(&link.src) {
            src.links.remove(&link.id, &link.dst);
        }
        if let Some(dst) = registry.get(&link.dst) {
            dst.links.remove(&link.id, &link.src);
        }
    }

    /// The cheapest connected link between an ordered router pair.
    pub fn least_expensive_link(
        &self,
        registry: &RouterRegistry,
        a: &str,
        b: &str,
    ) -> Option<Arc<Link>> {
        let router = registry.get(a)?;
        let by_other = router.links.by_other_router();
        by_other
            .get(b)?
            .iter()
            .filter(|l| l.is_usable())
            .min_by_key(|l| l.cost())
            .cloned()
    }

    /// Least-cost path from `src` to `dst` over connected routers and
    /// connected links. Routers with `no_traversal` stay valid endpoints
    /// but are skipped as intermediate hops.
    ///
    /// The self-path is a single node with zero cost.
    pub fn shortest_path(
        &self,
        registry: &RouterRegistry,
        src: &str,
        dst: &str,
    ) -> Result<(Vec<Arc<RouterState>>, u64)> {
        let no_path = |msg: String| Error::circuit(CircuitFailureCause::NoPath, msg);

        let src_state = registry
            .get_connected(src)
            .ok_or_else(|| no_path(format!("source router {src} is not connected")))?;
        if src == dst {
            return Ok((vec![src_state], 0));
        }
        let dst_state = registry
            .get_connected(dst)
            .ok_or_else(|| no_path(format!("destination router {dst} is not connected")))?;

        let mut dist: HashMap<String, u64> = HashMap::new();
        let mut prev: HashMap<String, String> = HashMap::new();
        let mut heap: BinaryHeap<(Reverse<u64>, String)> = BinaryHeap::new();
        dist.insert(src.to_string(), 0);
        heap.push((Reverse(0), src.to_string()));

        while let Some((Reverse(cost), router_id)) = heap.pop() {
            if router_id == dst {
                break;
            }
            if cost > *dist.get(&router_id).unwrap_or(&u64::MAX) {
                continue;
            }
            let Some(router) = registry.get_connected(&router_id) else {
                continue;
            };
            // Only the source may be traversed when flagged no-traversal.
            if router_id != src && router_id != dst && router.no_traversal() {
                continue;
            }

            let by_other = router.links.by_other_router();
            for (neighbor_id, links) in by_other.iter() {
                let Some(neighbor) = registry.get_connected(neighbor_id) else {
                    continue;
                };
                if neighbor_id != dst && neighbor.no_traversal() {
                    continue;
                }
                let Some(link_cost) = links
                    .iter()
                    .filter(|l| l.is_usable())
                    .map(|l| l.cost())
                    .min()
                else {
                    continue;
                };
                let hop_cost = link_cost.min(MAX_PATH_COST) + neighbor.cost() as u64;
                let next = cost.saturating_add(hop_cost);
                if next < *dist.get(neighbor_id).unwrap_or(&u64::MAX) {
                    dist.insert(neighbor_id.clone(), next);
                    prev.insert(neighbor_id.clone(), router_id.clone());
                    heap.push((Reverse(next), neighbor_id.clone()));
                }
            }
        }

        let total = *dist
            .get(dst)
            .ok_or_else(|| no_path(format!("no path from {src} to {dst}")))?;

        let mut order = vec![dst.to_string()];
        let mut cursor = dst.to_string();
        while let Some(previous) = prev.get(&cursor) {
            order.push(previous.clone());
            cursor = previous.clone();
        }
        order.reverse();

        let mut nodes = Vec::with_capacity(order.len());
        for router_id in &order {
            nodes.push(
                registry
                    .get_connected(router_id)
                    .ok_or_else(|| no_path(format!("router {router_id} dropped mid-computation")))?,
            );
        }
        debug_assert_eq!(nodes.first().map(|n| n.id()), Some(src.to_string()));
        debug_assert_eq!(nodes.last().map(|n| n.id()), Some(dst_state.id()));
        Ok((nodes, total.min(MAX_PATH_COST)))
    }

    /// Links with no activity within `max_idle` are marked failed.
    /// Returns the newly failed links.
    pub fn scan_for_dead_links(&self, max_idle: Duration) -> Vec<Arc<Link>> {
        let cutoff = Utc::now() - max_idle;
        let mut failed = Vec::new();
        for entry in self.links.iter() {
            let link = entry.value();
            if link.state() == LinkState::Connected && link.last_activity() < cutoff {
                link.set_state(LinkState::Failed);
                tracing::warn!(link_id = %link.id, "link has gone quiet, marking failed");
                failed.push(link.clone());
            }
        }
        failed
    }

    /// Drop failed links older than the grace window. Returns the
    /// removed links.
    pub fn clean(&self, registry: &RouterRegistry, grace: Duration) -> Vec<Arc<Link>> {
        let cutoff = Utc::now() - grace;
        let stale: Vec<Arc<Link>> = self
            .links
            .iter()
            .filter(|e| e.value().state() == LinkState::Failed && e.value().state_since() < cutoff)
            .map(|e| e.value().clone())
            .collect();
        for link in &stale {
            self.remove(link, registry);
            tracing::info!(link_id = %link.id, "removed failed link");
        }
        stale
    }

    /// Pending links older than the timeout whose connected side is
    /// still healthy; the supervisor redials these.
    pub fn links_to_reassemble(
        &self,
        registry: &RouterRegistry,
        pending_timeout: Duration,
    ) -> Vec<Arc<Link>> {
        let cutoff = Utc::now() - pending_timeout;
        self.links
            .iter()
            .filter(|e| {
                let link = e.value();
                link.state() == LinkState::Pending
                    && link.state_since() < cutoff
                    && registry.is_connected(&link.src)
            })
            .map(|e| e.value().clone())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::channel::testing::StubChannel;
    use trellis_domain::model::Router;

    /// Build a registry of connected routers plus a graph with the given
    /// connected links `(id, src, dst, cost)`.
    pub fn mesh(routers: &[&str], links: &[(&str, &str, &str, u16)]) -> (RouterRegistry, LinkGraph) {
        let registry = RouterRegistry::new();
        for id in routers {
            registry.put(Router {
                id: id.to_string(),
                name: id.to_string(),
                ..Default::default()
            });
            registry
                .mark_connected(
                    id,
                    Arc::new(StubChannel::new(id)),
                    "1.0.0".into(),
                    vec![],
                    None,
                )
                .unwrap();
        }
        let graph = LinkGraph::new(0);
        for (id, src, dst, cost) in links {
            let link =
                Arc::new(Link::new(*id, *src, *dst, "tls", "addr", 0, 0).with_static_cost(*cost));
            link.set_state(LinkState::Connected);
            graph.add(link, &registry);
        }
        (registry, graph)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::mesh;
    use super::*;

    fn path_ids(nodes: &[Arc<RouterState>]) -> Vec<String> {
        nodes.iter().map(|n| n.id()).collect()
    }

    #[test]
    fn self_path_is_single_node_zero_cost() {
        let (registry, graph) = mesh(&["r1"], &[]);
        let (nodes, cost) = graph.shortest_path(&registry, "r1", "r1").unwrap();
        assert_eq!(path_ids(&nodes), vec!["r1"]);
        assert_eq!(cost, 0);
    }

    #[test]
    fn picks_cheapest_route() {
        let (registry, graph) = mesh(
            &["r1", "r2", "r3", "r4"],
            &[
                ("l12", "r1", "r2", 10),
                ("l23", "r2", "r3", 10),
                ("l14", "r1", "r4", 5),
                ("l43", "r4", "r3", 100),
            ],
        );
        let (nodes, cost) = graph.shortest_path(&registry, "r1", "r3").unwrap();
        assert_eq!(path_ids(&nodes), vec!["r1", "r2", "r3"]);
        assert_eq!(cost, 20);
    }

    #[test]
    fn links_are_bidirectional_for_pathing() {
        let (registry, graph) = mesh(&["r1", "r2"], &[("l21", "r2", "r1", 3)]);
        let (nodes, _) = graph.shortest_path(&registry, "r1", "r2").unwrap();
        assert_eq!(path_ids(&nodes), vec!["r1", "r2"]);
    }

    #[test]
    fn no_traversal_router_is_skipped_as_hop() {
        let (registry, graph) = mesh(
            &["r1", "r2", "r3"],
            &[("l12", "r1", "r2", 1), ("l23", "r2", "r3", 1)],
        );
        let r2 = registry.get("r2").unwrap();
        let mut def = r2.def();
        def.no_traversal = true;
        r2.update_def(def);

        // r2 is still a valid endpoint...
        assert!(graph.shortest_path(&registry, "r1", "r2").is_ok());
        // ...but not a transit hop.
        let err = graph.shortest_path(&registry, "r1", "r3").unwrap_err();
        assert_eq!(err.circuit_cause(), Some(CircuitFailureCause::NoPath));
    }

    #[test]
    fn failed_links_are_not_traversed() {
        let (registry, graph) = mesh(&["r1", "r2"], &[("l12", "r1", "r2", 1)]);
        graph.get("l12").unwrap().set_state(LinkState::Failed);
        assert!(graph.shortest_path(&registry, "r1", "r2").is_err());
    }

    #[test]
    fn disconnected_destination_is_no_path() {
        let (registry, graph) = mesh(&["r1", "r2"], &[("l12", "r1", "r2", 1)]);
        registry.mark_disconnected("r2");
        // Disconnect clears r2's links but r1 still holds its side; the
        // connected check rejects the path.
        assert!(graph.shortest_path(&registry, "r1", "r2").is_err());
    }

    #[test]
    fn least_expensive_link_prefers_lower_cost() {
        let (registry, graph) = mesh(
            &["r1", "r2"],
            &[("la", "r1", "r2", 50), ("lb", "r1", "r2", 5)],
        );
        let best = graph.least_expensive_link(&registry, "r1", "r2").unwrap();
        assert_eq!(best.id, "lb");
    }

    #[test]
    fn newer_iteration_replaces_reported_link() {
        let (registry, graph) = mesh(&["r1", "r2"], &[]);
        let (first, created) =
            graph.router_reported_link("l1", 1, "tls", "addr", "r1", "r2", &registry);
        assert!(created);
        let (same, created) =
            graph.router_reported_link("l1", 1, "tls", "addr", "r1", "r2", &registry);
        assert!(!created);
        assert_eq!(same.iteration(), first.iteration());

        let (newer, created) =
            graph.router_reported_link("l1", 3, "tls", "addr2", "r1", "r2", &registry);
        assert!(created);
        assert_eq!(newer.iteration(), 3);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn dead_link_scan_fails_idle_links() {
        let (_registry, graph) = mesh(&["r1", "r2"], &[("l12", "r1", "r2", 1)]);
        // Zero idle allowance: everything connected is "dead".
        let failed = graph.scan_for_dead_links(Duration::zero());
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].state(), LinkState::Failed);
    }

    #[test]
    fn clean_drops_old_failed_links() {
        let (registry, graph) = mesh(&["r1", "r2"], &[("l12", "r1", "r2", 1)]);
        graph.get("l12").unwrap().set_state(LinkState::Failed);
        // Inside grace: kept.
        assert!(graph.clean(&registry, Duration::seconds(60)).is_empty());
        // Grace of zero: dropped, including the router link views.
        assert_eq!(graph.clean(&registry, Duration::zero()).len(), 1);
        assert!(graph.is_empty());
        assert!(registry.get("r1").unwrap().links.all().is_empty());
    }
}
