//! The circuit engine: terminator selection, path computation, route
//! program dispatch with retries and cleanup, reroute and teardown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use trellis_domain::error::CircuitFailureCause;
use trellis_domain::model::{Service, Terminator};
use trellis_domain::{Error, Result};
use trellis_protocol::frame::header;
use trellis_protocol::msgs::{Egress, Route, Unroute};
use trellis_protocol::{ContentType, Frame};

use crate::events::{CircuitEvent, CircuitEventType, Event, EventDispatcher};
use crate::fabric::{LinkGraph, RouterRegistry};
use crate::store::{Db, Stores};

use super::sequence::IdSequence;
use super::strategy::{
    CostedTerminator, StrategyEvent, StrategyPeerData, StrategyRegistry, TerminatorStrategy,
};

/// Attempt number used for reroute pushes: routers treat a route program
/// for a circuit id they already host as an update, so untouched nodes
/// are a no-op.
pub const SMART_REROUTE_ATTEMPT: u32 = 99_969_996;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path & circuit records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Path {
    /// Router ids, initiator first, terminator router last.
    pub nodes: Vec<String>,
    /// Link ids joining adjacent nodes; `nodes.len() - 1` entries.
    pub links: Vec<String>,
    pub ingress_token: String,
    pub egress_token: String,
    pub initiator_local_addr: String,
    pub initiator_remote_addr: String,
    pub terminator_local_addr: String,
    pub terminator_remote_addr: String,
}

impl Path {
    pub fn uses_link(&self, link_id: &str) -> bool {
        self.links.iter().any(|l| l == link_id)
    }

    pub fn uses_router(&self, router_id: &str) -> bool {
        self.nodes.iter().any(|n| n == router_id)
    }

    pub fn ingress_router(&self) -> Option<&str> {
        self.nodes.first().map(String::as_str)
    }

    pub fn egress_router(&self) -> Option<&str> {
        self.nodes.last().map(String::as_str)
    }
}

#[derive(Debug)]
pub struct Circuit {
    pub id: String,
    pub client_token: String,
    pub service_id: String,
    pub instance_id: String,
    pub created_at: DateTime<Utc>,
    pub tags: HashMap<String, String>,
    terminator: Mutex<Terminator>,
    path: Mutex<Path>,
    peer_data: Mutex<HashMap<i32, Vec<u8>>>,
    updated_at: Mutex<DateTime<Utc>>,
    /// Single-writer reroute guard, acquired by compare-and-set.
    rerouting: AtomicBool,
}

impl Circuit {
    pub fn path(&self) -> Path {
        self.path.lock().clone()
    }

    pub fn terminator(&self) -> Terminator {
        self.terminator.lock().clone()
    }

    pub fn peer_data(&self) -> HashMap<i32, Vec<u8>> {
        self.peer_data.lock().clone()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        *self.updated_at.lock()
    }
}

/// Inputs of one circuit request.
#[derive(Debug, Clone)]
pub struct CreateCircuitParams {
    pub client_token: String,
    /// Opaque dial headers from the client (address metadata included).
    pub peer_data: HashMap<i32, Vec<u8>>,
    /// Service id, optionally prefixed `instanceId@`.
    pub service: String,
    /// Router the dial arrived on.
    pub source_router_id: String,
    pub deadline: Duration,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub create_circuit_retries: u32,
    pub route_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            create_circuit_retries: 3,
            route_timeout: Duration::from_secs(10),
        }
    }
}

fn parse_instance_id(service: &str) -> (String, String) {
    match service.split_once('@') {
        Some((instance, service)) => (instance.to_string(), service.to_string()),
        None => (String::new(), service.to_string()),
    }
}

enum RouteOutcome {
    Success(HashMap<i32, Vec<u8>>),
    Retryable(String),
    Fatal(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CircuitEngine {
    registry: Arc<RouterRegistry>,
    graph: Arc<LinkGraph>,
    db: Db,
    stores: Arc<Stores>,
    strategies: Arc<StrategyRegistry>,
    events: Arc<EventDispatcher>,
    circuits: DashMap<String, Arc<Circuit>>,
    sequence: IdSequence,
    config: EngineConfig,
}

impl CircuitEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: &str,
        registry: Arc<RouterRegistry>,
        graph: Arc<LinkGraph>,
        db: Db,
        stores: Arc<Stores>,
        strategies: Arc<StrategyRegistry>,
        events: Arc<EventDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            graph,
            db,
            stores,
            strategies,
            events,
            circuits: DashMap::new(),
            sequence: IdSequence::new(node_id),
            config,
        }
    }

    pub fn get(&self, circuit_id: &str) -> Option<Arc<Circuit>> {
        self.circuits.get(circuit_id).map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<Circuit>> {
        self.circuits.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    // ── creation ────────────────────────────────────────────────────

    pub async fn create_circuit(&self, params: CreateCircuitParams) -> Result<Arc<Circuit>> {
        let started = Instant::now();
        let (instance_id, service_id) = parse_instance_id(&params.service);
        let circuit_id = self.sequence.next_hash();

        let mut attempt: u32 = 0;
        // Routers that accepted a route on any attempt and may hold
        // forwarding state for this circuit.
        let mut cleanups: HashSet<String> = HashSet::new();

        loop {
            let service = match self.lookup_service(&service_id) {
                Ok(service) => service,
                Err(err) => {
                    self.circuit_failed(&circuit_id, &params, &service_id, &err);
                    return Err(err);
                }
            };

            let selection =
                match self.select_path(&params, &service, &instance_id) {
                    Ok(selection) => selection,
                    Err(err) => {
                        self.circuit_failed(&circuit_id, &params, &service_id, &err);
                        self.unroute_routers(cleanups.iter(), &circuit_id).await;
                        return Err(err);
                    }
                };
            let (strategy, terminator, path_nodes, strategy_data) = selection;

            let mut path = match self.build_path(&path_nodes) {
                Ok(path) => path,
                Err(err) => {
                    self.circuit_failed(&circuit_id, &params, &service_id, &err);
                    self.unroute_routers(cleanups.iter(), &circuit_id).await;
                    return Err(err);
                }
            };

            tracing::debug!(
                circuit_id = %circuit_id,
                service_id = %service_id,
                terminator_id = %terminator.id,
                attempt,
                path = ?path.nodes,
                "route attempt for circuit"
            );

            match self
                .route_path(&circuit_id, attempt, &path, &terminator, &params, &mut cleanups)
                .await
            {
                Ok(mut peer_data) => {
                    // Unroute routers touched by earlier attempts but
                    // absent from the final path.
                    let used: HashSet<&String> = path.nodes.iter().collect();
                    let abandoned: Vec<String> = cleanups
                        .iter()
                        .filter(|r| !used.contains(*r))
                        .cloned()
                        .collect();
                    self.unroute_routers(abandoned.iter(), &circuit_id).await;

                    strip_address_headers(&mut path, &params.peer_data, &mut peer_data);
                    for (key, value) in strategy_data {
                        peer_data.insert(key, value);
                    }

                    let now = Utc::now();
                    let circuit = Arc::new(Circuit {
                        id: circuit_id.clone(),
                        client_token: params.client_token.clone(),
                        service_id: service.id.clone(),
                        instance_id: instance_id.clone(),
                        created_at: now,
                        tags: params.tags.clone(),
                        terminator: Mutex::new(terminator.clone()),
                        path: Mutex::new(path),
                        peer_data: Mutex::new(peer_data),
                        updated_at: Mutex::new(now),
                        rerouting: AtomicBool::new(false),
                    });
                    self.circuits.insert(circuit_id.clone(), circuit.clone());

                    strategy.notify_event(&StrategyEvent::CircuitCreated {
                        terminator_id: terminator.id.clone(),
                        client_token: params.client_token.clone(),
                    });
                    self.emit_circuit(
                        CircuitEventType::Created,
                        &circuit,
                        Some(started.elapsed().as_millis() as u64),
                        None,
                    );
                    tracing::debug!(circuit_id = %circuit.id, "created circuit");
                    return Ok(circuit);
                }
                Err(RouteFailure { fatal, reason }) => {
                    strategy.notify_event(&StrategyEvent::DialFailed {
                        terminator_id: terminator.id.clone(),
                    });
                    attempt += 1;
                    let out_of_budget = started.elapsed() >= params.deadline;
                    if fatal || attempt >= self.config.create_circuit_retries || out_of_budget {
                        tracing::warn!(
                            circuit_id = %circuit_id,
                            attempts = attempt,
                            reason = %reason,
                            "circuit creation failed, sending cleanup unroutes"
                        );
                        self.unroute_routers(cleanups.iter(), &circuit_id).await;
                        let err = Error::circuit(
                            CircuitFailureCause::PathMissingLink,
                            format!(
                                "exceeded route budget after {attempt} attempt(s) for circuit {circuit_id}: {reason}"
                            ),
                        );
                        self.circuit_failed(&circuit_id, &params, &service_id, &err);
                        return Err(err);
                    }
                    // Loop: re-select, topology may have changed.
                }
            }
        }
    }

    fn lookup_service(&self, service_id: &str) -> Result<Service> {
        self.db
            .view(|tx| {
                self.stores
                    .services
                    .get(tx, service_id)
                    .ok_or_else(|| {
                        Error::circuit(
                            CircuitFailureCause::InvalidService,
                            format!("no service with id {service_id}"),
                        )
                    })
            })
    }

    /// Score every usable terminator and let the service's strategy pick.
    #[allow(clippy::type_complexity)]
    fn select_path(
        &self,
        params: &CreateCircuitParams,
        service: &Service,
        instance_id: &str,
    ) -> Result<(
        Arc<dyn TerminatorStrategy>,
        Terminator,
        Vec<String>,
        StrategyPeerData,
    )> {
        let terminators = self
            .db
            .view(|tx| Ok(self.stores.terminators.for_service(tx, &service.id)))?;
        if terminators.is_empty() {
            return Err(Error::circuit(
                CircuitFailureCause::NoTerminators,
                format!("service {} has no terminators", service.id),
            ));
        }

        let mut paths: HashMap<String, (Vec<String>, u64)> = HashMap::new();
        let mut weighted: Vec<CostedTerminator> = Vec::new();
        let mut offline_routers = false;
        let mut path_errors = false;

        for terminator in terminators
            .into_iter()
            .filter(|t| t.instance_id == instance_id)
        {
            let path_and_cost = match paths.get(&terminator.router_id) {
                Some(existing) => existing.clone(),
                None => {
                    if self.registry.get_connected(&terminator.router_id).is_none() {
                        tracing::debug!(
                            terminator_id = %terminator.id,
                            router_id = %terminator.router_id,
                            "terminator router offline"
                        );
                        offline_routers = true;
                        continue;
                    }
                    match self.graph.shortest_path(
                        &self.registry,
                        &params.source_router_id,
                        &terminator.router_id,
                    ) {
                        Ok((nodes, cost)) => {
                            let ids: Vec<String> = nodes.iter().map(|n| n.id()).collect();
                            paths.insert(terminator.router_id.clone(), (ids.clone(), cost));
                            (ids, cost)
                        }
                        Err(err) => {
                            tracing::debug!(
                                terminator_id = %terminator.id,
                                error = %err,
                                "error calculating path for terminator"
                            );
                            path_errors = true;
                            continue;
                        }
                    }
                }
            };

            let unbiased = terminator.cost as u64 + path_and_cost.1;
            let biased = terminator
                .precedence
                .biased_cost(unbiased.min(u32::MAX as u64) as u32);
            weighted.push(CostedTerminator {
                terminator,
                route_cost: biased,
            });
        }

        if weighted.is_empty() {
            return Err(if path_errors {
                Error::circuit(
                    CircuitFailureCause::NoPath,
                    format!(
                        "no route from {} to any terminator of service {}",
                        params.source_router_id, service.id
                    ),
                )
            } else if offline_routers {
                Error::circuit(
                    CircuitFailureCause::NoOnlineTerminators,
                    format!("service {} has no online terminators", service.id),
                )
            } else {
                Error::circuit(
                    CircuitFailureCause::NoTerminators,
                    format!(
                        "service {} has no terminators for instance {instance_id:?}",
                        service.id
                    ),
                )
            });
        }

        // Deterministic order: ascending cost, ties by terminator id.
        weighted.sort_by(|a, b| {
            a.route_cost
                .cmp(&b.route_cost)
                .then_with(|| a.terminator.id.cmp(&b.terminator.id))
        });

        let strategy = self.strategies.get(&service.terminator_strategy)?;
        let (chosen, strategy_data) =
            strategy.select(&params.client_token, &weighted).map_err(|err| {
                match err.circuit_cause() {
                    Some(_) => err,
                    None => Error::circuit(
                        CircuitFailureCause::StrategyError,
                        format!(
                            "strategy {} failed selecting terminator for service {}: {err}",
                            strategy.name(),
                            service.id
                        ),
                    ),
                }
            })?;

        let path_nodes = paths
            .get(&chosen.terminator.router_id)
            .map(|(nodes, _)| nodes.clone())
            .ok_or_else(|| {
                Error::circuit(
                    CircuitFailureCause::StrategyError,
                    format!(
                        "strategy {} selected terminator {} with no computed path",
                        strategy.name(),
                        chosen.terminator.id
                    ),
                )
            })?;

        Ok((strategy, chosen.terminator, path_nodes, strategy_data))
    }

    /// Assign hop tokens and pick the concrete link for each hop.
    fn build_path(&self, nodes: &[String]) -> Result<Path> {
        let mut path = Path {
            nodes: nodes.to_vec(),
            ingress_token: self.sequence.next_hash(),
            egress_token: self.sequence.next_hash(),
            ..Default::default()
        };
        self.set_links(&mut path)?;
        Ok(path)
    }

    fn set_links(&self, path: &mut Path) -> Result<()> {
        path.links.clear();
        for pair in path.nodes.windows(2) {
            let link = self
                .graph
                .least_expensive_link(&self.registry, &pair[0], &pair[1])
                .ok_or_else(|| {
                    Error::circuit(
                        CircuitFailureCause::PathMissingLink,
                        format!("no link from {} to {}", pair[0], pair[1]),
                    )
                })?;
            path.links.push(link.id.clone());
        }
        Ok(())
    }

    fn route_frames(
        &self,
        circuit_id: &str,
        attempt: u32,
        path: &Path,
        terminator: &Terminator,
        client_peer_data: &HashMap<i32, Vec<u8>>,
        timeout: Duration,
    ) -> Result<Vec<(String, Frame)>> {
        let mut frames = Vec::with_capacity(path.nodes.len());
        let last = path.nodes.len() - 1;
        for (i, router_id) in path.nodes.iter().enumerate() {
            let route = Route {
                circuit_id: circuit_id.to_string(),
                attempt,
                ingress_token: path.ingress_token.clone(),
                egress_token: path.egress_token.clone(),
                next_hop_link: (i < last).then(|| path.links[i].clone()),
                egress: (i == last).then(|| Egress {
                    terminator_id: terminator.id.clone(),
                    binding: terminator.binding.clone(),
                    address: terminator.address.clone(),
                    peer_data: client_peer_data
                        .iter()
                        .map(|(k, v)| (*k, v.clone()))
                        .collect(),
                }),
                timeout_ms: timeout.as_millis() as u64,
                tags: HashMap::new(),
            };
            frames.push((router_id.clone(), Frame::typed(ContentType::Route, &route)?));
        }
        Ok(frames)
    }

    /// Push the route programs for one attempt and collect replies.
    /// Success returns the egress router's peer data.
    async fn route_path(
        &self,
        circuit_id: &str,
        attempt: u32,
        path: &Path,
        terminator: &Terminator,
        params: &CreateCircuitParams,
        cleanups: &mut HashSet<String>,
    ) -> std::result::Result<HashMap<i32, Vec<u8>>, RouteFailure> {
        let timeout = self.config.route_timeout.min(params.deadline);
        let frames = self
            .route_frames(circuit_id, attempt, path, terminator, &params.peer_data, timeout)
            .map_err(|err| RouteFailure {
                fatal: true,
                reason: err.to_string(),
            })?;

        let sends = frames.into_iter().map(|(router_id, frame)| {
            let registry = self.registry.clone();
            async move {
                let outcome = match registry.get_connected(&router_id).and_then(|r| r.channel()) {
                    Some(channel) => match channel.send_for_reply(frame, timeout).await {
                        Ok(reply) if reply.is_success() => RouteOutcome::Success(
                            reply
                                .peer_data()
                                .into_iter()
                                .collect(),
                        ),
                        Ok(reply) => {
                            let reason = reply
                                .error_message()
                                .unwrap_or_else(|| "route error, no message from router".into());
                            if reply.is_fatal() {
                                RouteOutcome::Fatal(reason)
                            } else {
                                RouteOutcome::Retryable(reason)
                            }
                        }
                        Err(err) => RouteOutcome::Retryable(err.to_string()),
                    },
                    None => RouteOutcome::Retryable(format!("router {router_id} not connected")),
                };
                (router_id, outcome)
            }
        });

        let results = futures_util::future::join_all(sends).await;

        let egress_router = path.egress_router().unwrap_or_default().to_string();
        let mut egress_peer_data = HashMap::new();
        let mut failure: Option<RouteFailure> = None;

        for (router_id, outcome) in results {
            match outcome {
                RouteOutcome::Success(peer_data) => {
                    cleanups.insert(router_id.clone());
                    if router_id == egress_router {
                        egress_peer_data = peer_data;
                    }
                }
                RouteOutcome::Retryable(reason) => {
                    tracing::warn!(
                        circuit_id = %circuit_id,
                        router_id = %router_id,
                        reason = %reason,
                        "retryable route failure"
                    );
                    if failure.is_none() {
                        failure = Some(RouteFailure {
                            fatal: false,
                            reason,
                        });
                    }
                }
                RouteOutcome::Fatal(reason) => {
                    tracing::warn!(
                        circuit_id = %circuit_id,
                        router_id = %router_id,
                        reason = %reason,
                        "fatal route failure"
                    );
                    failure = Some(RouteFailure {
                        fatal: true,
                        reason,
                    });
                }
            }
        }

        match failure {
            Some(failure) => Err(failure),
            None => Ok(egress_peer_data),
        }
    }

    async fn unroute_routers(
        &self,
        router_ids: impl Iterator<Item = &String>,
        circuit_id: &str,
    ) {
        for router_id in router_ids {
            match self.registry.get_connected(router_id).and_then(|r| r.channel()) {
                Some(channel) => {
                    let unroute = Unroute {
                        circuit_id: circuit_id.to_string(),
                        now: true,
                    };
                    match Frame::typed(ContentType::Unroute, &unroute) {
                        Ok(frame) => {
                            if let Err(err) = channel.send(frame).await {
                                tracing::warn!(
                                    circuit_id = %circuit_id,
                                    router_id = %router_id,
                                    error = %err,
                                    "error sending cleanup unroute"
                                );
                            }
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "could not encode unroute");
                        }
                    }
                }
                None => tracing::warn!(
                    circuit_id = %circuit_id,
                    router_id = %router_id,
                    "router not connected for circuit cleanup"
                ),
            }
        }
    }

    // ── teardown ────────────────────────────────────────────────────

    /// Remove a circuit: unroute every path node, notify the strategy,
    /// emit `CircuitDeleted`.
    pub async fn remove_circuit(&self, circuit_id: &str, _now: bool) -> Result<()> {
        let circuit = self
            .circuits
            .remove(circuit_id)
            .map(|(_, c)| c)
            .ok_or_else(|| Error::not_found("circuit", circuit_id))?;

        let path = circuit.path();
        self.unroute_routers(path.nodes.iter(), circuit_id).await;

        if let Ok(strategy) = self.strategy_for(&circuit.service_id) {
            strategy.notify_event(&StrategyEvent::CircuitRemoved {
                terminator_id: circuit.terminator().id,
            });
        }
        self.emit_circuit(CircuitEventType::Deleted, &circuit, None, None);
        tracing::debug!(circuit_id = %circuit_id, "removed circuit");
        Ok(())
    }

    fn strategy_for(&self, service_id: &str) -> Result<Arc<dyn TerminatorStrategy>> {
        let service = self.lookup_service(service_id)?;
        self.strategies.get(&service.terminator_strategy)
    }

    // ── reroute ─────────────────────────────────────────────────────

    /// A link failed: reroute every circuit using it, removing circuits
    /// that cannot be rerouted.
    pub async fn handle_link_failed(&self, link_id: &str) {
        for circuit in self.all() {
            if !circuit.path().uses_link(link_id) {
                continue;
            }
            tracing::info!(circuit_id = %circuit.id, link_id = %link_id, "circuit uses failed link");
            if let Err(err) = self.reroute_circuit(&circuit).await {
                tracing::warn!(
                    circuit_id = %circuit.id,
                    error = %err,
                    "error rerouting circuit, removing"
                );
                if let Err(err) = self.remove_circuit(&circuit.id, true).await {
                    tracing::error!(circuit_id = %circuit.id, error = %err, "error removing circuit");
                }
            }
        }
    }

    /// A router disconnected: reroute circuits transiting it; circuits
    /// it initiates or terminates cannot be re-established.
    pub async fn handle_router_offline(&self, router_id: &str) {
        for circuit in self.all() {
            let path = circuit.path();
            if !path.uses_router(router_id) {
                continue;
            }
            let endpoint = path.ingress_router() == Some(router_id)
                || path.egress_router() == Some(router_id);
            if endpoint {
                if let Err(err) = self.remove_circuit(&circuit.id, true).await {
                    tracing::error!(circuit_id = %circuit.id, error = %err, "error removing circuit");
                }
            } else if let Err(err) = self.reroute_circuit(&circuit).await {
                tracing::warn!(circuit_id = %circuit.id, error = %err, "reroute failed, removing");
                let _ = self.remove_circuit(&circuit.id, true).await;
            }
        }
    }

    /// Recompute a circuit's path under the single-writer rerouting
    /// flag. The current terminator is kept when it is still reachable;
    /// otherwise selection is re-run and the terminator may switch.
    pub async fn reroute_circuit(&self, circuit: &Arc<Circuit>) -> Result<()> {
        if circuit
            .rerouting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::info!(circuit_id = %circuit.id, "not rerouting circuit, already in progress");
            return Ok(());
        }
        let result = self.reroute_locked(circuit).await;
        circuit.rerouting.store(false, Ordering::Release);
        result
    }

    async fn reroute_locked(&self, circuit: &Arc<Circuit>) -> Result<()> {
        tracing::warn!(circuit_id = %circuit.id, "rerouting circuit");
        let old_path = circuit.path();
        let source = old_path
            .ingress_router()
            .ok_or_else(|| Error::Other(format!("circuit {} has an empty path", circuit.id)))?
            .to_string();

        let mut terminator = circuit.terminator();

        // Keep the terminator when a path to its router still exists.
        let nodes = match self
            .graph
            .shortest_path(&self.registry, &source, &terminator.router_id)
        {
            Ok((nodes, _)) => nodes.iter().map(|n| n.id()).collect::<Vec<_>>(),
            Err(_) => {
                // Re-select; the terminator may switch.
                let service = self.lookup_service(&circuit.service_id)?;
                let params = CreateCircuitParams {
                    client_token: circuit.client_token.clone(),
                    peer_data: HashMap::new(),
                    service: circuit.service_id.clone(),
                    source_router_id: source.clone(),
                    deadline: self.config.route_timeout,
                    tags: circuit.tags.clone(),
                };
                let (_, new_terminator, nodes, _) =
                    self.select_path(&params, &service, &circuit.instance_id)?;
                terminator = new_terminator;
                nodes
            }
        };

        let mut new_path = Path {
            nodes,
            links: Vec::new(),
            ingress_token: old_path.ingress_token.clone(),
            egress_token: old_path.egress_token.clone(),
            initiator_local_addr: old_path.initiator_local_addr.clone(),
            initiator_remote_addr: old_path.initiator_remote_addr.clone(),
            terminator_local_addr: old_path.terminator_local_addr.clone(),
            terminator_remote_addr: old_path.terminator_remote_addr.clone(),
        };
        self.set_links(&mut new_path)?;

        self.push_route_programs(circuit, &new_path, &terminator).await;

        *circuit.path.lock() = new_path;
        *circuit.terminator.lock() = terminator;
        *circuit.updated_at.lock() = Utc::now();
        self.emit_circuit(CircuitEventType::Updated, circuit, None, None);
        tracing::info!(circuit_id = %circuit.id, "rerouted circuit");
        Ok(())
    }

    async fn push_route_programs(&self, circuit: &Arc<Circuit>, path: &Path, terminator: &Terminator) {
        let frames = match self.route_frames(
            &circuit.id,
            SMART_REROUTE_ATTEMPT,
            path,
            terminator,
            &circuit.peer_data(),
            self.config.route_timeout,
        ) {
            Ok(frames) => frames,
            Err(err) => {
                tracing::error!(circuit_id = %circuit.id, error = %err, "could not build route frames");
                return;
            }
        };
        for (router_id, frame) in frames {
            match self.registry.get_connected(&router_id).and_then(|r| r.channel()) {
                Some(channel) => {
                    if let Err(err) = channel
                        .send_for_reply(frame, self.config.route_timeout)
                        .await
                    {
                        tracing::warn!(
                            circuit_id = %circuit.id,
                            router_id = %router_id,
                            error = %err,
                            "error sending route update to router"
                        );
                    }
                }
                None => tracing::warn!(
                    circuit_id = %circuit.id,
                    router_id = %router_id,
                    "router not connected for route update"
                ),
            }
        }
    }

    /// One smart-reroute pass: offer each circuit a cheaper path when
    /// its rerouting flag is free.
    pub async fn smart_reroute_pass(&self) -> usize {
        let mut rerouted = 0;
        for circuit in self.all() {
            let path = circuit.path();
            let (Some(src), Some(dst)) = (path.ingress_router(), path.egress_router()) else {
                continue;
            };
            let Ok((nodes, _)) = self.graph.shortest_path(&self.registry, src, dst) else {
                continue;
            };
            let best: Vec<String> = nodes.iter().map(|n| n.id()).collect();
            if best == path.nodes {
                continue;
            }
            let current_cost = self.path_cost(&path.nodes);
            let best_cost = self.path_cost(&best);
            if best_cost >= current_cost {
                continue;
            }
            tracing::info!(
                circuit_id = %circuit.id,
                current_cost,
                best_cost,
                "smart reroute found cheaper path"
            );
            if self.reroute_circuit(&circuit).await.is_ok() {
                rerouted += 1;
            }
        }
        rerouted
    }

    fn path_cost(&self, nodes: &[String]) -> u64 {
        let mut cost = 0u64;
        for pair in nodes.windows(2) {
            match self.graph.least_expensive_link(&self.registry, &pair[0], &pair[1]) {
                Some(link) => cost = cost.saturating_add(link.cost()),
                None => return u64::MAX,
            }
        }
        cost
    }

    // ── events ──────────────────────────────────────────────────────

    fn emit_circuit(
        &self,
        event_type: CircuitEventType,
        circuit: &Circuit,
        creation_millis: Option<u64>,
        failure_cause: Option<String>,
    ) {
        self.events.dispatch(Event::Circuit(CircuitEvent {
            event_type,
            circuit_id: circuit.id.clone(),
            client_token: circuit.client_token.clone(),
            service_id: circuit.service_id.clone(),
            terminator_id: Some(circuit.terminator().id),
            instance_id: (!circuit.instance_id.is_empty()).then(|| circuit.instance_id.clone()),
            path: circuit.path().nodes,
            creation_millis,
            failure_cause,
        }));
    }

    fn circuit_failed(
        &self,
        circuit_id: &str,
        params: &CreateCircuitParams,
        service_id: &str,
        err: &Error,
    ) {
        self.events.dispatch(Event::Circuit(CircuitEvent {
            event_type: CircuitEventType::Failed,
            circuit_id: circuit_id.to_string(),
            client_token: params.client_token.clone(),
            service_id: service_id.to_string(),
            terminator_id: None,
            instance_id: None,
            path: Vec::new(),
            creation_millis: None,
            failure_cause: err.circuit_cause().map(|c| c.as_str().to_string()),
        }));
    }
}

struct RouteFailure {
    fatal: bool,
    reason: String,
}

/// Move the initiator/terminator address headers off the wire peer data
/// and onto the path record.
fn strip_address_headers(
    path: &mut Path,
    client_peer_data: &HashMap<i32, Vec<u8>>,
    terminator_peer_data: &mut HashMap<i32, Vec<u8>>,
) {
    let take = |map: &HashMap<i32, Vec<u8>>, key: i32| -> String {
        map.get(&key)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default()
    };
    path.initiator_local_addr = take(client_peer_data, header::INITIATOR_LOCAL_ADDR);
    path.initiator_remote_addr = take(client_peer_data, header::INITIATOR_REMOTE_ADDR);
    path.terminator_local_addr = take(terminator_peer_data, header::TERMINATOR_LOCAL_ADDR);
    path.terminator_remote_addr = take(terminator_peer_data, header::TERMINATOR_REMOTE_ADDR);
    terminator_peer_data.remove(&header::INITIATOR_LOCAL_ADDR);
    terminator_peer_data.remove(&header::INITIATOR_REMOTE_ADDR);
    terminator_peer_data.remove(&header::TERMINATOR_LOCAL_ADDR);
    terminator_peer_data.remove(&header::TERMINATOR_REMOTE_ADDR);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::StubChannel;
    use crate::channel::ControlChannel;
    use crate::fabric::{Link, LinkState};
    use trellis_domain::model::{Precedence, Router};

    struct Fixture {
        registry: Arc<RouterRegistry>,
        graph: Arc<LinkGraph>,
        db: Db,
        stores: Arc<Stores>,
        engine: CircuitEngine,
        channels: HashMap<String, Arc<StubChannel>>,
    }

    impl Fixture {
        /// Mesh of connected routers with stub channels.
        fn new(routers: &[&str], links: &[(&str, &str, &str, u16)]) -> Self {
            let registry = Arc::new(RouterRegistry::new());
            let mut channels = HashMap::new();
            for id in routers {
                registry.put(Router {
                    id: id.to_string(),
                    name: id.to_string(),
                    ..Default::default()
                });
                let channel = Arc::new(StubChannel::new(id));
                channels.insert(id.to_string(), channel.clone());
                registry
                    .mark_connected(id, channel, "1.0.0".into(), vec![], None)
                    .unwrap();
            }
            let graph = Arc::new(LinkGraph::new(0));
            for (id, src, dst, cost) in links {
                let link = Arc::new(
                    Link::new(*id, *src, *dst, "tls", "addr", 0, 0).with_static_cost(*cost),
                );
                link.set_state(LinkState::Connected);
                graph.add(link, &registry);
            }

            let db = Db::in_memory();
            let stores = Arc::new(Stores::new());
            let engine = CircuitEngine::new(
                "ctrl1",
                registry.clone(),
                graph.clone(),
                db.clone(),
                stores.clone(),
                Arc::new(StrategyRegistry::new()),
                Arc::new(EventDispatcher::new()),
                EngineConfig::default(),
            );
            Self {
                registry,
                graph,
                db,
                stores,
                engine,
                channels,
            }
        }

        fn add_service(&self, id: &str) {
            self.db
                .update(|tx| {
                    self.stores.services.create(
                        tx,
                        &Service {
                            id: id.into(),
                            name: id.into(),
                            ..Default::default()
                        },
                    )
                })
                .unwrap();
        }

        fn add_terminator(&self, id: &str, service: &str, router: &str, cost: u16) {
            self.db
                .update(|tx| {
                    self.stores.terminators.create(
                        tx,
                        &Terminator {
                            id: id.into(),
                            service_id: service.into(),
                            router_id: router.into(),
                            binding: "transport".into(),
                            address: format!("tcp:{router}:7000"),
                            cost,
                            precedence: Precedence::Default,
                            ..Default::default()
                        },
                    )
                })
                .unwrap();
        }

        fn params(&self, service: &str, source: &str) -> CreateCircuitParams {
            CreateCircuitParams {
                client_token: "client-1".into(),
                peer_data: HashMap::new(),
                service: service.into(),
                source_router_id: source.into(),
                deadline: Duration::from_secs(5),
                tags: HashMap::new(),
            }
        }
    }

    // Reference topology: R1-R2-R3 cheap, R1-R2-R4 dearer.
    fn reference_fixture() -> Fixture {
        let fixture = Fixture::new(
            &["r1", "r2", "r3", "r4"],
            &[
                ("l12", "r1", "r2", 10),
                ("l23", "r2", "r3", 10),
                ("l24", "r2", "r4", 20),
            ],
        );
        fixture.add_service("svc1");
        fixture.add_terminator("t1", "svc1", "r3", 0);
        fixture.add_terminator("t2", "svc1", "r4", 100);
        fixture
    }

    #[tokio::test]
    async fn happy_path_selects_cheapest_terminator() {
        let fixture = reference_fixture();
        let circuit = fixture
            .engine
            .create_circuit(fixture.params("svc1", "r1"))
            .await
            .unwrap();

        assert_eq!(circuit.terminator().id, "t1");
        assert_eq!(circuit.path().nodes, vec!["r1", "r2", "r3"]);
        assert_eq!(circuit.path().links, vec!["l12", "l23"]);
        // One route message per path router.
        for router in ["r1", "r2", "r3"] {
            assert_eq!(
                fixture.channels[router].sent_count_of(ContentType::Route),
                1
            );
        }
        assert_eq!(fixture.channels["r4"].sent_count_of(ContentType::Route), 0);
        assert_eq!(fixture.engine.len(), 1);
    }

    #[tokio::test]
    async fn unknown_service_is_invalid_service() {
        let fixture = Fixture::new(&["r1"], &[]);
        let err = fixture
            .engine
            .create_circuit(fixture.params("ghost", "r1"))
            .await
            .unwrap_err();
        assert_eq!(
            err.circuit_cause(),
            Some(CircuitFailureCause::InvalidService)
        );
    }

    #[tokio::test]
    async fn no_terminators_vs_no_online_terminators() {
        let fixture = Fixture::new(&["r1", "r2"], &[("l12", "r1", "r2", 1)]);
        fixture.add_service("svc1");
        let err = fixture
            .engine
            .create_circuit(fixture.params("svc1", "r1"))
            .await
            .unwrap_err();
        assert_eq!(
            err.circuit_cause(),
            Some(CircuitFailureCause::NoTerminators)
        );

        fixture.add_terminator("t1", "svc1", "r2", 0);
        fixture.registry.mark_disconnected("r2");
        let err = fixture
            .engine
            .create_circuit(fixture.params("svc1", "r1"))
            .await
            .unwrap_err();
        assert_eq!(
            err.circuit_cause(),
            Some(CircuitFailureCause::NoOnlineTerminators)
        );
    }

    #[tokio::test]
    async fn unreachable_router_is_no_path() {
        // r2 online but no link to it.
        let fixture = Fixture::new(&["r1", "r2"], &[]);
        fixture.add_service("svc1");
        fixture.add_terminator("t1", "svc1", "r2", 0);
        let err = fixture
            .engine
            .create_circuit(fixture.params("svc1", "r1"))
            .await
            .unwrap_err();
        assert_eq!(err.circuit_cause(), Some(CircuitFailureCause::NoPath));
    }

    #[tokio::test]
    async fn retryable_failure_retries_and_succeeds() {
        let fixture = reference_fixture();
        // r3 fails the first attempt, succeeds after.
        let failures = Arc::new(std::sync::atomic::AtomicUsize::new(1));
        let channel = {
            let failures = failures.clone();
            Arc::new(StubChannel::with_responder("r3", move |_frame| {
                if failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    Ok(Frame::new(ContentType::RouteResult, Vec::new())
                        .with_error("temporarily out of capacity"))
                } else {
                    Ok(Frame::new(ContentType::RouteResult, Vec::new()).with_success())
                }
            }))
        };
        fixture
            .registry
            .mark_connected("r3", channel.clone(), "1.0.0".into(), vec![], None)
            .unwrap();

        let circuit = fixture
            .engine
            .create_circuit(fixture.params("svc1", "r1"))
            .await
            .unwrap();
        assert_eq!(circuit.path().nodes, vec!["r1", "r2", "r3"]);
        // One route per attempt, no unroutes to path routers.
        assert_eq!(channel.sent_count_of(ContentType::Route), 2);
        assert_eq!(fixture.channels["r2"].sent_count_of(ContentType::Route), 2);
        assert_eq!(
            fixture.channels["r2"].sent_count_of(ContentType::Unroute),
            0
        );
        assert_eq!(channel.sent_count_of(ContentType::Unroute), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_unroute_everything() {
        let fixture = reference_fixture();
        let channel = Arc::new(StubChannel::with_responder("r3", |_frame| {
            Ok(Frame::new(ContentType::RouteResult, Vec::new()).with_error("nope"))
        }));
        // Remove the alternative so selection keeps picking t1 on r3.
        fixture
            .db
            .update(|tx| fixture.stores.terminators.delete(tx, "t2").map(|_| ()))
            .unwrap();
        fixture
            .registry
            .mark_connected("r3", channel.clone(), "1.0.0".into(), vec![], None)
            .unwrap();

        let err = fixture
            .engine
            .create_circuit(fixture.params("svc1", "r1"))
            .await
            .unwrap_err();
        assert!(err.circuit_cause().is_some());
        assert!(fixture.engine.is_empty());
        // Successful routers from failed attempts got cleanup unroutes.
        assert!(fixture.channels["r1"].sent_count_of(ContentType::Unroute) >= 1);
        assert!(fixture.channels["r2"].sent_count_of(ContentType::Unroute) >= 1);
    }

    #[tokio::test]
    async fn fatal_failure_does_not_retry() {
        let fixture = reference_fixture();
        let channel = Arc::new(StubChannel::with_responder("r3", |_frame| {
            Ok(Frame::new(ContentType::RouteResult, Vec::new())
                .with_error("bad terminator binding")
                .with_fatal())
        }));
        fixture
            .registry
            .mark_connected("r3", channel.clone(), "1.0.0".into(), vec![], None)
            .unwrap();

        let err = fixture
            .engine
            .create_circuit(fixture.params("svc1", "r1"))
            .await
            .unwrap_err();
        assert!(err.circuit_cause().is_some());
        assert_eq!(channel.sent_count_of(ContentType::Route), 1);
    }

    #[tokio::test]
    async fn teardown_unroutes_path_nodes() {
        let fixture = reference_fixture();
        let circuit = fixture
            .engine
            .create_circuit(fixture.params("svc1", "r1"))
            .await
            .unwrap();

        fixture.engine.remove_circuit(&circuit.id, true).await.unwrap();
        assert!(fixture.engine.is_empty());
        for router in ["r1", "r2", "r3"] {
            assert_eq!(
                fixture.channels[router].sent_count_of(ContentType::Unroute),
                1
            );
        }
    }

    #[tokio::test]
    async fn link_failure_reroutes_to_alternate_terminator() {
        let fixture = reference_fixture();
        let circuit = fixture
            .engine
            .create_circuit(fixture.params("svc1", "r1"))
            .await
            .unwrap();
        assert_eq!(circuit.terminator().id, "t1");

        // Fail R2-R3; the only remaining path serves t2 on r4.
        fixture.graph.get("l23").unwrap().set_state(LinkState::Failed);
        fixture.engine.handle_link_failed("l23").await;

        let circuit = fixture.engine.get(&circuit.id).unwrap();
        assert_eq!(circuit.path().nodes, vec!["r1", "r2", "r4"]);
        assert_eq!(circuit.terminator().id, "t2");
        assert!(fixture.channels["r4"].sent_count_of(ContentType::Route) >= 1);
    }

    #[tokio::test]
    async fn link_failure_with_no_alternative_removes_circuit() {
        let fixture = Fixture::new(
            &["r1", "r2", "r3"],
            &[("l12", "r1", "r2", 10), ("l23", "r2", "r3", 10)],
        );
        fixture.add_service("svc1");
        fixture.add_terminator("t1", "svc1", "r3", 0);

        let circuit = fixture
            .engine
            .create_circuit(fixture.params("svc1", "r1"))
            .await
            .unwrap();

        fixture.graph.get("l23").unwrap().set_state(LinkState::Failed);
        fixture.engine.handle_link_failed("l23").await;
        assert!(fixture.engine.get(&circuit.id).is_none());
    }

    #[tokio::test]
    async fn endpoint_router_loss_removes_circuit() {
        let fixture = reference_fixture();
        let circuit = fixture
            .engine
            .create_circuit(fixture.params("svc1", "r1"))
            .await
            .unwrap();

        fixture.registry.mark_disconnected("r1");
        fixture.engine.handle_router_offline("r1").await;
        assert!(fixture.engine.get(&circuit.id).is_none());
    }

    #[tokio::test]
    async fn smart_reroute_takes_cheaper_path() {
        let fixture = Fixture::new(
            &["r1", "r2", "r3"],
            &[
                ("l12", "r1", "r2", 10),
                ("l23", "r2", "r3", 10),
                ("l13", "r1", "r3", 100),
            ],
        );
        fixture.add_service("svc1");
        fixture.add_terminator("t1", "svc1", "r3", 0);

        // Make the direct link momentarily attractive at creation time.
        fixture.graph.get("l12").unwrap().set_src_latency(10_000);
        let circuit = fixture
            .engine
            .create_circuit(fixture.params("svc1", "r1"))
            .await
            .unwrap();
        assert_eq!(circuit.path().nodes, vec!["r1", "r3"]);

        // Latency recovers; the two-hop path is cheaper again.
        fixture.graph.get("l12").unwrap().set_src_latency(0);
        let rerouted = fixture.engine.smart_reroute_pass().await;
        assert_eq!(rerouted, 1);
        assert_eq!(
            fixture.engine.get(&circuit.id).unwrap().path().nodes,
            vec!["r1", "r2", "r3"]
        );
    }

    #[tokio::test]
    async fn instance_id_filters_terminators() {
        let fixture = reference_fixture();
        fixture
            .db
            .update(|tx| {
                fixture.stores.terminators.create(
                    tx,
                    &Terminator {
                        id: "t-inst".into(),
                        service_id: "svc1".into(),
                        router_id: "r4".into(),
                        binding: "transport".into(),
                        address: "tcp:r4:7001".into(),
                        instance_id: "blue".into(),
                        cost: 500,
                        ..Default::default()
                    },
                )
            })
            .unwrap();

        let circuit = fixture
            .engine
            .create_circuit(fixture.params("blue@svc1", "r1"))
            .await
            .unwrap();
        assert_eq!(circuit.terminator().id, "t-inst");
        assert_eq!(circuit.instance_id, "blue");
    }

    #[tokio::test]
    async fn circuit_ids_are_never_reused() {
        let fixture = reference_fixture();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let circuit = fixture
                .engine
                .create_circuit(fixture.params("svc1", "r1"))
                .await
                .unwrap();
            assert!(seen.insert(circuit.id.clone()));
            fixture.engine.remove_circuit(&circuit.id, true).await.unwrap();
        }
    }
}
