//! Shared controller state and the inbound frame handler.

use std::sync::Arc;

use async_trait::async_trait;

use trellis_domain::config::Config;
use trellis_protocol::msgs::{Fault, FaultSubject, LinkConnected, RouterPresence};
use trellis_protocol::{ContentType, Frame};

use crate::channel::{InboundSink, SendPool};
use crate::circuit::{CircuitEngine, StrategyRegistry};
use crate::dispatch::{AdaptiveLimiter, CommandDispatcher, ControllerModel};
use crate::events::{Event, EventDispatcher, LinkEvent, LinkEventType, RouterEvent, RouterEventType};
use crate::fabric::{LinkGraph, LinkState, RouterRegistry};
use crate::store::{Db, Stores};
use crate::supervisor::SupervisorNudge;
use trellis_rdm::Rdm;

/// Shared application state threaded through the controller.
///
/// Fields are grouped by concern:
/// - **Model** — storage, schema, replica stream
/// - **Fabric** — routers, links, circuits
/// - **Dispatch** — command path and rate limiting
/// - **Messaging** — outbound pool and event fan-out
#[derive(Clone)]
pub struct AppState {
    // ── Model ─────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub db: Db,
    pub stores: Arc<Stores>,
    pub rdm: Arc<Rdm>,
    pub model: Arc<ControllerModel>,

    // ── Fabric ────────────────────────────────────────────────────────
    pub registry: Arc<RouterRegistry>,
    pub graph: Arc<LinkGraph>,
    pub strategies: Arc<StrategyRegistry>,
    pub engine: Arc<CircuitEngine>,

    // ── Dispatch ──────────────────────────────────────────────────────
    pub dispatcher: Arc<dyn CommandDispatcher>,
    /// Gates connection handshakes with the same adaptive window the
    /// command path uses.
    pub handshake_limiter: Arc<AdaptiveLimiter>,

    // ── Messaging ─────────────────────────────────────────────────────
    pub pool: Arc<SendPool>,
    pub events: Arc<EventDispatcher>,
}

/// Handles frames arriving from router channels and channel lifecycle.
pub struct ControlSink {
    pub registry: Arc<RouterRegistry>,
    pub graph: Arc<LinkGraph>,
    pub engine: Arc<CircuitEngine>,
    pub events: Arc<EventDispatcher>,
    pub nudge: SupervisorNudge,
}

impl ControlSink {
    fn emit_link(&self, event_type: LinkEventType, link_id: &str, src: &str, dst: &str) {
        self.events.dispatch(Event::Link(LinkEvent {
            event_type,
            link_id: link_id.to_string(),
            src_router_id: src.to_string(),
            dst_router_id: dst.to_string(),
        }));
    }

    async fn handle_link_connected(&self, router_id: &str, msg: LinkConnected) {
        let Some(link) = self.graph.get(&msg.link_id) else {
            tracing::warn!(router_id = %router_id, link_id = %msg.link_id, "no such link");
            return;
        };
        if link.state() != LinkState::Pending {
            tracing::warn!(
                link_id = %link.id,
                state = ?link.state(),
                "link not pending, cannot mark connected"
            );
            return;
        }
        link.set_state(LinkState::Connected);
        link.set_iteration(msg.iteration);
        link.touch();
        self.emit_link(LinkEventType::Connected, &link.id, &link.src, &link.dst);
    }

    async fn handle_fault(&self, router_id: &str, fault: Fault) {
        match fault.subject {
            FaultSubject::LinkFault => {
                if let Some(link) = self.graph.get(&fault.id) {
                    link.set_state(LinkState::Failed);
                    self.emit_link(LinkEventType::Faulted, &link.id, &link.src, &link.dst);
                    self.engine.handle_link_failed(&fault.id).await;
                    self.nudge.nudge();
                }
            }
            FaultSubject::CircuitFault => {
                if let Err(err) = self.engine.remove_circuit(&fault.id, true).await {
                    tracing::debug!(
                        router_id = %router_id,
                        circuit_id = %fault.id,
                        error = %err,
                        "circuit fault for unknown circuit"
                    );
                }
            }
            FaultSubject::ForwardingFault => {
                tracing::warn!(router_id = %router_id, "forwarding fault reported");
                self.nudge.nudge();
            }
        }
    }

    async fn handle_presence(&self, router_id: &str, presence: RouterPresence) {
        if self.registry.get_connected(router_id).is_none() {
            tracing::info!(router_id = %router_id, "ignoring presence from disconnected router");
            return;
        }
        for reported in presence.links {
            let dst_online = self.registry.get_connected(&reported.dst_router_id).is_some();
            if !dst_online {
                tracing::info!(
                    link_id = %reported.link_id,
                    dst_router_id = %reported.dst_router_id,
                    "router reported link with disconnected destination"
                );
            }
            let (link, created) = self.graph.router_reported_link(
                &reported.link_id,
                reported.iteration,
                &reported.protocol,
                &reported.dial_address,
                router_id,
                &reported.dst_router_id,
                &self.registry,
            );
            let event_type = if created {
                LinkEventType::FromRouterNew
            } else {
                LinkEventType::FromRouterKnown
            };
            self.emit_link(event_type, &link.id, &link.src, &link.dst);
        }
    }
}

#[async_trait]
impl InboundSink for ControlSink {
    async fn handle(&self, router_id: &str, frame: Frame) {
        match frame.content_type {
            ContentType::LinkConnected => match frame.decode_body() {
                Ok(msg) => self.handle_link_connected(router_id, msg).await,
                Err(err) => tracing::warn!(router_id = %router_id, error = %err, "bad link-connected body"),
            },
            ContentType::Fault => match frame.decode_body() {
                Ok(fault) => self.handle_fault(router_id, fault).await,
                Err(err) => tracing::warn!(router_id = %router_id, error = %err, "bad fault body"),
            },
            ContentType::RouterPresence => match frame.decode_body() {
                Ok(presence) => self.handle_presence(router_id, presence).await,
                Err(err) => tracing::warn!(router_id = %router_id, error = %err, "bad presence body"),
            },
            other => {
                tracing::debug!(
                    router_id = %router_id,
                    content_type = ?other,
                    "unexpected inbound frame"
                );
            }
        }
    }

    async fn channel_closed(&self, router_id: &str) {
        // 1: fail the router's links and reroute affected circuits.
        if let Some(router) = self.registry.get(router_id) {
            for link in router.links.all().iter() {
                let was_connected = link.state() == LinkState::Connected;
                if was_connected {
                    link.set_state(LinkState::Failed);
                    self.emit_link(LinkEventType::Faulted, &link.id, &link.src, &link.dst);
                    self.engine.handle_link_failed(&link.id).await;
                }
            }
        }
        // 2: drop the router and its endpoint circuits.
        self.registry.mark_disconnected(router_id);
        self.engine.handle_router_offline(router_id).await;
        self.events.dispatch(Event::Router(RouterEvent {
            event_type: RouterEventType::Disconnected,
            router_id: router_id.to_string(),
            version: None,
        }));
        self.nudge.nudge_after(std::time::Duration::from_millis(250));
    }
}
