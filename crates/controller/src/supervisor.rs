//! Supervisor loop: periodic fabric upkeep.
//!
//! Each cycle: reassemble idle pending links, prune stale failed links,
//! run one smart-reroute pass, and scan for dead links. A watchdog task
//! checks that the loop keeps ticking and dumps a backtrace after three
//! missed ticks (diagnostic only, never exits).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use trellis_domain::config::NetworkConfig;
use trellis_protocol::msgs::{Fault, FaultSubject};
use trellis_protocol::{ContentType, Frame};

use crate::circuit::CircuitEngine;
use crate::events::{Event, EventDispatcher, LinkEvent, LinkEventType};
use crate::fabric::{LinkGraph, RouterRegistry};

pub struct Supervisor {
    registry: Arc<RouterRegistry>,
    graph: Arc<LinkGraph>,
    engine: Arc<CircuitEngine>,
    events: Arc<EventDispatcher>,
    config: NetworkConfig,
    heartbeat_interval: Duration,
    ticks: Arc<AtomicU64>,
    nudge_tx: mpsc::Sender<()>,
    nudge_rx: Option<mpsc::Receiver<()>>,
}

/// Handle for poking the supervisor off-cycle (router connect or
/// disconnect schedules an assemble-and-clean).
#[derive(Clone)]
pub struct SupervisorNudge {
    tx: mpsc::Sender<()>,
}

impl SupervisorNudge {
    pub fn nudge(&self) {
        // Coalesced: a full queue means a pass is already scheduled.
        let _ = self.tx.try_send(());
    }

    /// The original source waits 250ms after presence changes so bursts
    /// of router churn coalesce into one pass.
    pub fn nudge_after(&self, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.try_send(());
        });
    }
}

impl Supervisor {
    pub fn new(
        registry: Arc<RouterRegistry>,
        graph: Arc<LinkGraph>,
        engine: Arc<CircuitEngine>,
        events: Arc<EventDispatcher>,
        config: NetworkConfig,
        heartbeat_interval: Duration,
    ) -> Self {
        let (nudge_tx, nudge_rx) = mpsc::channel(1);
        Self {
            registry,
            graph,
            engine,
            events,
            config,
            heartbeat_interval,
            ticks: Arc::new(AtomicU64::new(0)),
            nudge_tx,
            nudge_rx: Some(nudge_rx),
        }
    }

    pub fn nudge_handle(&self) -> SupervisorNudge {
        SupervisorNudge {
            tx: self.nudge_tx.clone(),
        }
    }

    /// Run until `shutdown` flips. Spawns the watchdog alongside.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("supervisor started");
        let cycle = self.config.cycle();
        self.spawn_watchdog(cycle, shutdown.clone());
        let mut nudge_rx = self.nudge_rx.take().expect("supervisor run started twice");

        let mut ticker = tokio::time::interval(cycle);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; consume the first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.assemble().await;
                    self.clean().await;
                    self.smart().await;
                    self.scan_for_dead_links().await;
                }
                Some(()) = nudge_rx.recv() => {
                    self.assemble().await;
                    self.clean().await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        tracing::info!("supervisor exited");
                        return;
                    }
                }
            }
            self.ticks.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn spawn_watchdog(&self, cycle: Duration, mut shutdown: watch::Receiver<bool>) {
        let ticks = self.ticks.clone();
        let interval = cycle * 2;
        tokio::spawn(async move {
            let mut last_seen = ticks.load(Ordering::Relaxed);
            let mut consecutive_fails = 0u32;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            return;
                        }
                        continue;
                    }
                }
                let current = ticks.load(Ordering::Relaxed);
                if current != last_seen {
                    last_seen = current;
                    consecutive_fails = 0;
                    continue;
                }
                consecutive_fails += 1;
                tracing::warn!(
                    watchdog_interval = ?interval,
                    consecutive_fails,
                    "supervisor loop did not finish within watchdog interval"
                );
                if consecutive_fails == 3 {
                    let backtrace = std::backtrace::Backtrace::force_capture();
                    tracing::error!(%backtrace, "supervisor stalled, dumping stack");
                }
            }
        });
    }

    /// Prompt redials for pending links whose connected side is healthy,
    /// by faulting them back to the owning router.
    async fn assemble(&self) {
        let pending = self.graph.links_to_reassemble(
            &self.registry,
            chrono::Duration::from_std(Duration::from_secs(self.config.pending_link_timeout_secs))
                .unwrap_or_else(|_| chrono::Duration::seconds(10)),
        );
        for link in pending {
            let Some(channel) = self
                .registry
                .get_connected(&link.src)
                .and_then(|r| r.channel())
            else {
                continue;
            };
            tracing::info!(link_id = %link.id, router_id = %link.src, "nudging pending link redial");
            let fault = Fault {
                subject: FaultSubject::LinkFault,
                id: link.id.clone(),
                iteration: link.iteration(),
            };
            match Frame::typed(ContentType::Fault, &fault) {
                Ok(frame) => {
                    if let Err(err) = channel.send(frame).await {
                        tracing::warn!(link_id = %link.id, error = %err, "could not send link fault");
                    }
                }
                Err(err) => tracing::error!(error = %err, "could not encode link fault"),
            }
        }
    }

    async fn clean(&self) {
        let grace = chrono::Duration::from_std(Duration::from_secs(
            self.config.failed_link_grace_secs,
        ))
        .unwrap_or_else(|_| chrono::Duration::seconds(30));
        for link in self.graph.clean(&self.registry, grace) {
            self.events.dispatch(Event::Link(LinkEvent {
                event_type: LinkEventType::Removed,
                link_id: link.id.clone(),
                src_router_id: link.src.clone(),
                dst_router_id: link.dst.clone(),
            }));
        }
    }

    async fn smart(&self) {
        let rerouted = self.engine.smart_reroute_pass().await;
        if rerouted > 0 {
            tracing::info!(rerouted, "smart reroute pass moved circuits");
        }
    }

    /// Links with no traffic and no heartbeat in 2× the heartbeat
    /// interval are failed, and their circuits rerouted.
    async fn scan_for_dead_links(&self) {
        let max_idle = chrono::Duration::from_std(self.heartbeat_interval * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(6));
        for link in self.graph.scan_for_dead_links(max_idle) {
            self.events.dispatch(Event::Link(LinkEvent {
                event_type: LinkEventType::Faulted,
                link_id: link.id.clone(),
                src_router_id: link.src.clone(),
                dst_router_id: link.dst.clone(),
            }));
            self.engine.handle_link_failed(&link.id).await;
        }
    }
}
