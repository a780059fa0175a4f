//! Controller bootstrap: build the shared state, start the supervisor,
//! and serve the router control listener.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;

use trellis_domain::config::Config;
use trellis_domain::Error;
use trellis_protocol::msgs::Hello;
use trellis_protocol::{ContentType, Frame};
use trellis_rdm::Rdm;

use crate::channel::channel::{accept_handshake, ChannelConfig};
use crate::channel::{ControlChannel, RouterChannel, SendPool};
use crate::circuit::{CircuitEngine, EngineConfig, StrategyRegistry};
use crate::dispatch::{
    AdaptiveLimiter, CommandDispatcher, ControllerModel, LocalDispatcher, ReplicatedDispatcher,
    SoloLog,
};
use crate::events::{Event, EventDispatcher, RouterEvent, RouterEventType};
use crate::fabric::{LinkGraph, RouterRegistry};
use crate::state::{AppState, ControlSink};
use crate::store::{Db, Stores};
use crate::supervisor::{Supervisor, SupervisorNudge};

/// Build the full application state from configuration. The router
/// registry is seeded from storage; runtime connection state starts
/// empty.
pub fn build_state(config: Arc<Config>) -> anyhow::Result<(AppState, Supervisor)> {
    let db = Db::open(&config.store.path).context("opening primary store")?;
    let stores = Arc::new(Stores::new());
    let rdm = Arc::new(Rdm::new_sender(
        config.rdm.log_size,
        config.rdm.listener_buffer,
    ));
    let events = Arc::new(EventDispatcher::new());
    let registry = Arc::new(RouterRegistry::new());
    let graph = Arc::new(LinkGraph::new(config.network.initial_link_latency_ms));
    let strategies = Arc::new(StrategyRegistry::new());

    db.view(|tx| {
        for router in stores.routers.all(tx) {
            registry.put(router);
        }
        Ok(())
    })
    .context("seeding router registry")?;

    let model = Arc::new(ControllerModel::new(
        db.clone(),
        stores.clone(),
        rdm.clone(),
        events.clone(),
        registry.clone(),
    ));

    let engine = Arc::new(CircuitEngine::new(
        &config.node_id,
        registry.clone(),
        graph.clone(),
        db.clone(),
        stores.clone(),
        strategies.clone(),
        events.clone(),
        EngineConfig {
            create_circuit_retries: config.network.create_circuit_retries,
            route_timeout: config.network.route_timeout(),
        },
    ));
    model.attach_engine(engine.clone());

    // Seed the replica stream with current storage contents so routers
    // connecting before any command see the full model.
    let seed = model.full_state_change_set(rdm.current_index().unwrap_or(0))?;
    rdm.apply_change_set(&seed)?;

    let dispatcher: Arc<dyn CommandDispatcher> = if config.cluster.data_dir.is_some() {
        // The consensus engine is deployment-provided; a single-node
        // log keeps the same dispatch semantics until peers join.
        Arc::new(ReplicatedDispatcher::new(
            Arc::new(SoloLog::new(config.node_id.clone())),
            model.clone(),
            config.cluster.max_inflight_commands,
        ))
    } else {
        Arc::new(LocalDispatcher::new(
            model.clone(),
            config.cluster.max_inflight_commands,
        ))
    };

    let pool = Arc::new(SendPool::new(config.ctrl.queue_size, config.ctrl.max_workers));
    let handshake_limiter = Arc::new(AdaptiveLimiter::new(
        1,
        config.cluster.max_inflight_commands,
    ));

    let supervisor = Supervisor::new(
        registry.clone(),
        graph.clone(),
        engine.clone(),
        events.clone(),
        config.network.clone(),
        config.ctrl.heartbeat_interval(),
    );

    let state = AppState {
        config,
        db,
        stores,
        rdm,
        model,
        registry,
        graph,
        strategies,
        engine,
        dispatcher,
        handshake_limiter,
        pool,
        events,
    };
    Ok((state, supervisor))
}

/// Run the controller until shutdown: supervisor loop plus the router
/// control listener.
pub async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    let (state, supervisor) = build_state(config.clone())?;
    let nudge = supervisor.nudge_handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(supervisor.run(shutdown_rx));

    let listener = TcpListener::bind(&config.ctrl.bind)
        .await
        .with_context(|| format!("binding control listener on {}", config.ctrl.bind))?;
    tracing::info!(bind = %config.ctrl.bind, node_id = %config.node_id, "control listener ready");

    let accept_loop = async {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            };
            // Handshake admission shares the adaptive window.
            let guard = match state.handshake_limiter.acquire() {
                Ok(guard) => guard,
                Err(err) => {
                    tracing::warn!(peer = %peer, error = %err, "shedding connection");
                    continue;
                }
            };
            let state = state.clone();
            let nudge = nudge.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, state, nudge).await {
                    tracing::warn!(peer = %peer, error = %err, "router connection failed");
                }
                drop(guard);
            });
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    }
    Ok(())
}

fn controller_hello(state: &AppState) -> Hello {
    Hello {
        peer_id: state.config.node_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: vec!["trellis.fabric".into(), "trellis.data-state".into()],
        listeners: vec![],
        last_data_state_index: state.rdm.current_index(),
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    state: AppState,
    nudge: SupervisorNudge,
) -> anyhow::Result<()> {
    let hello_reply = controller_hello(&state);
    let (hello, stream) =
        accept_handshake(stream, &hello_reply, Duration::from_secs(10)).await?;
    let router_id = hello.peer_id.clone();

    let sink = Arc::new(ControlSink {
        registry: state.registry.clone(),
        graph: state.graph.clone(),
        engine: state.engine.clone(),
        events: state.events.clone(),
        nudge: nudge.clone(),
    });

    let channel_config = ChannelConfig {
        heartbeat_interval: state.config.ctrl.heartbeat_interval(),
        unresponsive_after: state.config.ctrl.unresponsive_after(),
        send_timeout: state.config.ctrl.send_timeout(),
        outbound_queue: 64,
    };
    let channel = RouterChannel::start(stream, &hello, channel_config, sink);

    // Fingerprint verification comes from the mutual-TLS layer in front
    // of this listener; with none available, enrolled routers are
    // rejected rather than trusted.
    if let Err(err) = state.registry.mark_connected(
        &router_id,
        channel.clone(),
        hello.version.clone(),
        hello.capabilities.clone(),
        None,
    ) {
        channel.close();
        return Err(err.into());
    }

    state.events.dispatch(Event::Router(RouterEvent {
        event_type: RouterEventType::Connected,
        router_id: router_id.clone(),
        version: Some(hello.version.clone()),
    }));
    nudge.nudge_after(Duration::from_millis(250));
    validate_router_terminators(&state, &router_id);

    // Seed or replay the router's data model, then stream deltas for the
    // life of the channel.
    stream_data_state(&state, &router_id, hello.last_data_state_index, channel).await;
    Ok(())
}

/// Reconcile the router's terminator records with what it actually
/// hosts; stale terminators are deleted through the command path.
fn validate_router_terminators(state: &AppState, router_id: &str) {
    let terminator_ids: Vec<String> = match state.db.view(|tx| {
        Ok(state
            .stores
            .terminators
            .for_router(tx, router_id)
            .into_iter()
            .map(|t| t.id)
            .collect())
    }) {
        Ok(ids) => ids,
        Err(err) => {
            tracing::error!(router_id = %router_id, error = %err, "could not load terminators");
            return;
        }
    };
    tracing::debug!(router_id = %router_id, count = terminator_ids.len(), "terminators to validate");
    if terminator_ids.is_empty() {
        return;
    }

    let state = state.clone();
    let router_id = router_id.to_string();
    tokio::spawn(async move {
        let mut results = crate::channel::validation::validate_terminators(
            &state.registry,
            &state.pool,
            vec![(router_id.clone(), terminator_ids)],
            state.config.ctrl.send_timeout(),
        )
        .await;
        while let Some(outcome) = results.recv().await {
            match outcome.result {
                Ok(result) => {
                    for terminator_id in result.invalid {
                        tracing::warn!(
                            router_id = %outcome.router_id,
                            terminator_id = %terminator_id,
                            "router no longer hosts terminator, deleting"
                        );
                        let command = crate::dispatch::Command::DeleteTerminator {
                            id: terminator_id,
                        };
                        if let Err(err) = state.dispatcher.dispatch(command).await {
                            tracing::error!(error = %err, "could not delete stale terminator");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        router_id = %outcome.router_id,
                        error = %err,
                        "terminator validation failed"
                    );
                }
            }
        }
    });
}

/// Replay change-sets from the router's last index (or push a full
/// data-state when the log horizon has passed it), then forward the
/// live delta stream.
async fn stream_data_state(
    state: &AppState,
    router_id: &str,
    last_index: Option<u64>,
    channel: Arc<RouterChannel>,
) {
    use crate::channel::ControlChannel;

    // Register the live listener before computing the backlog so no
    // change-set can fall between them; the router's event cache drops
    // any overlap as idempotent replay.
    let mut live = state.rdm.new_listener();

    // A router ahead of this controller's stream (an index from a prior
    // controller incarnation) cannot be replayed; re-seed it.
    let controller_index = state.rdm.current_index().unwrap_or(0);
    let last_index = last_index.filter(|idx| *idx <= controller_index);

    let backlog = match last_index {
        Some(index) => match state.rdm.event_cache().replay_from(index) {
            Ok(backlog) => backlog,
            Err(Error::GapFault { expected, actual }) => {
                tracing::info!(
                    router_id = %router_id,
                    expected,
                    actual,
                    "router behind log horizon, re-seeding with full data state"
                );
                vec![state.rdm.get_data_state()]
            }
            Err(err) => {
                tracing::error!(router_id = %router_id, error = %err, "replay failed");
                return;
            }
        },
        None => vec![state.rdm.get_data_state()],
    };

    for change_set in backlog {
        match Frame::typed(ContentType::DataStateChangeSet, &change_set) {
            Ok(frame) => {
                if let Err(err) = channel.send(frame).await {
                    tracing::warn!(router_id = %router_id, error = %err, "replay send failed");
                    return;
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "could not encode change-set");
                return;
            }
        }
    }

    let router_id = router_id.to_string();
    tokio::spawn(async move {
        while let Some(change_set) = live.recv().await {
            if !channel.is_connected() {
                return;
            }
            match Frame::typed(ContentType::DataStateChangeSet, &change_set) {
                Ok(frame) => {
                    if let Err(err) = channel.send(frame).await {
                        tracing::debug!(router_id = %router_id, error = %err, "delta send failed");
                        return;
                    }
                }
                Err(err) => tracing::error!(error = %err, "could not encode change-set"),
            }
        }
    });
}
