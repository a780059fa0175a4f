//! Typed frame bodies.
//!
//! `RouteResult` and `HeartbeatResponse` carry everything in the frame
//! envelope (success/error/peer-data headers, echoed body) and have no
//! typed body of their own.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handshake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Link listener advertised by a router for inbound link dials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkListener {
    pub protocol: String,
    pub address: String,
}

/// First frame in each direction on a new channel. The router sends its
/// identity and capabilities; the controller answers with its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Router id, or controller node id on the reply.
    pub peer_id: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Advertised link listeners (router → controller only).
    #[serde(default)]
    pub listeners: Vec<LinkListener>,
    /// Last data-state index the router has applied; drives replay.
    #[serde(default)]
    pub last_data_state_index: Option<u64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Route programs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Egress leg of a route program, present only on the terminator router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Egress {
    pub terminator_id: String,
    pub binding: String,
    pub address: String,
    /// Opaque dial metadata forwarded to the hosting endpoint.
    #[serde(default)]
    pub peer_data: HashMap<i32, Vec<u8>>,
}

/// Per-hop forwarding-table program for one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub circuit_id: String,
    pub attempt: u32,
    /// Opaque hop tokens the router keys its forwarding entry on.
    pub ingress_token: String,
    pub egress_token: String,
    /// Link to forward onto; `None` on the egress router.
    pub next_hop_link: Option<String>,
    /// Terminator dial instructions; `Some` only on the egress router.
    pub egress: Option<Egress>,
    /// Router-side deadline for establishing the route.
    pub timeout_ms: u64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// Tear down the forwarding entry for a circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unroute {
    pub circuit_id: String,
    /// Drop immediately instead of draining in-flight payload.
    pub now: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Faults & link state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultSubject {
    LinkFault,
    CircuitFault,
    ForwardingFault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub subject: FaultSubject,
    pub id: String,
    #[serde(default)]
    pub iteration: u32,
}

/// Router notification that a dialed link reached its peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConnected {
    pub link_id: String,
    pub iteration: u32,
}

/// A link a router reports as already established (sent on reconnect so
/// the controller can rebuild its graph without redialing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedLink {
    pub link_id: String,
    pub iteration: u32,
    pub protocol: String,
    pub dial_address: String,
    pub dst_router_id: String,
}

/// Presence report from a router: its current link view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterPresence {
    pub router_id: String,
    #[serde(default)]
    pub links: Vec<ReportedLink>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Settings, inspection & validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Push a runtime setting to a router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingUpdate {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectRequest {
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectResponse {
    #[serde(default)]
    pub values: HashMap<String, String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Ask a router to report the terminators it actually hosts so the
/// controller can reconcile its records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateTerminators {
    pub terminator_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateTerminatorsResult {
    #[serde(default)]
    pub valid: Vec<String>,
    #[serde(default)]
    pub invalid: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRouterLinks;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRouterLinksResult {
    #[serde(default)]
    pub links: Vec<ReportedLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRouterSdkTerminators;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRouterSdkTerminatorsResult {
    #[serde(default)]
    pub terminator_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRouterDataModel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRouterDataModelResult {
    pub last_index: u64,
    /// Content hash of the router's model, for divergence detection.
    pub model_hash: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heartbeat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Heartbeat body; the peer echoes it verbatim in a `HeartbeatResponse`
/// so the sender can compute the round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sent_at_nanos: u64,
}
