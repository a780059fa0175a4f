//! Policy evaluator: role-selector matching, denormalized access tables,
//! and the change events that fall out of incremental policy edits.
//!
//! All evaluation runs inside the storage transaction that triggered it;
//! the transaction commit is the publication point for the accumulated
//! events.

pub mod eval;
pub mod validator;

use serde::Serialize;
use trellis_protocol::data_state::ServicePolicyChange;

/// Access-transition events produced by denorm count changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceEventType {
    DialAccessGained,
    DialAccessLost,
    BindAccessGained,
    BindAccessLost,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEvent {
    pub event_type: ServiceEventType,
    pub identity_id: String,
    pub service_id: String,
}

/// Everything a policy-affecting mutation produced: service access
/// events for subscribers, and membership deltas for the RDM stream.
#[derive(Debug, Default)]
pub struct PolicyOutcome {
    pub service_events: Vec<ServiceEvent>,
    pub policy_changes: Vec<ServicePolicyChange>,
}

impl PolicyOutcome {
    pub fn is_empty(&self) -> bool {
        self.service_events.is_empty() && self.policy_changes.is_empty()
    }
}
