use std::time::Duration;

/// Tagged reason for a failed circuit creation. Strategies use the tag to
/// update terminator health; API callers surface it to the dialing client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitFailureCause {
    IdGeneration,
    InvalidService,
    NoTerminators,
    NoOnlineTerminators,
    NoPath,
    PathMissingLink,
    InvalidStrategy,
    StrategyError,
}

impl CircuitFailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdGeneration => "id_generation",
            Self::InvalidService => "invalid_service",
            Self::NoTerminators => "no_terminators",
            Self::NoOnlineTerminators => "no_online_terminators",
            Self::NoPath => "no_path",
            Self::PathMissingLink => "path_missing_link",
            Self::InvalidStrategy => "invalid_strategy",
            Self::StrategyError => "strategy_error",
        }
    }
}

/// Shared error type used across all trellis crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: &'static str, id: String },

    #[error("{entity_type} {field} conflict on value {value}")]
    Conflict {
        entity_type: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("cannot delete {entity_type} {id}: referenced by {referencing_type} [{}]", .referencing_ids.join(", "))]
    ReferencedByIds {
        entity_type: &'static str,
        id: String,
        referencing_type: &'static str,
        referencing_ids: Vec<String>,
    },

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    #[error("circuit failure ({}): {msg}", .cause.as_str())]
    Circuit { cause: CircuitFailureCause, msg: String },

    #[error("event gap: expected index {expected}, got {actual}")]
    GapFault { expected: u64, actual: u64 },

    #[error("replication: {0}")]
    Replication(String),

    #[error("not leader{}", leader_suffix(.leader))]
    NotLeader { leader: Option<String> },

    #[error("channel: {0}")]
    Channel(String),

    #[error("config: {0}")]
    Config(String),

    #[error("field {field}: {reason}")]
    FieldError { field: String, reason: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    pub fn circuit(cause: CircuitFailureCause, msg: impl Into<String>) -> Self {
        Self::Circuit {
            cause,
            msg: msg.into(),
        }
    }

    /// The circuit failure tag, if this error is one.
    pub fn circuit_cause(&self) -> Option<CircuitFailureCause> {
        match self {
            Self::Circuit { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    /// Whether the caller may reasonably retry after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Overloaded(_) | Self::Timeout(..))
    }
}

fn leader_suffix(leader: &Option<String>) -> String {
    leader
        .as_deref()
        .map(|l| format!(", leader is {l}"))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referenced_by_names_referrers() {
        let err = Error::ReferencedByIds {
            entity_type: "config",
            id: "cfg1".into(),
            referencing_type: "identity-service",
            referencing_ids: vec!["id1:svc1".into(), "id2:svc1".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("cfg1"));
        assert!(msg.contains("id1:svc1"));
        assert!(msg.contains("id2:svc1"));
    }

    #[test]
    fn not_leader_includes_hint() {
        let err = Error::NotLeader {
            leader: Some("ctrl2".into()),
        };
        assert!(err.to_string().contains("ctrl2"));

        let err = Error::NotLeader { leader: None };
        assert_eq!(err.to_string(), "not leader");
    }

    #[test]
    fn circuit_cause_is_surfaced() {
        let err = Error::circuit(CircuitFailureCause::NoPath, "r1 unreachable");
        assert_eq!(err.circuit_cause(), Some(CircuitFailureCause::NoPath));
        assert!(err.to_string().contains("no_path"));
    }
}
