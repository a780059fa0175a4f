//! Control-plane entities. All ids are opaque immutable strings.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::roles::Semantic;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An authenticatable principal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub identity_type: String,
    #[serde(default)]
    pub role_attributes: Vec<String>,
    /// Per-service config overrides: service id → ordered config ids.
    /// Overrides win over the service's default configs.
    #[serde(default)]
    pub service_configs: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub disabled_until: Option<DateTime<Utc>>,
}

impl Identity {
    /// Disabled either permanently or until a timestamp in the future.
    pub fn is_disabled(&self, now: DateTime<Utc>) -> bool {
        if !self.disabled {
            return false;
        }
        match self.disabled_until {
            Some(until) => now < until,
            None => true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service & terminators
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An addressable network target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role_attributes: Vec<String>,
    /// Terminator selection strategy name. Empty string selects the
    /// registry default (`smartrouting`).
    #[serde(default)]
    pub terminator_strategy: String,
    /// Default configs, ordered. Per-identity overrides take precedence.
    #[serde(default)]
    pub configs: Vec<String>,
    #[serde(default)]
    pub encryption_required: bool,
}

/// Preference tier of a terminator, translated to a cost bias at
/// selection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Precedence {
    Required,
    #[default]
    Default,
    Failed,
}

impl Precedence {
    /// Bias a cost by precedence: required terminators are strongly
    /// preferred, failed ones are effectively last-resort.
    pub fn biased_cost(&self, cost: u32) -> u32 {
        match self {
            Self::Required => cost / 4,
            Self::Default => cost,
            Self::Failed => cost.saturating_add(10_000),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// An endpoint binding for a service on a particular router.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Terminator {
    pub id: String,
    pub service_id: String,
    pub router_id: String,
    pub binding: String,
    pub address: String,
    /// Groups terminators belonging to the same hosting process.
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub cost: u16,
    #[serde(default)]
    pub precedence: Precedence,
    /// Set when a strategy marks the terminator failed, so the original
    /// precedence can be restored after the cool-down.
    #[serde(default)]
    pub saved_precedence: Option<Precedence>,
    #[serde(default)]
    pub host_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Configs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Defines a config schema id; configs reference one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigType {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub schema: serde_json::Value,
}

/// Typed opaque blob attached to services and per-identity-per-service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub id: String,
    pub name: String,
    pub type_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service policies & posture
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Grant direction of a service policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PolicyType {
    #[default]
    Dial,
    Bind,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dial => "dial",
            Self::Bind => "bind",
        }
    }
}

/// Grants dial or bind between identity and service sets, gated by
/// posture checks. Each selector is a token list (`@id`, `#role`, `all`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicePolicy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub policy_type: PolicyType,
    #[serde(default)]
    pub semantic: Semantic,
    #[serde(default)]
    pub identity_roles: Vec<String>,
    #[serde(default)]
    pub service_roles: Vec<String>,
    #[serde(default)]
    pub posture_check_roles: Vec<String>,
}

/// A predicate evaluated at dial time against an identity's posture data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostureCheck {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub check_type: String,
    #[serde(default)]
    pub role_attributes: Vec<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Keys & revocations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicKey {
    /// Key id; the map key in the RDM.
    pub kid: String,
    #[serde(default)]
    pub alg: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Revocation {
    pub id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persistent definition of a data-plane router. Runtime connection
/// state (channel, version, links) lives in the controller's fabric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Router {
    pub id: String,
    pub name: String,
    /// Certificate fingerprint checked at connect; `None` = not enrolled.
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub cost: u16,
    /// Valid endpoint but never used as a transit hop.
    #[serde(default)]
    pub no_traversal: bool,
    #[serde(default)]
    pub disabled: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth policies & external signers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// External JWT signer trusted for primary authentication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalJwtSigner {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub enabled: bool,
}

/// Authentication policy; references external signers by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthPolicy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub primary_ext_jwt_allowed_signers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_bias() {
        assert_eq!(Precedence::Required.biased_cost(100), 25);
        assert_eq!(Precedence::Default.biased_cost(100), 100);
        assert_eq!(Precedence::Failed.biased_cost(100), 10_100);
        assert_eq!(Precedence::Failed.biased_cost(u32::MAX), u32::MAX);
    }

    #[test]
    fn identity_disabled_until() {
        let mut identity = Identity {
            id: "i1".into(),
            disabled: true,
            ..Default::default()
        };
        let now = Utc::now();
        assert!(identity.is_disabled(now));

        identity.disabled_until = Some(now - chrono::Duration::seconds(1));
        assert!(!identity.is_disabled(now));

        identity.disabled_until = Some(now + chrono::Duration::seconds(60));
        assert!(identity.is_disabled(now));
    }

    #[test]
    fn entities_round_trip_json() {
        let terminator = Terminator {
            id: "t1".into(),
            service_id: "svc1".into(),
            router_id: "r1".into(),
            binding: "transport".into(),
            address: "tcp:10.0.0.1:8080".into(),
            cost: 10,
            precedence: Precedence::Required,
            ..Default::default()
        };
        let json = serde_json::to_string(&terminator).unwrap();
        let back: Terminator = serde_json::from_str(&json).unwrap();
        assert_eq!(terminator, back);
    }
}
