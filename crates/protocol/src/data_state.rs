//! Data-state change-sets: the replication stream from controllers to
//! routers.
//!
//! A change-set is a monotonically indexed batch of model mutations.
//! Policy membership is distributed as incremental
//! [`ServicePolicyChange`] deltas rather than whole-policy snapshots, so
//! a router can apply them without re-reading the full model.

use serde::{Deserialize, Serialize};

use trellis_domain::model::{
    Config, ConfigType, Identity, PostureCheck, PublicKey, Revocation, Service, ServicePolicy,
};

/// Mutation kind of a model event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
}

/// Which side of a service policy a membership delta applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelatedEntityType {
    Identity,
    Service,
    PostureCheck,
}

/// Incremental membership delta for a service policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePolicyChange {
    pub policy_id: String,
    pub related_entity_type: RelatedEntityType,
    pub related_entity_ids: Vec<String>,
    pub add: bool,
}

/// The model payload of a single event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelEntity {
    ConfigType(ConfigType),
    Config(Config),
    Identity(Identity),
    Service(Service),
    PostureCheck(PostureCheck),
    ServicePolicy(ServicePolicy),
    PublicKey(PublicKey),
    Revocation(Revocation),
    ServicePolicyChange(ServicePolicyChange),
}

/// One model mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEvent {
    pub action: Action,
    pub model: ModelEntity,
}

impl ModelEvent {
    pub fn create(model: ModelEntity) -> Self {
        Self {
            action: Action::Create,
            model,
        }
    }

    pub fn update(model: ModelEntity) -> Self {
        Self {
            action: Action::Update,
            model,
        }
    }

    pub fn delete(model: ModelEntity) -> Self {
        Self {
            action: Action::Delete,
            model,
        }
    }
}

/// A monotonically indexed batch of model events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub index: u64,
    pub events: Vec<ModelEvent>,
    /// Set on synthetic change-sets that carry a full model export; the
    /// receiver resets its model before applying.
    #[serde(default)]
    pub is_full_state: bool,
}

impl ChangeSet {
    pub fn new(index: u64, events: Vec<ModelEvent>) -> Self {
        Self {
            index,
            events,
            is_full_state: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_domain::model::Identity;

    #[test]
    fn change_set_round_trips() {
        let cs = ChangeSet::new(
            7,
            vec![
                ModelEvent::create(ModelEntity::Identity(Identity {
                    id: "i1".into(),
                    name: "alpha".into(),
                    role_attributes: vec!["db".into()],
                    ..Default::default()
                })),
                ModelEvent::update(ModelEntity::ServicePolicyChange(ServicePolicyChange {
                    policy_id: "p1".into(),
                    related_entity_type: RelatedEntityType::Identity,
                    related_entity_ids: vec!["i1".into()],
                    add: true,
                })),
            ],
        );
        let json = serde_json::to_vec(&cs).unwrap();
        let back: ChangeSet = serde_json::from_slice(&json).unwrap();
        assert_eq!(cs, back);
        assert!(!back.is_full_state);
    }
}
