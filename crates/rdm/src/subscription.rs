//! Per-identity access subscriptions.
//!
//! A subscriber sees: one initial snapshot, then identity-changed and
//! per-service added/changed/removed deltas. The snapshot is built
//! lazily under the subscription's own mutex; every applied change-set
//! re-derives the service view and diffs it against the previous one, so
//! snapshot-plus-deltas always equals a direct recomputation at the
//! later index.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use trellis_domain::model::{Identity, PolicyType, PostureCheck, Service};
use trellis_domain::{Error, Result};

use crate::model::{IdentityState, Rdm};

/// One reachable service in an identity's access view.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityService {
    pub service: Service,
    /// Union of posture checks from the granting policies.
    pub checks: HashMap<String, PostureCheck>,
    /// Effective config data keyed by config-type name. Service defaults
    /// merged with per-identity overrides; the override wins.
    pub configs: HashMap<String, serde_json::Value>,
    pub dial_allowed: bool,
    pub bind_allowed: bool,
    pub service_index: u64,
}

/// Callbacks delivered to identity subscribers, in order, under the
/// subscription lock.
pub trait IdentityEventSubscriber: Send + Sync {
    fn notify_initial_state(
        &self,
        identity: &Identity,
        services: &HashMap<String, IdentityService>,
    );
    fn notify_identity_updated(&self, index: u64, identity: &Identity);
    fn notify_service_added(&self, index: u64, service: &IdentityService);
    fn notify_service_changed(&self, index: u64, service: &IdentityService);
    fn notify_service_removed(&self, index: u64, service_id: &str);
}

struct SubscriptionState {
    identity: Identity,
    identity_index: u64,
    /// `None` until the first subscriber forces the snapshot build.
    services: Option<HashMap<String, IdentityService>>,
    listeners: Vec<Arc<dyn IdentityEventSubscriber>>,
}

pub(crate) struct IdentitySubscription {
    identity_id: String,
    state: Mutex<SubscriptionState>,
}

pub(crate) fn subscribe(
    rdm: &Rdm,
    identity_id: &str,
    subscriber: Arc<dyn IdentityEventSubscriber>,
) -> Result<()> {
    let identity_state = rdm
        .identities
        .get(identity_id)
        .map(|s| (s.identity.clone(), s.identity_index))
        .ok_or_else(|| Error::not_found("identity", identity_id))?;

    let subscription = rdm
        .subscriptions
        .entry(identity_id.to_string())
        .or_insert_with(|| {
            Arc::new(IdentitySubscription {
                identity_id: identity_id.to_string(),
                state: Mutex::new(SubscriptionState {
                    identity: identity_state.0.clone(),
                    identity_index: identity_state.1,
                    services: None,
                    listeners: Vec::new(),
                }),
            })
        })
        .clone();

    let mut state = subscription.state.lock();
    state.listeners.push(subscriber.clone());
    if state.services.is_none() {
        state.services = Some(match rdm.identities.get(identity_id) {
            Some(identity) => build_service_list(rdm, &identity),
            None => HashMap::new(),
        });
    }
    let services = state.services.as_ref().map(Clone::clone).unwrap_or_default();
    subscriber.notify_initial_state(&state.identity, &services);
    Ok(())
}

/// Re-derive every subscription's view after an applied change-set.
pub(crate) fn sync_all(rdm: &Rdm) {
    let index = rdm.current_index().unwrap_or(0);
    let subscriptions: Vec<Arc<IdentitySubscription>> =
        rdm.subscriptions.iter().map(|e| e.value().clone()).collect();

    for subscription in subscriptions {
        let mut state = subscription.state.lock();
        let Some(previous) = state.services.take() else {
            // Snapshot never built; nothing to diff against.
            continue;
        };

        let Some(identity_state) = rdm.identities.get(&subscription.identity_id) else {
            // Identity deleted: every service is lost.
            for service_id in previous.keys() {
                for listener in &state.listeners {
                    listener.notify_service_removed(index, service_id);
                }
            }
            state.services = Some(HashMap::new());
            continue;
        };

        if identity_state.identity_index != state.identity_index {
            state.identity = identity_state.identity.clone();
            state.identity_index = identity_state.identity_index;
            for listener in &state.listeners {
                listener.notify_identity_updated(index, &state.identity);
            }
        }

        let current = build_service_list(rdm, &identity_state);
        drop(identity_state);

        for (service_id, service) in &current {
            match previous.get(service_id) {
                None => {
                    for listener in &state.listeners {
                        listener.notify_service_added(index, service);
                    }
                }
                Some(old) if old != service => {
                    for listener in &state.listeners {
                        listener.notify_service_changed(index, service);
                    }
                }
                Some(_) => {}
            }
        }
        for service_id in previous.keys() {
            if !current.contains_key(service_id) {
                for listener in &state.listeners {
                    listener.notify_service_removed(index, service_id);
                }
            }
        }

        state.services = Some(current);
    }
}

fn build_service_list(rdm: &Rdm, identity: &IdentityState) -> HashMap<String, IdentityService> {
    let mut services: HashMap<String, IdentityService> = HashMap::new();

    for policy_id in &identity.service_policies {
        let Some(policy) = rdm.service_policies.get(policy_id) else {
            tracing::error!(
                identity_id = %identity.identity.id,
                policy_id = %policy_id,
                "could not find service policy"
            );
            continue;
        };

        for service_id in &policy.services {
            let Some(service_state) = rdm.services.get(service_id) else {
                tracing::error!(
                    identity_id = %identity.identity.id,
                    policy_id = %policy_id,
                    service_id = %service_id,
                    "could not find service"
                );
                continue;
            };

            let entry = services
                .entry(service_id.clone())
                .or_insert_with(|| IdentityService {
                    service: service_state.service.clone(),
                    checks: HashMap::new(),
                    configs: effective_configs(rdm, &identity.identity, &service_state.service),
                    dial_allowed: false,
                    bind_allowed: false,
                    service_index: service_state.index,
                });

            match policy.policy.policy_type {
                PolicyType::Dial => entry.dial_allowed = true,
                PolicyType::Bind => entry.bind_allowed = true,
            }

            for check_id in &policy.posture_checks {
                match rdm.posture_checks.get(check_id) {
                    Some(check) => {
                        entry.checks.insert(check_id.clone(), check.check.clone());
                    }
                    None => {
                        tracing::error!(
                            identity_id = %identity.identity.id,
                            policy_id = %policy_id,
                            posture_check_id = %check_id,
                            "could not find posture check"
                        );
                    }
                }
            }
        }
    }

    services
}

/// Service default configs merged with the identity's per-service
/// overrides, keyed by config-type name. Overrides are applied second and
/// win on type-name collision.
fn effective_configs(
    rdm: &Rdm,
    identity: &Identity,
    service: &Service,
) -> HashMap<String, serde_json::Value> {
    let mut result = HashMap::new();

    let mut load = |config_id: &String, result: &mut HashMap<String, serde_json::Value>| {
        let Some(config) = rdm.configs.get(config_id) else {
            tracing::error!(config_id = %config_id, "could not find config");
            return;
        };
        let Some(config_type) = rdm.config_types.get(&config.config.type_id) else {
            tracing::error!(
                config_id = %config_id,
                config_type_id = %config.config.type_id,
                "could not find config type"
            );
            return;
        };
        result.insert(
            config_type.config_type.name.clone(),
            config.config.data.clone(),
        );
    };

    for config_id in &service.configs {
        load(config_id, &mut result);
    }
    if let Some(overrides) = identity.service_configs.get(&service.id) {
        for config_id in overrides {
            load(config_id, &mut result);
        }
    }

    result
}
