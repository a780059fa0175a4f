//! The router data model proper: keyed entity maps plus change-set
//! application.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use trellis_domain::model::{
    Config, ConfigType, Identity, PolicyType, PostureCheck, PublicKey, Revocation, Service,
    ServicePolicy,
};
use trellis_domain::{Error, Result};
use trellis_protocol::data_state::{
    Action, ChangeSet, ModelEntity, ModelEvent, RelatedEntityType, ServicePolicyChange,
};

use crate::event_cache::EventCache;
use crate::subscription::{IdentityEventSubscriber, IdentitySubscription};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stamped entity wrappers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Identity plus the policy memberships replicated via membership deltas.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IdentityState {
    pub identity: Identity,
    pub service_policies: HashSet<String>,
    /// Index of the change-set that last touched the identity itself.
    pub identity_index: u64,
    /// Index of the change-set that last touched its policy memberships.
    pub service_set_index: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServiceState {
    pub service: Service,
    pub index: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConfigTypeState {
    pub config_type: ConfigType,
    pub index: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConfigState {
    pub config: Config,
    pub index: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PostureCheckState {
    pub check: PostureCheck,
    pub index: u64,
}

/// Policy plus its replicated service / posture-check membership sets.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PolicyState {
    pub policy: ServicePolicy,
    pub services: HashSet<String>,
    pub posture_checks: HashSet<String>,
}

/// An identity's access to a service through the granting policies. The
/// posture-check map resolves missing ids to `None`; the evaluator treats
/// a `None` entry as a failed check.
#[derive(Debug, Clone)]
pub struct AccessPolicies {
    pub identity: Identity,
    pub service: Service,
    pub policies: Vec<ServicePolicy>,
    pub posture_checks: HashMap<String, Option<PostureCheck>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rdm
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sender- or receiver-mode router data model; the mode is fixed by the
/// event cache variant it was built with.
pub struct Rdm {
    pub(crate) cache: EventCache,

    pub(crate) config_types: DashMap<String, ConfigTypeState>,
    pub(crate) configs: DashMap<String, ConfigState>,
    pub(crate) identities: DashMap<String, IdentityState>,
    pub(crate) services: DashMap<String, ServiceState>,
    pub(crate) service_policies: DashMap<String, PolicyState>,
    pub(crate) posture_checks: DashMap<String, PostureCheckState>,
    pub(crate) public_keys: DashMap<String, PublicKey>,
    pub(crate) revocations: DashMap<String, Revocation>,

    listeners: RwLock<Vec<mpsc::Sender<ChangeSet>>>,
    listener_buffer: usize,
    pub(crate) last_save_index: Mutex<Option<u64>>,
    pub(crate) subscriptions: DashMap<String, Arc<IdentitySubscription>>,
}

impl Rdm {
    fn with_cache(cache: EventCache, listener_buffer: usize) -> Self {
        Self {
            cache,
            config_types: DashMap::new(),
            configs: DashMap::new(),
            identities: DashMap::new(),
            services: DashMap::new(),
            service_policies: DashMap::new(),
            posture_checks: DashMap::new(),
            public_keys: DashMap::new(),
            revocations: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            listener_buffer,
            last_save_index: Mutex::new(None),
            subscriptions: DashMap::new(),
        }
    }

    /// Controller-side model: retains `log_size` change-sets for replay.
    pub fn new_sender(log_size: usize, listener_buffer: usize) -> Self {
        Self::with_cache(EventCache::logging(log_size), listener_buffer)
    }

    /// Router-side model: no replay log.
    pub fn new_receiver(listener_buffer: usize) -> Self {
        Self::with_cache(EventCache::forgetful(), listener_buffer)
    }

    pub fn event_cache(&self) -> &EventCache {
        &self.cache
    }

    pub fn current_index(&self) -> Option<u64> {
        self.cache.current_index()
    }

    /// Register a listener that receives every applied change-set.
    pub fn new_listener(&self) -> mpsc::Receiver<ChangeSet> {
        let (tx, rx) = mpsc::channel(self.listener_buffer.max(1));
        self.listeners.write().push(tx);
        rx
    }

    fn publish(&self, change: &ChangeSet) {
        let mut listeners = self.listeners.write();
        listeners.retain(|tx| match tx.try_send(change.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(index = change.index, "change-set listener lagging, dropping it");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Apply a change-set through the event cache; out-of-order indexes
    /// are handled per the cache contract. Accepted change-sets are
    /// published to listeners and reflected into identity subscriptions.
    pub fn apply_change_set(&self, change: &ChangeSet) -> Result<()> {
        let accepted = self.cache.store(change, |index, change| {
            if change.is_full_state {
                self.clear();
            }
            for event in &change.events {
                self.handle(index, event);
            }
        })?;

        if accepted {
            self.publish(change);
            crate::subscription::sync_all(self);
        }
        Ok(())
    }

    fn clear(&self) {
        self.config_types.clear();
        self.configs.clear();
        self.identities.clear();
        self.services.clear();
        self.service_policies.clear();
        self.posture_checks.clear();
        self.public_keys.clear();
        self.revocations.clear();
    }

    // ── event handlers ──────────────────────────────────────────────

    pub(crate) fn handle(&self, index: u64, event: &ModelEvent) {
        match &event.model {
            ModelEntity::ConfigType(entity) => self.handle_config_type(index, event.action, entity),
            ModelEntity::Config(entity) => self.handle_config(index, event.action, entity),
            ModelEntity::Identity(entity) => self.handle_identity(index, event.action, entity),
            ModelEntity::Service(entity) => self.handle_service(index, event.action, entity),
            ModelEntity::PostureCheck(entity) => self.handle_posture_check(index, event.action, entity),
            ModelEntity::ServicePolicy(entity) => self.handle_service_policy(event.action, entity),
            ModelEntity::PublicKey(entity) => self.handle_public_key(event.action, entity),
            ModelEntity::Revocation(entity) => self.handle_revocation(event.action, entity),
            ModelEntity::ServicePolicyChange(change) => self.handle_policy_change(index, change),
        }
    }

    fn handle_identity(&self, index: u64, action: Action, entity: &Identity) {
        if action == Action::Delete {
            self.identities.remove(&entity.id);
            return;
        }
        match self.identities.entry(entity.id.clone()) {
            Entry::Occupied(mut existing) => {
                let state = existing.get_mut();
                state.identity = entity.clone();
                state.identity_index = index;
            }
            Entry::Vacant(slot) => {
                slot.insert(IdentityState {
                    identity: entity.clone(),
                    service_policies: HashSet::new(),
                    identity_index: index,
                    service_set_index: index,
                });
            }
        }
    }

    fn handle_service(&self, index: u64, action: Action, entity: &Service) {
        if action == Action::Delete {
            self.services.remove(&entity.id);
        } else {
            self.services.insert(
                entity.id.clone(),
                ServiceState {
                    service: entity.clone(),
                    index,
                },
            );
        }
    }

    fn handle_config_type(&self, index: u64, action: Action, entity: &ConfigType) {
        if action == Action::Delete {
            self.config_types.remove(&entity.id);
        } else {
            self.config_types.insert(
                entity.id.clone(),
                ConfigTypeState {
                    config_type: entity.clone(),
                    index,
                },
            );
        }
    }

    fn handle_config(&self, index: u64, action: Action, entity: &Config) {
        if action == Action::Delete {
            self.configs.remove(&entity.id);
        } else {
            self.configs.insert(
                entity.id.clone(),
                ConfigState {
                    config: entity.clone(),
                    index,
                },
            );
        }
    }

    fn handle_posture_check(&self, index: u64, action: Action, entity: &PostureCheck) {
        if action == Action::Delete {
            self.posture_checks.remove(&entity.id);
        } else {
            self.posture_checks.insert(
                entity.id.clone(),
                PostureCheckState {
                    check: entity.clone(),
                    index,
                },
            );
        }
    }

    fn handle_service_policy(&self, action: Action, entity: &ServicePolicy) {
        if action == Action::Delete {
            self.service_policies.remove(&entity.id);
            return;
        }
        match self.service_policies.entry(entity.id.clone()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().policy = entity.clone();
            }
            Entry::Vacant(slot) => {
                slot.insert(PolicyState {
                    policy: entity.clone(),
                    services: HashSet::new(),
                    posture_checks: HashSet::new(),
                });
            }
        }
    }

    fn handle_public_key(&self, action: Action, entity: &PublicKey) {
        if action == Action::Delete {
            self.public_keys.remove(&entity.kid);
        } else {
            self.public_keys.insert(entity.kid.clone(), entity.clone());
        }
    }

    fn handle_revocation(&self, action: Action, entity: &Revocation) {
        if action == Action::Delete {
            self.revocations.remove(&entity.id);
        } else {
            self.revocations.insert(entity.id.clone(), entity.clone());
        }
    }

    /// Membership deltas mutate either the identity's policy set or the
    /// policy's service/posture-check sets. Deletes tolerate missing
    /// pre-images: the delta may race an entity delete in the same log.
    fn handle_policy_change(&self, index: u64, change: &ServicePolicyChange) {
        if change.related_entity_type == RelatedEntityType::Identity {
            for identity_id in &change.related_entity_ids {
                if let Some(mut state) = self.identities.get_mut(identity_id) {
                    if change.add {
                        state.service_policies.insert(change.policy_id.clone());
                    } else {
                        state.service_policies.remove(&change.policy_id);
                    }
                    state.service_set_index = index;
                }
            }
            return;
        }

        if let Some(mut state) = self.service_policies.get_mut(&change.policy_id) {
            let set = match change.related_entity_type {
                RelatedEntityType::Service => &mut state.services,
                RelatedEntityType::PostureCheck => &mut state.posture_checks,
                RelatedEntityType::Identity => unreachable!("handled above"),
            };
            if change.add {
                set.extend(change.related_entity_ids.iter().cloned());
            } else {
                for id in &change.related_entity_ids {
                    set.remove(id);
                }
            }
        }
    }

    // ── queries ─────────────────────────────────────────────────────

    pub fn identity(&self, id: &str) -> Option<Identity> {
        self.identities.get(id).map(|s| s.identity.clone())
    }

    pub fn service(&self, id: &str) -> Option<Service> {
        self.services.get(id).map(|s| s.service.clone())
    }

    pub fn public_keys(&self) -> HashMap<String, PublicKey> {
        self.public_keys
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// The policies of `policy_type` granting `identity_id` access to
    /// `service_id`, with the union of their posture checks.
    pub fn get_service_access_policies(
        &self,
        identity_id: &str,
        service_id: &str,
        policy_type: PolicyType,
    ) -> Result<AccessPolicies> {
        let identity = self
            .identities
            .get(identity_id)
            .ok_or_else(|| Error::not_found("identity", identity_id))?;
        let service = self
            .services
            .get(service_id)
            .ok_or_else(|| Error::not_found("service", service_id))?;

        let mut policies = Vec::new();
        let mut posture_checks = HashMap::new();

        for policy_id in &identity.service_policies {
            let Some(policy_state) = self.service_policies.get(policy_id) else {
                continue;
            };
            if policy_state.policy.policy_type != policy_type
                || !policy_state.services.contains(service_id)
            {
                continue;
            }

            for check_id in &policy_state.posture_checks {
                posture_checks.entry(check_id.clone()).or_insert_with(|| {
                    self.posture_checks.get(check_id).map(|s| s.check.clone())
                });
            }
            policies.push(policy_state.policy.clone());
        }

        Ok(AccessPolicies {
            identity: identity.identity.clone(),
            service: service.service.clone(),
            policies,
            posture_checks,
        })
    }

    /// Subscribe to per-identity access changes. The initial snapshot is
    /// built lazily under the subscription lock and delivered before any
    /// delta.
    pub fn subscribe_to_identity_changes(
        &self,
        identity_id: &str,
        subscriber: Arc<dyn IdentityEventSubscriber>,
    ) -> Result<()> {
        crate::subscription::subscribe(self, identity_id, subscriber)
    }

    // ── full state export ───────────────────────────────────────────

    /// Export the whole model as one synthetic change-set at the current
    /// index. Used to seed routers that cannot be replayed from the log.
    pub fn get_data_state(&self) -> ChangeSet {
        let mut events = Vec::new();
        let mut index = 0;

        self.cache.while_locked(|current, _| {
            index = current;

            for entry in self.config_types.iter() {
                events.push(ModelEvent::create(ModelEntity::ConfigType(
                    entry.config_type.clone(),
                )));
            }
            for entry in self.configs.iter() {
                events.push(ModelEvent::create(ModelEntity::Config(entry.config.clone())));
            }
            for entry in self.identities.iter() {
                events.push(ModelEvent::create(ModelEntity::Identity(
                    entry.identity.clone(),
                )));
            }
            for entry in self.services.iter() {
                events.push(ModelEvent::create(ModelEntity::Service(
                    entry.service.clone(),
                )));
            }
            for entry in self.posture_checks.iter() {
                events.push(ModelEvent::create(ModelEntity::PostureCheck(
                    entry.check.clone(),
                )));
            }
            for entry in self.public_keys.iter() {
                events.push(ModelEvent::create(ModelEntity::PublicKey(
                    entry.value().clone(),
                )));
            }
            for entry in self.revocations.iter() {
                events.push(ModelEvent::create(ModelEntity::Revocation(
                    entry.value().clone(),
                )));
            }

            // Policies, then their membership sets as deltas.
            for entry in self.service_policies.iter() {
                events.push(ModelEvent::create(ModelEntity::ServicePolicy(
                    entry.policy.clone(),
                )));
                if !entry.services.is_empty() {
                    events.push(ModelEvent::create(ModelEntity::ServicePolicyChange(
                        ServicePolicyChange {
                            policy_id: entry.policy.id.clone(),
                            related_entity_type: RelatedEntityType::Service,
                            related_entity_ids: entry.services.iter().cloned().collect(),
                            add: true,
                        },
                    )));
                }
                if !entry.posture_checks.is_empty() {
                    events.push(ModelEvent::create(ModelEntity::ServicePolicyChange(
                        ServicePolicyChange {
                            policy_id: entry.policy.id.clone(),
                            related_entity_type: RelatedEntityType::PostureCheck,
                            related_entity_ids: entry.posture_checks.iter().cloned().collect(),
                            add: true,
                        },
                    )));
                }
            }

            // Identity memberships, grouped per policy.
            let mut by_policy: HashMap<String, Vec<String>> = HashMap::new();
            for entry in self.identities.iter() {
                for policy_id in &entry.service_policies {
                    by_policy
                        .entry(policy_id.clone())
                        .or_default()
                        .push(entry.identity.id.clone());
                }
            }
            for (policy_id, identity_ids) in by_policy {
                events.push(ModelEvent::create(ModelEntity::ServicePolicyChange(
                    ServicePolicyChange {
                        policy_id,
                        related_entity_type: RelatedEntityType::Identity,
                        related_entity_ids: identity_ids,
                        add: true,
                    },
                )));
            }
        });

        ChangeSet {
            index,
            events,
            is_full_state: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_event(id: &str, attrs: &[&str]) -> ModelEvent {
        ModelEvent::create(ModelEntity::Identity(Identity {
            id: id.into(),
            name: id.into(),
            role_attributes: attrs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }))
    }

    fn service_event(id: &str) -> ModelEvent {
        ModelEvent::create(ModelEntity::Service(Service {
            id: id.into(),
            name: id.into(),
            ..Default::default()
        }))
    }

    fn policy_event(id: &str, policy_type: PolicyType) -> ModelEvent {
        ModelEvent::create(ModelEntity::ServicePolicy(ServicePolicy {
            id: id.into(),
            name: id.into(),
            policy_type,
            ..Default::default()
        }))
    }

    fn membership(
        policy: &str,
        related: RelatedEntityType,
        ids: &[&str],
        add: bool,
    ) -> ModelEvent {
        ModelEvent::update(ModelEntity::ServicePolicyChange(ServicePolicyChange {
            policy_id: policy.into(),
            related_entity_type: related,
            related_entity_ids: ids.iter().map(|s| s.to_string()).collect(),
            add,
        }))
    }

    fn seeded_rdm() -> Rdm {
        let rdm = Rdm::new_sender(100, 4);
        rdm.apply_change_set(&ChangeSet::new(
            1,
            vec![
                identity_event("i1", &["db"]),
                service_event("svc1"),
                policy_event("p1", PolicyType::Dial),
                membership("p1", RelatedEntityType::Identity, &["i1"], true),
                membership("p1", RelatedEntityType::Service, &["svc1"], true),
            ],
        ))
        .unwrap();
        rdm
    }

    #[test]
    fn membership_deltas_build_access() {
        let rdm = seeded_rdm();
        let access = rdm
            .get_service_access_policies("i1", "svc1", PolicyType::Dial)
            .unwrap();
        assert_eq!(access.policies.len(), 1);
        assert_eq!(access.policies[0].id, "p1");
    }

    #[test]
    fn access_filters_by_policy_type() {
        let rdm = seeded_rdm();
        let access = rdm
            .get_service_access_policies("i1", "svc1", PolicyType::Bind)
            .unwrap();
        assert!(access.policies.is_empty());
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let rdm = seeded_rdm();
        assert!(rdm
            .get_service_access_policies("nope", "svc1", PolicyType::Dial)
            .is_err());
        assert!(rdm
            .get_service_access_policies("i1", "nope", PolicyType::Dial)
            .is_err());
    }

    #[test]
    fn missing_posture_check_resolves_to_none() {
        let rdm = seeded_rdm();
        rdm.apply_change_set(&ChangeSet::new(
            2,
            vec![membership(
                "p1",
                RelatedEntityType::PostureCheck,
                &["pc-missing"],
                true,
            )],
        ))
        .unwrap();
        let access = rdm
            .get_service_access_policies("i1", "svc1", PolicyType::Dial)
            .unwrap();
        assert_eq!(access.posture_checks.len(), 1);
        assert!(access.posture_checks["pc-missing"].is_none());
    }

    #[test]
    fn membership_delete_tolerates_missing_preimage() {
        let rdm = seeded_rdm();
        // Remove a membership that never existed; must not panic or error.
        rdm.apply_change_set(&ChangeSet::new(
            2,
            vec![membership(
                "p-unknown",
                RelatedEntityType::Service,
                &["svc9"],
                false,
            )],
        ))
        .unwrap();
    }

    #[test]
    fn replay_from_empty_yields_equal_model() {
        let rdm = seeded_rdm();
        rdm.apply_change_set(&ChangeSet::new(2, vec![identity_event("i2", &["web"])]))
            .unwrap();

        let full = rdm.get_data_state();
        let other = Rdm::new_receiver(4);
        other.apply_change_set(&full).unwrap();

        assert_eq!(other.current_index(), rdm.current_index());
        assert_eq!(other.identities.len(), rdm.identities.len());
        assert_eq!(other.services.len(), rdm.services.len());
        let orig = rdm.identities.get("i1").unwrap();
        let copy = other.identities.get("i1").unwrap();
        assert_eq!(orig.identity, copy.identity);
        assert_eq!(orig.service_policies, copy.service_policies);
    }

    #[test]
    fn entity_index_stamps_track_application() {
        let rdm = seeded_rdm();
        assert_eq!(rdm.identities.get("i1").unwrap().identity_index, 1);
        rdm.apply_change_set(&ChangeSet::new(2, vec![identity_event("i1", &["db", "ops"])]))
            .unwrap();
        let state = rdm.identities.get("i1").unwrap();
        assert_eq!(state.identity_index, 2);
        // Membership set survives the identity update.
        assert!(state.service_policies.contains("p1"));
    }

    #[test]
    fn listener_receives_applied_change_sets() {
        let rdm = Rdm::new_sender(10, 4);
        let mut rx = rdm.new_listener();
        rdm.apply_change_set(&ChangeSet::new(1, vec![service_event("svc1")]))
            .unwrap();
        let received = rx.try_recv().unwrap();
        assert_eq!(received.index, 1);

        // A stale change-set is not published.
        rdm.apply_change_set(&ChangeSet::new(1, vec![service_event("svc2")]))
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
