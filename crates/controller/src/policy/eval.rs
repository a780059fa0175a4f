//! Incremental policy evaluation.
//!
//! Every role-attribute or selector change recomputes membership for the
//! affected (policy, entity) pairs. A membership transition first updates
//! the policy→entity link table, then walks the entities on the other
//! side of the policy adjusting the ref-counted denorm tables; 0↔1 count
//! transitions emit access events.

use trellis_domain::model::{PolicyType, ServicePolicy};
use trellis_domain::roles::{self, RoleSet, Semantic};
use trellis_domain::{Error, Result};
use trellis_protocol::data_state::{RelatedEntityType, ServicePolicyChange};

use crate::store::links::RefCountedLinkCollection;
use crate::store::{LinkCollection, Stores, Tx};

use super::{PolicyOutcome, ServiceEvent, ServiceEventType};

/// Which selector side of the policy an entity sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Identity,
    Service,
    PostureCheck,
}

impl Side {
    fn link_collection<'a>(&self, stores: &'a Stores) -> &'a LinkCollection {
        match self {
            Side::Identity => &stores.policy_identities,
            Side::Service => &stores.policy_services,
            Side::PostureCheck => &stores.policy_posture_checks,
        }
    }

    fn related_entity_type(&self) -> RelatedEntityType {
        match self {
            Side::Identity => RelatedEntityType::Identity,
            Side::Service => RelatedEntityType::Service,
            Side::PostureCheck => RelatedEntityType::PostureCheck,
        }
    }
}

fn identity_denorm<'a>(stores: &'a Stores, policy_type: PolicyType) -> &'a RefCountedLinkCollection {
    match policy_type {
        PolicyType::Dial => &stores.identity_dial_services,
        PolicyType::Bind => &stores.identity_bind_services,
    }
}

fn posture_denorm<'a>(stores: &'a Stores, policy_type: PolicyType) -> &'a RefCountedLinkCollection {
    match policy_type {
        PolicyType::Dial => &stores.posture_dial_services,
        PolicyType::Bind => &stores.posture_bind_services,
    }
}

fn access_event(policy_type: PolicyType, gained: bool) -> ServiceEventType {
    match (policy_type, gained) {
        (PolicyType::Dial, true) => ServiceEventType::DialAccessGained,
        (PolicyType::Dial, false) => ServiceEventType::DialAccessLost,
        (PolicyType::Bind, true) => ServiceEventType::BindAccessGained,
        (PolicyType::Bind, false) => ServiceEventType::BindAccessLost,
    }
}

fn selector(policy: &ServicePolicy, side: Side) -> Result<RoleSet> {
    let tokens = match side {
        Side::Identity => &policy.identity_roles,
        Side::Service => &policy.service_roles,
        Side::PostureCheck => &policy.posture_check_roles,
    };
    roles::split_roles_and_ids(tokens)
}

/// Id literals referenced by a policy's selectors must exist; attribute
/// tokens may match zero entities.
pub fn validate_policy_refs(stores: &Stores, tx: &Tx, policy: &ServicePolicy) -> Result<()> {
    for side in [Side::Identity, Side::Service, Side::PostureCheck] {
        let set = selector(policy, side)?;
        let missing: Vec<String> = set
            .ids
            .iter()
            .filter(|id| {
                let exists = match side {
                    Side::Identity => stores.identities.exists(tx, id),
                    Side::Service => stores.services.exists(tx, id),
                    Side::PostureCheck => stores.posture_checks.exists(tx, id),
                };
                !exists
            })
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Error::FieldError {
                field: format!("{side:?}Roles"),
                reason: format!("no entities found with ids {missing:?}"),
            });
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Evaluate one (policy, entity) pair and apply the membership
/// transition if it changed.
fn evaluate_pair(
    stores: &Stores,
    tx: &mut Tx,
    policy: &ServicePolicy,
    side: Side,
    set: &RoleSet,
    semantic: Semantic,
    entity_id: &str,
    attributes: &[String],
    out: &mut PolicyOutcome,
) -> Result<()> {
    if roles::matches(set, semantic, entity_id, attributes) {
        process_matched(stores, tx, policy, side, entity_id, out)
    } else {
        process_unmatched(stores, tx, policy, side, entity_id, out)
    }
}

fn process_matched(
    stores: &Stores,
    tx: &mut Tx,
    policy: &ServicePolicy,
    side: Side,
    entity_id: &str,
    out: &mut PolicyOutcome,
) -> Result<()> {
    if !side.link_collection(stores).add_link(tx, &policy.id, entity_id)? {
        return Ok(());
    }
    out.policy_changes.push(ServicePolicyChange {
        policy_id: policy.id.clone(),
        related_entity_type: side.related_entity_type(),
        related_entity_ids: vec![entity_id.to_string()],
        add: true,
    });
    update_denorm(stores, tx, policy, side, entity_id, true, out)
}

fn process_unmatched(
    stores: &Stores,
    tx: &mut Tx,
    policy: &ServicePolicy,
    side: Side,
    entity_id: &str,
    out: &mut PolicyOutcome,
) -> Result<()> {
    if !side.link_collection(stores).remove_link(tx, &policy.id, entity_id)? {
        return Ok(());
    }
    out.policy_changes.push(ServicePolicyChange {
        policy_id: policy.id.clone(),
        related_entity_type: side.related_entity_type(),
        related_entity_ids: vec![entity_id.to_string()],
        add: false,
    });
    update_denorm(stores, tx, policy, side, entity_id, false, out)
}

/// Walk the other side(s) of the policy adjusting ref counts; emit
/// events on 0↔1 transitions.
fn update_denorm(
    stores: &Stores,
    tx: &mut Tx,
    policy: &ServicePolicy,
    side: Side,
    entity_id: &str,
    add: bool,
    out: &mut PolicyOutcome,
) -> Result<()> {
    let identity_table = identity_denorm(stores, policy.policy_type);
    let posture_table = posture_denorm(stores, policy.policy_type);

    let bump = |tx: &mut Tx,
                table: &RefCountedLinkCollection,
                a: &str,
                b: &str|
     -> Result<(u32, u32)> {
        if add {
            table.increment_link_count(tx, a, b)
        } else {
            table.decrement_link_count(tx, a, b)
        }
    };
    let transitioned = |old: u32, new: u32| (add && old == 0 && new == 1) || (!add && old == 1 && new == 0);

    match side {
        Side::Identity => {
            for service_id in stores.policy_services.iterate_links(tx, &policy.id) {
                let (old, new) = bump(tx, identity_table, entity_id, &service_id)?;
                if transitioned(old, new) {
                    out.service_events.push(ServiceEvent {
                        event_type: access_event(policy.policy_type, add),
                        identity_id: entity_id.to_string(),
                        service_id,
                    });
                }
            }
        }
        Side::Service => {
            for identity_id in stores.policy_identities.iterate_links(tx, &policy.id) {
                let (old, new) = bump(tx, identity_table, &identity_id, entity_id)?;
                if transitioned(old, new) {
                    out.service_events.push(ServiceEvent {
                        event_type: access_event(policy.policy_type, add),
                        identity_id,
                        service_id: entity_id.to_string(),
                    });
                }
            }
            for check_id in stores.policy_posture_checks.iterate_links(tx, &policy.id) {
                let (old, new) = bump(tx, posture_table, &check_id, entity_id)?;
                if transitioned(old, new) {
                    service_updated_events(stores, tx, entity_id, out);
                }
            }
        }
        Side::PostureCheck => {
            for service_id in stores.policy_services.iterate_links(tx, &policy.id) {
                let (old, new) = bump(tx, posture_table, entity_id, &service_id)?;
                if transitioned(old, new) {
                    service_updated_events(stores, tx, &service_id, out);
                }
            }
        }
    }
    Ok(())
}

/// The posture gate of a service changed: every identity with access to
/// it sees a service-updated event.
fn service_updated_events(stores: &Stores, tx: &Tx, service_id: &str, out: &mut PolicyOutcome) {
    let mut identity_ids: Vec<String> = stores
        .identity_dial_services
        .iterate_reverse(tx, service_id);
    identity_ids.extend(stores.identity_bind_services.iterate_reverse(tx, service_id));
    identity_ids.sort();
    identity_ids.dedup();
    for identity_id in identity_ids {
        out.service_events.push(ServiceEvent {
            event_type: ServiceEventType::Updated,
            identity_id,
            service_id: service_id.to_string(),
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry points
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Evaluate a created or updated policy against every entity of every
/// side.
pub fn policy_updated(
    stores: &Stores,
    tx: &mut Tx,
    policy: &ServicePolicy,
    out: &mut PolicyOutcome,
) -> Result<()> {
    validate_policy_refs(stores, tx, policy)?;
    let semantic = policy.semantic;

    let identity_set = selector(policy, Side::Identity)?;
    for id in stores.identities.ids(tx) {
        let attrs = stores
            .identities
            .get(tx, &id)
            .map(|e| e.role_attributes)
            .unwrap_or_default();
        evaluate_pair(stores, tx, policy, Side::Identity, &identity_set, semantic, &id, &attrs, out)?;
    }

    let service_set = selector(policy, Side::Service)?;
    for id in stores.services.ids(tx) {
        let attrs = stores
            .services
            .get(tx, &id)
            .map(|e| e.role_attributes)
            .unwrap_or_default();
        evaluate_pair(stores, tx, policy, Side::Service, &service_set, semantic, &id, &attrs, out)?;
    }

    let posture_set = selector(policy, Side::PostureCheck)?;
    for id in stores.posture_checks.ids(tx) {
        let attrs = stores
            .posture_checks
            .get(tx, &id)
            .map(|e| e.role_attributes)
            .unwrap_or_default();
        evaluate_pair(stores, tx, policy, Side::PostureCheck, &posture_set, semantic, &id, &attrs, out)?;
    }
    Ok(())
}

/// Unlink every entity from a policy being deleted.
pub fn policy_deleted(
    stores: &Stores,
    tx: &mut Tx,
    policy: &ServicePolicy,
    out: &mut PolicyOutcome,
) -> Result<()> {
    for side in [Side::Identity, Side::Service, Side::PostureCheck] {
        let linked = side.link_collection(stores).iterate_links(tx, &policy.id);
        for entity_id in linked {
            process_unmatched(stores, tx, policy, side, &entity_id, out)?;
        }
    }
    Ok(())
}

/// Re-evaluate one entity against every policy after its role attributes
/// changed (or it was created).
pub fn entity_updated(
    stores: &Stores,
    tx: &mut Tx,
    side: Side,
    entity_id: &str,
    attributes: &[String],
    out: &mut PolicyOutcome,
) -> Result<()> {
    for policy_id in stores.service_policies.ids(tx) {
        let policy = stores.service_policies.require(tx, &policy_id)?;
        let set = selector(&policy, side)?;
        evaluate_pair(stores, tx, &policy, side, &set, policy.semantic, entity_id, attributes, out)?;
    }
    Ok(())
}

/// Unlink a deleted entity from every policy it matched.
pub fn entity_deleted(
    stores: &Stores,
    tx: &mut Tx,
    side: Side,
    entity_id: &str,
    out: &mut PolicyOutcome,
) -> Result<()> {
    for policy_id in side.link_collection(stores).iterate_reverse(tx, entity_id) {
        let policy = stores.service_policies.require(tx, &policy_id)?;
        process_unmatched(stores, tx, &policy, side, entity_id, out)?;
    }
    Ok(())
}
