//! Entity stores: the controller's persistent schema.
//!
//! Each entity type owns one bucket (`type → id → serialized entity`)
//! plus its indexes. Referential-integrity failures name the referrers
//! so API callers can report exactly what blocks a delete.

use serde::de::DeserializeOwned;
use serde::Serialize;

use trellis_domain::model::{
    AuthPolicy, Config, ConfigType, ExternalJwtSigner, Identity, PostureCheck, Router, Service,
    ServicePolicy, Terminator,
};
use trellis_domain::{Error, Result};

use super::index::{FkSetSymbol, NonUniqueIndex, NullableUniqueIndex, UniqueIndex};
use super::kv::Tx;
use super::links::{LinkCollection, RefCountedLinkCollection};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entity trait & generic store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub trait Entity: Serialize + DeserializeOwned + Clone {
    const TYPE: &'static str;
    fn id(&self) -> &str;
    /// Entities with a unique-name constraint return `Some`.
    fn unique_name(&self) -> Option<&str> {
        None
    }
}

macro_rules! entity {
    ($ty:ty, $type_name:literal) => {
        impl Entity for $ty {
            const TYPE: &'static str = $type_name;
            fn id(&self) -> &str {
                &self.id
            }
            fn unique_name(&self) -> Option<&str> {
                Some(&self.name)
            }
        }
    };
}

entity!(Identity, "identities");
entity!(Service, "services");
entity!(ServicePolicy, "service-policies");
entity!(PostureCheck, "posture-checks");
entity!(Router, "routers");
entity!(Config, "configs");
entity!(ConfigType, "config-types");
entity!(AuthPolicy, "auth-policies");
entity!(ExternalJwtSigner, "external-jwt-signers");

impl Entity for Terminator {
    const TYPE: &'static str = "terminators";
    fn id(&self) -> &str {
        &self.id
    }
}

/// CRUD over one entity bucket with an optional unique-name index.
pub struct EntityStore<T: Entity> {
    name_index: Option<UniqueIndex>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Entity> EntityStore<T> {
    fn new(with_name_index: bool) -> Self {
        Self {
            name_index: with_name_index.then(|| UniqueIndex::new(T::TYPE, "name")),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn get(&self, tx: &Tx, id: &str) -> Option<T> {
        tx.get(T::TYPE, id)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn require(&self, tx: &Tx, id: &str) -> Result<T> {
        self.get(tx, id).ok_or_else(|| Error::not_found(T::TYPE, id))
    }

    pub fn exists(&self, tx: &Tx, id: &str) -> bool {
        tx.get(T::TYPE, id).is_some()
    }

    pub fn ids(&self, tx: &Tx) -> Vec<String> {
        tx.keys(T::TYPE)
    }

    pub fn all(&self, tx: &Tx) -> Vec<T> {
        tx.keys(T::TYPE)
            .iter()
            .filter_map(|id| self.get(tx, id))
            .collect()
    }

    pub fn create(&self, tx: &mut Tx, entity: &T) -> Result<()> {
        if self.exists(tx, entity.id()) {
            return Err(Error::Conflict {
                entity_type: T::TYPE,
                field: "id",
                value: entity.id().to_string(),
            });
        }
        if let (Some(index), Some(name)) = (&self.name_index, entity.unique_name()) {
            index.insert(tx, name, entity.id())?;
        }
        tx.put(T::TYPE, entity.id(), serde_json::to_value(entity)?);
        Ok(())
    }

    /// Returns the pre-image.
    pub fn update(&self, tx: &mut Tx, entity: &T) -> Result<T> {
        let existing = self.require(tx, entity.id())?;
        if let Some(index) = &self.name_index {
            if let (Some(old), Some(new)) = (existing.unique_name(), entity.unique_name()) {
                index.update(tx, old, new, entity.id())?;
            }
        }
        tx.put(T::TYPE, entity.id(), serde_json::to_value(entity)?);
        Ok(existing)
    }

    /// Returns the deleted entity.
    pub fn delete(&self, tx: &mut Tx, id: &str) -> Result<T> {
        let existing = self.require(tx, id)?;
        if let (Some(index), Some(name)) = (&self.name_index, existing.unique_name()) {
            index.remove(tx, name);
        }
        tx.delete(T::TYPE, id);
        Ok(existing)
    }

    pub fn find_by_name(&self, tx: &Tx, name: &str) -> Option<T> {
        let index = self.name_index.as_ref()?;
        self.get(tx, &index.get(tx, name)?)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminators
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TerminatorStore {
    base: EntityStore<Terminator>,
    by_service: NonUniqueIndex,
    by_router: NonUniqueIndex,
}

impl TerminatorStore {
    fn new() -> Self {
        Self {
            base: EntityStore::new(false),
            by_service: NonUniqueIndex::new("terminators", "service"),
            by_router: NonUniqueIndex::new("terminators", "router"),
        }
    }

    pub fn get(&self, tx: &Tx, id: &str) -> Option<Terminator> {
        self.base.get(tx, id)
    }

    pub fn require(&self, tx: &Tx, id: &str) -> Result<Terminator> {
        self.base.require(tx, id)
    }

    pub fn all(&self, tx: &Tx) -> Vec<Terminator> {
        self.base.all(tx)
    }

    pub fn create(&self, tx: &mut Tx, terminator: &Terminator) -> Result<()> {
        if tx.get(Service::TYPE, &terminator.service_id).is_none() {
            return Err(Error::not_found("service", &terminator.service_id));
        }
        if tx.get(Router::TYPE, &terminator.router_id).is_none() {
            return Err(Error::not_found("router", &terminator.router_id));
        }
        self.base.create(tx, terminator)?;
        self.by_service.insert(tx, &terminator.service_id, &terminator.id);
        self.by_router.insert(tx, &terminator.router_id, &terminator.id);
        Ok(())
    }

    pub fn update(&self, tx: &mut Tx, terminator: &Terminator) -> Result<()> {
        let old = self.base.update(tx, terminator)?;
        if old.service_id != terminator.service_id {
            return Err(Error::FieldError {
                field: "service_id".into(),
                reason: "terminator cannot move between services".into(),
            });
        }
        if old.router_id != terminator.router_id {
            self.by_router.remove(tx, &old.router_id, &terminator.id);
            self.by_router.insert(tx, &terminator.router_id, &terminator.id);
        }
        Ok(())
    }

    pub fn delete(&self, tx: &mut Tx, id: &str) -> Result<Terminator> {
        let existing = self.base.delete(tx, id)?;
        self.by_service.remove(tx, &existing.service_id, id);
        self.by_router.remove(tx, &existing.router_id, id);
        Ok(existing)
    }

    pub fn for_service(&self, tx: &Tx, service_id: &str) -> Vec<Terminator> {
        self.by_service
            .get(tx, service_id)
            .iter()
            .filter_map(|id| self.get(tx, id))
            .collect()
    }

    pub fn for_router(&self, tx: &Tx, router_id: &str) -> Vec<Terminator> {
        self.by_router
            .get(tx, router_id)
            .iter()
            .filter_map(|id| self.get(tx, id))
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Router store with a nullable-unique index over the enrolled
/// certificate fingerprint: un-enrolled routers have none, enrolled
/// fingerprints may not collide.
pub struct RouterStore {
    base: EntityStore<Router>,
    by_fingerprint: NullableUniqueIndex,
}

impl RouterStore {
    fn new() -> Self {
        Self {
            base: EntityStore::new(true),
            by_fingerprint: NullableUniqueIndex::new("routers", "fingerprint"),
        }
    }

    pub fn get(&self, tx: &Tx, id: &str) -> Option<Router> {
        self.base.get(tx, id)
    }

    pub fn require(&self, tx: &Tx, id: &str) -> Result<Router> {
        self.base.require(tx, id)
    }

    pub fn exists(&self, tx: &Tx, id: &str) -> bool {
        self.base.exists(tx, id)
    }

    pub fn all(&self, tx: &Tx) -> Vec<Router> {
        self.base.all(tx)
    }

    pub fn find_by_fingerprint(&self, tx: &Tx, fingerprint: &str) -> Option<Router> {
        self.base.get(tx, &self.by_fingerprint.get(tx, fingerprint)?)
    }

    pub fn create(&self, tx: &mut Tx, router: &Router) -> Result<()> {
        self.base.create(tx, router)?;
        self.by_fingerprint
            .insert(tx, router.fingerprint.as_deref(), &router.id)
    }

    pub fn update(&self, tx: &mut Tx, router: &Router) -> Result<()> {
        let old = self.base.update(tx, router)?;
        self.by_fingerprint.update(
            tx,
            old.fingerprint.as_deref(),
            router.fingerprint.as_deref(),
            &router.id,
        )
    }

    pub fn delete(&self, tx: &mut Tx, id: &str) -> Result<Router> {
        let existing = self.base.delete(tx, id)?;
        self.by_fingerprint.remove(tx, existing.fingerprint.as_deref());
        Ok(existing)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stores
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The full schema: entity stores, the policy link tables, and the
/// ref-counted denormalization tables.
pub struct Stores {
    pub identities: EntityStore<Identity>,
    pub services: EntityStore<Service>,
    pub service_policies: EntityStore<ServicePolicy>,
    pub posture_checks: EntityStore<PostureCheck>,
    pub routers: RouterStore,
    pub configs: EntityStore<Config>,
    pub config_types: EntityStore<ConfigType>,
    pub auth_policies: EntityStore<AuthPolicy>,
    pub ext_jwt_signers: EntityStore<ExternalJwtSigner>,
    pub terminators: TerminatorStore,
    /// Signers each auth policy allows for primary auth; referential
    /// integrity on signer delete.
    auth_policy_signers: FkSetSymbol,

    /// policy → matched entities, one collection per selector side.
    pub policy_identities: LinkCollection,
    pub policy_services: LinkCollection,
    pub policy_posture_checks: LinkCollection,

    /// Denormalized access tables. The count is the number of policies
    /// currently linking the pair; 0↔1 transitions publish events.
    pub identity_dial_services: RefCountedLinkCollection,
    pub identity_bind_services: RefCountedLinkCollection,
    pub posture_dial_services: RefCountedLinkCollection,
    pub posture_bind_services: RefCountedLinkCollection,
}

impl Default for Stores {
    fn default() -> Self {
        Self::new()
    }
}

impl Stores {
    pub fn new() -> Self {
        Self {
            identities: EntityStore::new(true),
            services: EntityStore::new(true),
            service_policies: EntityStore::new(true),
            posture_checks: EntityStore::new(true),
            routers: RouterStore::new(),
            configs: EntityStore::new(true),
            config_types: EntityStore::new(true),
            auth_policies: EntityStore::new(true),
            ext_jwt_signers: EntityStore::new(true),
            terminators: TerminatorStore::new(),
            auth_policy_signers: FkSetSymbol::new(
                "auth-policies",
                "primary_ext_jwt_allowed_signers",
                "external-jwt-signers",
                "external-jwt-signer",
            ),
            policy_identities: LinkCollection::new("policy-identities"),
            policy_services: LinkCollection::new("policy-services"),
            policy_posture_checks: LinkCollection::new("policy-posture-checks"),
            identity_dial_services: RefCountedLinkCollection::new("identity-dial-services"),
            identity_bind_services: RefCountedLinkCollection::new("identity-bind-services"),
            posture_dial_services: RefCountedLinkCollection::new("posture-dial-services"),
            posture_bind_services: RefCountedLinkCollection::new("posture-bind-services"),
        }
    }

    /// Create a config after checking its type reference.
    pub fn create_config(&self, tx: &mut Tx, config: &Config) -> Result<()> {
        if !self.config_types.exists(tx, &config.type_id) {
            return Err(Error::not_found("config-type", &config.type_id));
        }
        self.configs.create(tx, config)
    }

    /// Delete a config, failing when it is still attached to a service
    /// or to an identity's per-service overrides. The error names the
    /// referring (identity, service) pairs.
    pub fn delete_config(&self, tx: &mut Tx, id: &str) -> Result<Config> {
        let mut referrers = Vec::new();
        for service in self.services.all(tx) {
            if service.configs.iter().any(|c| c == id) {
                referrers.push(format!("service:{}", service.id));
            }
        }
        for identity in self.identities.all(tx) {
            for (service_id, configs) in &identity.service_configs {
                if configs.iter().any(|c| c == id) {
                    referrers.push(format!("{}:{}", identity.id, service_id));
                }
            }
        }
        if !referrers.is_empty() {
            return Err(Error::ReferencedByIds {
                entity_type: "config",
                id: id.to_string(),
                referencing_type: "identity-service",
                referencing_ids: referrers,
            });
        }
        self.configs.delete(tx, id)
    }

    /// Delete a config type, failing when configs still reference it.
    pub fn delete_config_type(&self, tx: &mut Tx, id: &str) -> Result<ConfigType> {
        let referrers: Vec<String> = self
            .configs
            .all(tx)
            .into_iter()
            .filter(|c| c.type_id == id)
            .map(|c| c.id)
            .collect();
        if !referrers.is_empty() {
            return Err(Error::ReferencedByIds {
                entity_type: "config-type",
                id: id.to_string(),
                referencing_type: "config",
                referencing_ids: referrers,
            });
        }
        self.config_types.delete(tx, id)
    }

    /// Create or update an auth policy. The signer fk-set checks each
    /// referenced signer exists and records the reverse pointers.
    pub fn put_auth_policy(&self, tx: &mut Tx, policy: &AuthPolicy, create: bool) -> Result<()> {
        if create {
            self.auth_policies.create(tx, policy)?;
        } else {
            let old = self.auth_policies.update(tx, policy)?;
            self.auth_policy_signers
                .unlink_all(tx, &old.id, &old.primary_ext_jwt_allowed_signers);
        }
        self.auth_policy_signers
            .link_all(tx, &policy.id, &policy.primary_ext_jwt_allowed_signers)
    }

    pub fn delete_auth_policy(&self, tx: &mut Tx, id: &str) -> Result<AuthPolicy> {
        let existing = self.auth_policies.delete(tx, id)?;
        self.auth_policy_signers
            .unlink_all(tx, id, &existing.primary_ext_jwt_allowed_signers);
        Ok(existing)
    }

    /// Delete an external JWT signer, failing when an auth policy still
    /// allows it for primary authentication.
    pub fn delete_ext_jwt_signer(&self, tx: &mut Tx, id: &str) -> Result<ExternalJwtSigner> {
        let referrers = self.auth_policy_signers.referrers(tx, id);
        if !referrers.is_empty() {
            return Err(Error::ReferencedByIds {
                entity_type: "external-jwt-signer",
                id: id.to_string(),
                referencing_type: "auth-policy",
                referencing_ids: referrers,
            });
        }
        self.ext_jwt_signers.delete(tx, id)
    }

    /// Delete a service and cascade to its terminators. Returns the
    /// deleted service and terminator ids.
    pub fn delete_service(&self, tx: &mut Tx, id: &str) -> Result<(Service, Vec<String>)> {
        let terminators = self.terminators.for_service(tx, id);
        for terminator in &terminators {
            self.terminators.delete(tx, &terminator.id)?;
        }
        let service = self.services.delete(tx, id)?;
        Ok((service, terminators.into_iter().map(|t| t.id).collect()))
    }
}
