//! Typed command envelope and the deterministic apply pipeline.
//!
//! Every mutation of the controller model is a serializable command.
//! `ControllerModel::apply` runs the command inside one storage
//! transaction (entity mutation plus policy evaluation), then publishes
//! the resulting change-set into the RDM delta stream and dispatches
//! service events — both from the transaction's commit hook, so nothing
//! escapes a rolled-back command. Applying the same log in the same
//! order on every controller yields identical state.

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use trellis_domain::model::{
    AuthPolicy, Config, ConfigType, ExternalJwtSigner, Identity, PostureCheck, PublicKey,
    Revocation, Router, Service, ServicePolicy, Terminator,
};
use trellis_domain::{roles, Error, Result};
use trellis_protocol::data_state::{ChangeSet, ModelEntity, ModelEvent};
use trellis_rdm::Rdm;

use crate::circuit::CircuitEngine;
use crate::events::{Event, EventDispatcher};
use crate::fabric::RouterRegistry;
use crate::policy::eval::{self, Side};
use crate::policy::PolicyOutcome;
use crate::store::{Db, Stores, Tx};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Command envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    CreateIdentity(Identity),
    UpdateIdentity(Identity),
    DeleteIdentity { id: String },

    CreateService(Service),
    UpdateService(Service),
    DeleteService { id: String },

    CreateServicePolicy(ServicePolicy),
    UpdateServicePolicy(ServicePolicy),
    DeleteServicePolicy { id: String },

    CreatePostureCheck(PostureCheck),
    UpdatePostureCheck(PostureCheck),
    DeletePostureCheck { id: String },

    CreateConfigType(ConfigType),
    DeleteConfigType { id: String },
    CreateConfig(Config),
    DeleteConfig { id: String },

    CreateRouter(Router),
    UpdateRouter(Router),
    DeleteRouter { id: String },

    CreateTerminator(Terminator),
    UpdateTerminator(Terminator),
    DeleteTerminator { id: String },

    CreateAuthPolicy(AuthPolicy),
    UpdateAuthPolicy(AuthPolicy),
    DeleteAuthPolicy { id: String },

    CreateExtJwtSigner(ExternalJwtSigner),
    DeleteExtJwtSigner { id: String },

    UpsertPublicKey(PublicKey),
    DeletePublicKey { kid: String },
    UpsertRevocation(Revocation),

    /// Install a full storage snapshot (cluster init / migration).
    SyncSnapshot {
        snapshot_id: String,
        gz_store: Vec<u8>,
    },
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Gzip a storage image for a `SyncSnapshot` command.
pub fn gz_compress(raw: &[u8]) -> Result<Vec<u8>> {
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(raw)?;
    Ok(gz.finish()?)
}

pub fn gz_decompress(raw: &[u8]) -> Result<Vec<u8>> {
    let mut gz = GzDecoder::new(raw);
    let mut out = Vec::new();
    gz.read_to_end(&mut out)?;
    Ok(out)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ControllerModel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The shared apply state every dispatcher variant drives.
pub struct ControllerModel {
    pub db: Db,
    pub stores: Arc<Stores>,
    pub rdm: Arc<Rdm>,
    pub events: Arc<EventDispatcher>,
    pub registry: Arc<RouterRegistry>,
    /// Set once the circuit engine exists; entity deletions cascade to
    /// open circuits through it.
    engine: RwLock<Option<Arc<CircuitEngine>>>,
    snapshot_id: Mutex<Option<String>>,
    last_snapshot: Mutex<Option<std::time::Instant>>,
    /// Serializes command application so commit hooks (and therefore
    /// the change-set stream) observe strict log order.
    apply_lock: Mutex<()>,
}

impl ControllerModel {
    pub fn new(
        db: Db,
        stores: Arc<Stores>,
        rdm: Arc<Rdm>,
        events: Arc<EventDispatcher>,
        registry: Arc<RouterRegistry>,
    ) -> Self {
        Self {
            db,
            stores,
            rdm,
            events,
            registry,
            engine: RwLock::new(None),
            snapshot_id: Mutex::new(None),
            last_snapshot: Mutex::new(None),
            apply_lock: Mutex::new(()),
        }
    }

    /// Export the storage image for snapshotting, at most once per
    /// minute.
    pub fn snapshot_store(&self) -> Result<Vec<u8>> {
        let mut last = self.last_snapshot.lock();
        if let Some(at) = *last {
            if at.elapsed() < std::time::Duration::from_secs(60) {
                return Err(Error::Overloaded(
                    "may snapshot the store at most once per minute".into(),
                ));
            }
        }
        let image = self.db.export()?;
        *last = Some(std::time::Instant::now());
        Ok(image)
    }

    pub fn attach_engine(&self, engine: Arc<CircuitEngine>) {
        *self.engine.write() = Some(engine);
    }

    fn engine(&self) -> Option<Arc<CircuitEngine>> {
        self.engine.read().clone()
    }

    /// Deterministically apply one committed command at its log index.
    ///
    /// A command that fails (validation, conflict, integrity) mutates
    /// nothing, but its index is still consumed with an empty
    /// change-set: every replica fails it the same way, and the stream
    /// stays contiguous.
    pub fn apply(&self, index: u64, command: &Command) -> Result<()> {
        let _ordered = self.apply_lock.lock();

        if let Command::SyncSnapshot {
            snapshot_id,
            gz_store,
        } = command
        {
            return self.apply_snapshot(index, snapshot_id, gz_store);
        }

        let result = self.apply_entity_command(index, command);
        if result.is_err() {
            if let Err(err) = self.rdm.apply_change_set(&ChangeSet::new(index, Vec::new())) {
                tracing::error!(index, error = %err, "could not consume index for failed command");
            }
        }
        result
    }

    fn apply_entity_command(&self, index: u64, command: &Command) -> Result<()> {
        let stores = self.stores.clone();
        let mut model_events: Vec<ModelEvent> = Vec::new();
        let mut outcome = PolicyOutcome::default();

        self.db.update(|tx| {
            self.apply_in_tx(tx, &stores, command, &mut model_events, &mut outcome)?;

            // Publication point: the commit.
            let rdm = self.rdm.clone();
            let events = self.events.clone();
            let mut all_events = model_events.clone();
            all_events.extend(
                outcome
                    .policy_changes
                    .iter()
                    .cloned()
                    .map(|change| ModelEvent::update(ModelEntity::ServicePolicyChange(change))),
            );
            let service_events = outcome.service_events.clone();
            tx.on_commit(move || {
                // Every index yields a change-set, even an empty one, so
                // the replica stream stays contiguous.
                if let Err(err) = rdm.apply_change_set(&ChangeSet::new(index, all_events)) {
                    tracing::error!(index, error = %err, "could not apply change-set to data model");
                }
                for event in service_events {
                    events.dispatch(Event::Service(event));
                }
            });
            Ok(())
        })?;

        self.post_commit(command);
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn apply_in_tx(
        &self,
        tx: &mut Tx,
        stores: &Stores,
        command: &Command,
        model_events: &mut Vec<ModelEvent>,
        outcome: &mut PolicyOutcome,
    ) -> Result<()> {
        match command {
            Command::CreateIdentity(identity) => {
                roles::validate_role_attributes(&identity.role_attributes)?;
                stores.identities.create(tx, identity)?;
                eval::entity_updated(
                    stores,
                    tx,
                    Side::Identity,
                    &identity.id,
                    &identity.role_attributes,
                    outcome,
                )?;
                model_events.push(ModelEvent::create(ModelEntity::Identity(identity.clone())));
            }
            Command::UpdateIdentity(identity) => {
                roles::validate_role_attributes(&identity.role_attributes)?;
                stores.identities.update(tx, identity)?;
                eval::entity_updated(
                    stores,
                    tx,
                    Side::Identity,
                    &identity.id,
                    &identity.role_attributes,
                    outcome,
                )?;
                model_events.push(ModelEvent::update(ModelEntity::Identity(identity.clone())));
            }
            Command::DeleteIdentity { id } => {
                let identity = stores.identities.delete(tx, id)?;
                eval::entity_deleted(stores, tx, Side::Identity, id, outcome)?;
                model_events.push(ModelEvent::delete(ModelEntity::Identity(identity)));
            }

            Command::CreateService(service) => {
                roles::validate_role_attributes(&service.role_attributes)?;
                stores.services.create(tx, service)?;
                eval::entity_updated(
                    stores,
                    tx,
                    Side::Service,
                    &service.id,
                    &service.role_attributes,
                    outcome,
                )?;
                model_events.push(ModelEvent::create(ModelEntity::Service(service.clone())));
            }
            Command::UpdateService(service) => {
                roles::validate_role_attributes(&service.role_attributes)?;
                stores.services.update(tx, service)?;
                eval::entity_updated(
                    stores,
                    tx,
                    Side::Service,
                    &service.id,
                    &service.role_attributes,
                    outcome,
                )?;
                model_events.push(ModelEvent::update(ModelEntity::Service(service.clone())));
            }
            Command::DeleteService { id } => {
                eval::entity_deleted(stores, tx, Side::Service, id, outcome)?;
                let (service, _terminators) = stores.delete_service(tx, id)?;
                model_events.push(ModelEvent::delete(ModelEntity::Service(service)));
            }

            Command::CreateServicePolicy(policy) => {
                stores.service_policies.create(tx, policy)?;
                eval::policy_updated(stores, tx, policy, outcome)?;
                model_events.push(ModelEvent::create(ModelEntity::ServicePolicy(
                    policy.clone(),
                )));
            }
            Command::UpdateServicePolicy(policy) => {
                let old = stores.service_policies.update(tx, policy)?;
                if old.policy_type != policy.policy_type {
                    return Err(Error::FieldError {
                        field: "policyType".into(),
                        reason: "a service policy cannot change type".into(),
                    });
                }
                eval::policy_updated(stores, tx, policy, outcome)?;
                model_events.push(ModelEvent::update(ModelEntity::ServicePolicy(
                    policy.clone(),
                )));
            }
            Command::DeleteServicePolicy { id } => {
                let policy = stores.service_policies.delete(tx, id)?;
                eval::policy_deleted(stores, tx, &policy, outcome)?;
                model_events.push(ModelEvent::delete(ModelEntity::ServicePolicy(policy)));
            }

            Command::CreatePostureCheck(check) => {
                roles::validate_role_attributes(&check.role_attributes)?;
                stores.posture_checks.create(tx, check)?;
                eval::entity_updated(
                    stores,
                    tx,
                    Side::PostureCheck,
                    &check.id,
                    &check.role_attributes,
                    outcome,
                )?;
                model_events.push(ModelEvent::create(ModelEntity::PostureCheck(check.clone())));
            }
            Command::UpdatePostureCheck(check) => {
                roles::validate_role_attributes(&check.role_attributes)?;
                stores.posture_checks.update(tx, check)?;
                eval::entity_updated(
                    stores,
                    tx,
                    Side::PostureCheck,
                    &check.id,
                    &check.role_attributes,
                    outcome,
                )?;
                model_events.push(ModelEvent::update(ModelEntity::PostureCheck(check.clone())));
            }
            Command::DeletePostureCheck { id } => {
                let check = stores.posture_checks.delete(tx, id)?;
                eval::entity_deleted(stores, tx, Side::PostureCheck, id, outcome)?;
                model_events.push(ModelEvent::delete(ModelEntity::PostureCheck(check)));
            }

            Command::CreateConfigType(config_type) => {
                stores.config_types.create(tx, config_type)?;
                model_events.push(ModelEvent::create(ModelEntity::ConfigType(
                    config_type.clone(),
                )));
            }
            Command::DeleteConfigType { id } => {
                let config_type = stores.delete_config_type(tx, id)?;
                model_events.push(ModelEvent::delete(ModelEntity::ConfigType(config_type)));
            }
            Command::CreateConfig(config) => {
                stores.create_config(tx, config)?;
                model_events.push(ModelEvent::create(ModelEntity::Config(config.clone())));
            }
            Command::DeleteConfig { id } => {
                let config = stores.delete_config(tx, id)?;
                model_events.push(ModelEvent::delete(ModelEntity::Config(config)));
            }

            Command::CreateRouter(router) => {
                stores.routers.create(tx, router)?;
            }
            Command::UpdateRouter(router) => {
                stores.routers.update(tx, router)?;
            }
            Command::DeleteRouter { id } => {
                let referrers = stores.terminators.for_router(tx, id);
                for terminator in referrers {
                    stores.terminators.delete(tx, &terminator.id)?;
                }
                stores.routers.delete(tx, id)?;
            }

            Command::CreateTerminator(terminator) => {
                stores.terminators.create(tx, terminator)?;
            }
            Command::UpdateTerminator(terminator) => {
                stores.terminators.update(tx, terminator)?;
            }
            Command::DeleteTerminator { id } => {
                stores.terminators.delete(tx, id)?;
            }

            Command::CreateAuthPolicy(policy) => {
                stores.put_auth_policy(tx, policy, true)?;
            }
            Command::UpdateAuthPolicy(policy) => {
                stores.put_auth_policy(tx, policy, false)?;
            }
            Command::DeleteAuthPolicy { id } => {
                stores.delete_auth_policy(tx, id)?;
            }

            Command::CreateExtJwtSigner(signer) => {
                stores.ext_jwt_signers.create(tx, signer)?;
            }
            Command::DeleteExtJwtSigner { id } => {
                stores.delete_ext_jwt_signer(tx, id)?;
            }

            Command::UpsertPublicKey(key) => {
                model_events.push(ModelEvent::update(ModelEntity::PublicKey(key.clone())));
            }
            Command::DeletePublicKey { kid } => {
                model_events.push(ModelEvent::delete(ModelEntity::PublicKey(PublicKey {
                    kid: kid.clone(),
                    ..Default::default()
                })));
            }
            Command::UpsertRevocation(revocation) => {
                model_events.push(ModelEvent::update(ModelEntity::Revocation(
                    revocation.clone(),
                )));
            }

            Command::SyncSnapshot { .. } => unreachable!("handled in apply"),
        }
        Ok(())
    }

    /// Runtime cascades that need the fabric or the circuit engine.
    fn post_commit(&self, command: &Command) {
        match command {
            Command::CreateRouter(router) | Command::UpdateRouter(router) => {
                self.registry.put(router.clone());
            }
            Command::DeleteRouter { id } => {
                self.registry.remove(id);
                if let Some(engine) = self.engine() {
                    let id = id.clone();
                    spawn_or_block(async move { engine.handle_router_offline(&id).await });
                }
            }
            Command::DeleteIdentity { id } => {
                if let Some(engine) = self.engine() {
                    let id = id.clone();
                    spawn_or_block(async move {
                        for circuit in engine.all() {
                            if circuit.client_token == id {
                                let _ = engine.remove_circuit(&circuit.id, true).await;
                            }
                        }
                    });
                }
            }
            _ => {}
        }
    }

    fn apply_snapshot(&self, index: u64, snapshot_id: &str, gz_store: &[u8]) -> Result<()> {
        {
            let current = self.snapshot_id.lock();
            if current.as_deref() == Some(snapshot_id) {
                tracing::info!(snapshot_id = %snapshot_id, "snapshot already current, skipping reload");
                // The index is still consumed so the delta stream stays
                // contiguous.
                return self.rdm.apply_change_set(&ChangeSet::new(index, Vec::new()));
            }
        }
        let raw = gz_decompress(gz_store)?;
        self.db.import(&raw)?;
        *self.snapshot_id.lock() = Some(snapshot_id.to_string());

        // Seed the fabric and re-seed the replica stream from storage.
        self.db.view(|tx| {
            for router in self.stores.routers.all(tx) {
                self.registry.put(router);
            }
            Ok(())
        })?;
        let change_set = self.full_state_change_set(index)?;
        self.rdm.apply_change_set(&change_set)?;
        tracing::info!(snapshot_id = %snapshot_id, index, "installed storage snapshot");
        Ok(())
    }

    /// Export storage as one full-state change-set (used after snapshot
    /// installs, where the incremental stream has no meaning).
    pub fn full_state_change_set(&self, index: u64) -> Result<ChangeSet> {
        use trellis_protocol::data_state::{RelatedEntityType, ServicePolicyChange};

        self.db.view(|tx| {
            let stores = &self.stores;
            let mut events = Vec::new();
            for config_type in stores.config_types.all(tx) {
                events.push(ModelEvent::create(ModelEntity::ConfigType(config_type)));
            }
            for config in stores.configs.all(tx) {
                events.push(ModelEvent::create(ModelEntity::Config(config)));
            }
            for identity in stores.identities.all(tx) {
                events.push(ModelEvent::create(ModelEntity::Identity(identity)));
            }
            for service in stores.services.all(tx) {
                events.push(ModelEvent::create(ModelEntity::Service(service)));
            }
            for check in stores.posture_checks.all(tx) {
                events.push(ModelEvent::create(ModelEntity::PostureCheck(check)));
            }
            for policy in stores.service_policies.all(tx) {
                events.push(ModelEvent::create(ModelEntity::ServicePolicy(policy.clone())));
                for (related_type, collection) in [
                    (RelatedEntityType::Identity, &stores.policy_identities),
                    (RelatedEntityType::Service, &stores.policy_services),
                    (RelatedEntityType::PostureCheck, &stores.policy_posture_checks),
                ] {
                    let related = collection.iterate_links(tx, &policy.id);
                    if !related.is_empty() {
                        events.push(ModelEvent::update(ModelEntity::ServicePolicyChange(
                            ServicePolicyChange {
                                policy_id: policy.id.clone(),
                                related_entity_type: related_type,
                                related_entity_ids: related,
                                add: true,
                            },
                        )));
                    }
                }
            }
            Ok(ChangeSet {
                index,
                events,
                is_full_state: true,
            })
        })
    }
}

/// Post-commit cascades run on the runtime when one exists (the normal
/// path) and inline during tests without one.
fn spawn_or_block(future: impl std::future::Future<Output = ()> + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => {
            tracing::debug!("no runtime for post-commit cascade, skipping");
        }
    }
}
