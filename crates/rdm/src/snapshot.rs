//! RDM snapshots: gzip-compressed JSON of `{model, index}`.
//!
//! A router saves its model periodically and on shutdown; on restart it
//! loads the snapshot and resumes the delta stream from the saved index.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use trellis_domain::model::{PublicKey, Revocation};
use trellis_domain::Result;

use crate::model::{
    ConfigState, ConfigTypeState, IdentityState, PolicyState, PostureCheckState, Rdm, ServiceState,
};

#[derive(Serialize, Deserialize, Default)]
struct ModelImage {
    config_types: HashMap<String, ConfigTypeState>,
    configs: HashMap<String, ConfigState>,
    identities: HashMap<String, IdentityState>,
    services: HashMap<String, ServiceState>,
    service_policies: HashMap<String, PolicyState>,
    posture_checks: HashMap<String, PostureCheckState>,
    public_keys: HashMap<String, PublicKey>,
    revocations: HashMap<String, Revocation>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    model: ModelImage,
    index: u64,
}

fn collect<V: Clone>(map: &dashmap::DashMap<String, V>) -> HashMap<String, V> {
    map.iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect()
}

impl Rdm {
    /// Write a snapshot, skipping the write when the model has not moved
    /// since the last save. Returns whether a file was written.
    pub fn save(&self, path: &Path) -> Result<bool> {
        let mut result = Ok(false);
        self.cache.while_locked(|index, initialized| {
            if !initialized {
                tracing::debug!("not saving router data model, no index yet");
                return;
            }
            {
                let last_save = self.last_save_index.lock();
                if *last_save == Some(index) {
                    tracing::debug!(index, "router data model unchanged, nothing to save");
                    return;
                }
            }

            let image = SnapshotFile {
                model: ModelImage {
                    config_types: collect(&self.config_types),
                    configs: collect(&self.configs),
                    identities: collect(&self.identities),
                    services: collect(&self.services),
                    service_policies: collect(&self.service_policies),
                    posture_checks: collect(&self.posture_checks),
                    public_keys: collect(&self.public_keys),
                    revocations: collect(&self.revocations),
                },
                index,
            };

            result = (|| {
                let json = serde_json::to_vec(&image)?;
                let file = File::create(path)?;
                let mut gz = GzEncoder::new(file, Compression::default());
                gz.write_all(&json)?;
                gz.finish()?;
                *self.last_save_index.lock() = Some(index);
                tracing::info!(index, path = %path.display(), "saved router data model");
                Ok(true)
            })();
        });
        result
    }

    /// Load a receiver-mode model from a snapshot file; change-sets apply
    /// from the snapshot index forward.
    pub fn load(path: &Path, listener_buffer: usize) -> Result<Rdm> {
        let file = File::open(path)?;
        let mut gz = GzDecoder::new(file);
        let mut json = Vec::new();
        gz.read_to_end(&mut json)?;
        let image: SnapshotFile = serde_json::from_slice(&json)?;

        let rdm = Rdm::new_receiver(listener_buffer);
        for (id, state) in image.model.config_types {
            rdm.config_types.insert(id, state);
        }
        for (id, state) in image.model.configs {
            rdm.configs.insert(id, state);
        }
        for (id, state) in image.model.identities {
            rdm.identities.insert(id, state);
        }
        for (id, state) in image.model.services {
            rdm.services.insert(id, state);
        }
        for (id, state) in image.model.service_policies {
            rdm.service_policies.insert(id, state);
        }
        for (id, state) in image.model.posture_checks {
            rdm.posture_checks.insert(id, state);
        }
        for (id, state) in image.model.public_keys {
            rdm.public_keys.insert(id, state);
        }
        for (id, state) in image.model.revocations {
            rdm.revocations.insert(id, state);
        }
        rdm.cache.set_current_index(image.index);
        *rdm.last_save_index.lock() = Some(image.index);
        Ok(rdm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_domain::model::{Identity, PolicyType, Service, ServicePolicy};
    use trellis_protocol::data_state::{
        ChangeSet, ModelEntity, ModelEvent, RelatedEntityType, ServicePolicyChange,
    };

    fn seeded() -> Rdm {
        let rdm = Rdm::new_sender(100, 4);
        rdm.apply_change_set(&ChangeSet::new(
            1,
            vec![
                ModelEvent::create(ModelEntity::Identity(Identity {
                    id: "i1".into(),
                    name: "alpha".into(),
                    role_attributes: vec!["db".into()],
                    ..Default::default()
                })),
                ModelEvent::create(ModelEntity::Service(Service {
                    id: "svc1".into(),
                    name: "postgres".into(),
                    ..Default::default()
                })),
                ModelEvent::create(ModelEntity::ServicePolicy(ServicePolicy {
                    id: "p1".into(),
                    policy_type: PolicyType::Dial,
                    ..Default::default()
                })),
                ModelEvent::update(ModelEntity::ServicePolicyChange(ServicePolicyChange {
                    policy_id: "p1".into(),
                    related_entity_type: RelatedEntityType::Identity,
                    related_entity_ids: vec!["i1".into()],
                    add: true,
                })),
            ],
        ))
        .unwrap();
        rdm
    }

    #[test]
    fn snapshot_then_load_is_identity() {
        let rdm = seeded();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rdm.json.gz");

        assert!(rdm.save(&path).unwrap());
        let loaded = Rdm::load(&path, 4).unwrap();

        assert_eq!(loaded.current_index(), Some(1));
        assert_eq!(loaded.identity("i1").unwrap().name, "alpha");
        assert_eq!(loaded.service("svc1").unwrap().name, "postgres");
        let orig = rdm.identities.get("i1").unwrap();
        let copy = loaded.identities.get("i1").unwrap();
        assert_eq!(orig.service_policies, copy.service_policies);
    }

    #[test]
    fn unchanged_model_skips_save() {
        let rdm = seeded();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rdm.json.gz");

        assert!(rdm.save(&path).unwrap());
        assert!(!rdm.save(&path).unwrap());
    }

    #[test]
    fn loaded_model_applies_deltas_from_snapshot_index() {
        let rdm = seeded();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rdm.json.gz");
        rdm.save(&path).unwrap();

        let loaded = Rdm::load(&path, 4).unwrap();
        // Index 1 is a no-op; index 2 applies.
        loaded
            .apply_change_set(&ChangeSet::new(1, Vec::new()))
            .unwrap();
        loaded
            .apply_change_set(&ChangeSet::new(
                2,
                vec![ModelEvent::create(ModelEntity::Service(Service {
                    id: "svc2".into(),
                    ..Default::default()
                }))],
            ))
            .unwrap();
        assert_eq!(loaded.current_index(), Some(2));
        assert!(loaded.service("svc2").is_some());
    }
}
