//! Agent subcommand implementations.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::Digest;

use trellis_domain::config::Config;

use crate::bootstrap;
use crate::dispatch::{gz_compress, Command, CommandDispatcher};

/// Persisted cluster membership marker, owned by `cluster init`.
#[derive(Debug, Serialize, Deserialize)]
struct ClusterState {
    node_id: String,
    members: Vec<String>,
}

fn cluster_state_path(config: &Config) -> anyhow::Result<std::path::PathBuf> {
    let dir = config
        .cluster
        .data_dir
        .clone()
        .ok_or_else(|| anyhow::anyhow!("cluster.data_dir is not configured"))?;
    Ok(dir.join("cluster.json"))
}

fn load_cluster_state(config: &Config) -> anyhow::Result<ClusterState> {
    let path = cluster_state_path(config)?;
    let raw = std::fs::read(&path).map_err(|_| {
        anyhow::anyhow!(
            "no cluster state at {}; run `trellis agent cluster init` first",
            path.display()
        )
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

/// `agent cluster init`: create single-node cluster state.
pub fn cluster_init(config: &Config) -> anyhow::Result<()> {
    let path = cluster_state_path(config)?;
    if path.exists() {
        anyhow::bail!("cluster state already exists at {}", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let state = ClusterState {
        node_id: config.node_id.clone(),
        members: vec![config.node_id.clone()],
    };
    std::fs::write(&path, serde_json::to_vec_pretty(&state)?)?;
    println!("initialized cluster with member {}", config.node_id);
    Ok(())
}

/// `agent cluster list-members`.
pub fn cluster_list_members(config: &Config) -> anyhow::Result<()> {
    let state = load_cluster_state(config)?;
    for member in &state.members {
        let leader = if *member == state.node_id { " (leader)" } else { "" };
        println!("{member}{leader}");
    }
    Ok(())
}

/// Membership changes route through the deployment's consensus engine;
/// without one attached this is a precondition failure.
pub fn cluster_membership_unavailable(operation: &str) -> anyhow::Result<()> {
    anyhow::bail!(
        "cannot {operation}: this controller is not attached to a running consensus engine"
    )
}

/// `init-from-db`: read a legacy store file, wrap it as a snapshot-sync
/// command, dispatch it. The target store must be empty.
pub async fn init_from_db(config: Arc<Config>, legacy_path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read(legacy_path).map_err(|err| {
        anyhow::anyhow!("could not read legacy store {}: {err}", legacy_path.display())
    })?;
    // Validate the legacy image before shipping it anywhere.
    serde_json::from_slice::<serde_json::Value>(&raw)
        .map_err(|err| anyhow::anyhow!("legacy store is not a valid image: {err}"))?;

    let (state, _supervisor) = bootstrap::build_state(config)?;
    if !state.db.is_empty() {
        anyhow::bail!(
            "target store {} is not empty; refusing to overwrite",
            state.config.store.path.display()
        );
    }

    let snapshot_id = hex::encode(&sha2::Sha256::digest(&raw)[..8]);
    let command = Command::SyncSnapshot {
        snapshot_id: snapshot_id.clone(),
        gz_store: gz_compress(&raw)?,
    };
    let index = state.dispatcher.dispatch(command).await?;
    println!(
        "imported {} as snapshot {snapshot_id} at index {index}",
        legacy_path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_domain::config::StoreConfig;

    fn config_in(dir: &Path) -> Config {
        Config {
            node_id: "ctrl1".into(),
            store: StoreConfig {
                path: dir.join("store.json"),
            },
            cluster: trellis_domain::config::ClusterConfig {
                data_dir: Some(dir.join("cluster")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn cluster_init_is_idempotent_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        cluster_init(&config).unwrap();
        assert!(cluster_init(&config).is_err());
        cluster_list_members(&config).unwrap();
    }

    #[tokio::test]
    async fn init_from_db_requires_empty_target() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(config_in(dir.path()));

        // A legacy image with one bucket.
        let legacy = dir.path().join("legacy.json");
        let image = serde_json::json!({
            "identities": {
                "i1": {"id": "i1", "name": "alpha"}
            }
        });
        std::fs::write(&legacy, image.to_string()).unwrap();

        init_from_db(config.clone(), &legacy).await.unwrap();

        // Second import hits a non-empty target.
        let err = init_from_db(config, &legacy).await.unwrap_err();
        assert!(err.to_string().contains("not empty"));
    }

    #[test]
    fn membership_ops_fail_without_consensus() {
        assert!(cluster_membership_unavailable("add a member").is_err());
    }
}
