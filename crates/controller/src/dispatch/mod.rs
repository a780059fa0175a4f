//! Replicated command dispatch.
//!
//! Two implementations behind one contract: `LocalDispatcher` runs the
//! command inline (single-node mode); `ReplicatedDispatcher` serializes
//! it through a consensus log and applies it at the committed index, so
//! every replica derives identical state. The consensus engine itself is
//! an external collaborator behind [`ConsensusLog`].

pub mod command;
pub mod limiter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use trellis_domain::{Error, Result};

pub use command::{gz_compress, gz_decompress, Command, ControllerModel};
pub use limiter::AdaptiveLimiter;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Submit a command; resolves once it is applied locally. Returns
    /// the log index it was applied at.
    async fn dispatch(&self, command: Command) -> Result<u64>;

    fn is_leader(&self) -> bool;

    /// Current leader hint for `NotLeader` errors.
    fn leader(&self) -> Option<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consensus boundary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the external consensus engine provides: linearizable append
/// (resolving at the committed index) and leadership queries. Snapshot
/// install flows back through [`ControllerModel::apply`] as a
/// `SyncSnapshot` command.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    async fn append(&self, entry: Vec<u8>) -> Result<u64>;
    fn is_leader(&self) -> bool;
    fn leader_hint(&self) -> Option<String>;
}

/// Single-node in-process log: every append commits immediately, in
/// order. Backs dev mode and tests.
pub struct SoloLog {
    node_id: String,
    index: AtomicU64,
}

impl SoloLog {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            index: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ConsensusLog for SoloLog {
    async fn append(&self, _entry: Vec<u8>) -> Result<u64> {
        Ok(self.index.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn leader_hint(&self) -> Option<String> {
        Some(self.node_id.clone())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Local
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs commands inline against the local model.
pub struct LocalDispatcher {
    model: Arc<ControllerModel>,
    limiter: AdaptiveLimiter,
    index: AtomicU64,
}

impl LocalDispatcher {
    pub fn new(model: Arc<ControllerModel>, max_inflight: usize) -> Self {
        Self {
            model,
            limiter: AdaptiveLimiter::new(1, max_inflight),
            index: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl CommandDispatcher for LocalDispatcher {
    async fn dispatch(&self, command: Command) -> Result<u64> {
        let guard = self.limiter.acquire()?;
        let index = self.index.fetch_add(1, Ordering::AcqRel) + 1;
        let result = self.model.apply(index, &command);
        match result {
            Ok(()) => {
                drop(guard);
                Ok(index)
            }
            Err(err) => {
                if err.is_retryable() {
                    guard.failed();
                }
                Err(err)
            }
        }
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn leader(&self) -> Option<String> {
        None
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Replicated
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serializes commands through the consensus log; followers feed
/// committed entries into [`ReplicatedDispatcher::apply_committed`].
pub struct ReplicatedDispatcher {
    log: Arc<dyn ConsensusLog>,
    model: Arc<ControllerModel>,
    limiter: AdaptiveLimiter,
}

impl ReplicatedDispatcher {
    pub fn new(log: Arc<dyn ConsensusLog>, model: Arc<ControllerModel>, max_inflight: usize) -> Self {
        Self {
            log,
            model,
            limiter: AdaptiveLimiter::new(1, max_inflight),
        }
    }

    /// Apply a committed entry from the consensus engine (the follower
    /// path, and snapshot catch-up).
    pub fn apply_committed(&self, index: u64, entry: &[u8]) -> Result<()> {
        let command = Command::decode(entry)?;
        self.model.apply(index, &command)
    }
}

#[async_trait]
impl CommandDispatcher for ReplicatedDispatcher {
    async fn dispatch(&self, command: Command) -> Result<u64> {
        if !self.log.is_leader() {
            return Err(Error::NotLeader {
                leader: self.log.leader_hint(),
            });
        }
        let guard = self.limiter.acquire()?;

        let entry = command.encode()?;
        let index = match self.log.append(entry).await {
            Ok(index) => index,
            Err(err) => {
                guard.failed();
                return Err(Error::Replication(format!(
                    "could not append command to cluster log: {err}"
                )));
            }
        };
        self.model.apply(index, &command)?;
        Ok(index)
    }

    fn is_leader(&self) -> bool {
        self.log.is_leader()
    }

    fn leader(&self) -> Option<String> {
        self.log.leader_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDispatcher;
    use crate::fabric::RouterRegistry;
    use crate::store::{Db, Stores};
    use trellis_domain::model::Identity;
    use trellis_rdm::Rdm;

    fn model() -> Arc<ControllerModel> {
        Arc::new(ControllerModel::new(
            Db::in_memory(),
            Arc::new(Stores::new()),
            Arc::new(Rdm::new_sender(1000, 8)),
            Arc::new(EventDispatcher::new()),
            Arc::new(RouterRegistry::new()),
        ))
    }

    fn create_identity(id: &str) -> Command {
        Command::CreateIdentity(Identity {
            id: id.into(),
            name: id.into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn local_dispatch_applies_in_order() {
        let model = model();
        let dispatcher = LocalDispatcher::new(model.clone(), 8);
        assert_eq!(dispatcher.dispatch(create_identity("i1")).await.unwrap(), 1);
        assert_eq!(dispatcher.dispatch(create_identity("i2")).await.unwrap(), 2);
        assert_eq!(model.rdm.current_index(), Some(2));
        assert!(dispatcher.is_leader());
    }

    #[tokio::test]
    async fn replicated_dispatch_round_trips_the_log() {
        let model = model();
        let dispatcher =
            ReplicatedDispatcher::new(Arc::new(SoloLog::new("ctrl1")), model.clone(), 8);
        let index = dispatcher.dispatch(create_identity("i1")).await.unwrap();
        assert_eq!(index, 1);
        assert!(model.rdm.identity("i1").is_some());
    }

    #[tokio::test]
    async fn follower_rejects_with_leader_hint() {
        struct FollowerLog;
        #[async_trait]
        impl ConsensusLog for FollowerLog {
            async fn append(&self, _entry: Vec<u8>) -> Result<u64> {
                unreachable!("followers never append")
            }
            fn is_leader(&self) -> bool {
                false
            }
            fn leader_hint(&self) -> Option<String> {
                Some("ctrl2".into())
            }
        }

        let dispatcher = ReplicatedDispatcher::new(Arc::new(FollowerLog), model(), 8);
        let err = dispatcher.dispatch(create_identity("i1")).await.unwrap_err();
        match err {
            Error::NotLeader { leader } => assert_eq!(leader.as_deref(), Some("ctrl2")),
            other => panic!("expected NotLeader, got {other}"),
        }
    }

    #[tokio::test]
    async fn follower_applies_committed_entries() {
        let leader_model = model();
        let follower_model = model();
        let leader =
            ReplicatedDispatcher::new(Arc::new(SoloLog::new("ctrl1")), leader_model.clone(), 8);
        let follower =
            ReplicatedDispatcher::new(Arc::new(SoloLog::new("ctrl2")), follower_model.clone(), 8);

        let command = create_identity("i1");
        let entry = command.encode().unwrap();
        let index = leader.dispatch(command).await.unwrap();
        follower.apply_committed(index, &entry).unwrap();

        assert_eq!(
            leader_model.rdm.identity("i1"),
            follower_model.rdm.identity("i1")
        );
    }

    #[tokio::test]
    async fn append_failure_is_replication_failure() {
        struct BrokenLog;
        #[async_trait]
        impl ConsensusLog for BrokenLog {
            async fn append(&self, _entry: Vec<u8>) -> Result<u64> {
                Err(Error::Other("quorum lost".into()))
            }
            fn is_leader(&self) -> bool {
                true
            }
            fn leader_hint(&self) -> Option<String> {
                None
            }
        }

        let dispatcher = ReplicatedDispatcher::new(Arc::new(BrokenLog), model(), 8);
        let err = dispatcher.dispatch(create_identity("i1")).await.unwrap_err();
        assert!(matches!(err, Error::Replication(_)));
    }
}
