//! Process-unique id sequence for circuits and hop tokens.

use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

/// Monotonic counter hashed with a per-process seed. Ids are unique
/// within a controller incarnation and never reused.
pub struct IdSequence {
    seed: String,
    counter: AtomicU64,
}

impl IdSequence {
    pub fn new(seed: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            counter: AtomicU64::new(1),
        }
    }

    /// Short opaque token, e.g. circuit ids and ingress/egress tokens.
    pub fn next_hash(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let digest = Sha256::digest(format!("{}:{}", self.seed, n).as_bytes());
        hex::encode(&digest[..6])
    }
}
