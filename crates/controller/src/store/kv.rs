//! Transactional keyed-bucket store.
//!
//! The production deployment sits on an embedded ordered key/value
//! engine; this module is the boundary to it. Buckets are ordered
//! string-keyed maps of JSON values. A transaction stages a full copy of
//! the tree and swaps it in atomically on commit; on-commit hooks run
//! after the lock is released, so they observe the committed state and
//! are the publication point for deferred events.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use trellis_domain::{Error, Result};

pub type Bucket = BTreeMap<String, Value>;
type Tree = BTreeMap<String, Bucket>;

/// Composite key separator for link-collection buckets. Entity ids are
/// opaque but never contain NUL.
pub const SEP: char = '\0';

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A read-write transaction over the bucket tree.
pub struct Tx {
    tree: Tree,
    hooks: Vec<Box<dyn FnOnce() + Send>>,
}

impl Tx {
    pub fn get(&self, bucket: &str, key: &str) -> Option<&Value> {
        self.tree.get(bucket)?.get(key)
    }

    pub fn put(&mut self, bucket: &str, key: impl Into<String>, value: Value) {
        self.tree
            .entry(bucket.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    /// Remove a key; returns whether it was present.
    pub fn delete(&mut self, bucket: &str, key: &str) -> bool {
        self.tree
            .get_mut(bucket)
            .map(|b| b.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Keys in order. Empty when the bucket does not exist.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.tree
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Ordered keys beginning with `prefix`.
    pub fn keys_with_prefix(&self, bucket: &str, prefix: &str) -> Vec<String> {
        self.tree
            .get(bucket)
            .map(|b| {
                b.range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn bucket_len(&self, bucket: &str) -> usize {
        self.tree.get(bucket).map(BTreeMap::len).unwrap_or(0)
    }

    /// Every bucket is empty (a fresh store).
    pub fn is_empty(&self) -> bool {
        self.tree.values().all(BTreeMap::is_empty)
    }

    /// Defer work to run after the transaction commits.
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Db
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory bucket tree with an optional JSON file image.
#[derive(Clone)]
pub struct Db {
    tree: Arc<RwLock<Tree>>,
    path: Option<PathBuf>,
}

impl Db {
    pub fn in_memory() -> Self {
        Self {
            tree: Arc::new(RwLock::new(Tree::new())),
            path: None,
        }
    }

    /// Open a file-backed store, loading the existing image if present.
    pub fn open(path: &Path) -> Result<Self> {
        let tree = if path.exists() {
            let raw = std::fs::read(path)?;
            serde_json::from_slice(&raw)?
        } else {
            Tree::new()
        };
        Ok(Self {
            tree: Arc::new(RwLock::new(tree)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Run a read-write transaction. `f` returning `Err` rolls the
    /// staged changes back; on commit the file image is rewritten and
    /// on-commit hooks run (after the lock is released).
    pub fn update<T>(&self, f: impl FnOnce(&mut Tx) -> Result<T>) -> Result<T> {
        let mut guard = self.tree.write();
        let mut tx = Tx {
            tree: guard.clone(),
            hooks: Vec::new(),
        };
        let result = f(&mut tx)?;

        if let Some(path) = &self.path {
            let json = serde_json::to_vec(&tx.tree)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, json)?;
        }
        *guard = tx.tree;
        drop(guard);

        for hook in tx.hooks {
            hook();
        }
        Ok(result)
    }

    /// Run a read-only transaction against a stable snapshot.
    pub fn view<T>(&self, f: impl FnOnce(&Tx) -> Result<T>) -> Result<T> {
        let guard = self.tree.read();
        let tx = Tx {
            tree: guard.clone(),
            hooks: Vec::new(),
        };
        drop(guard);
        f(&tx)
    }

    /// Serialize the whole tree (for snapshots and migration).
    pub fn export(&self) -> Result<Vec<u8>> {
        let guard = self.tree.read();
        Ok(serde_json::to_vec(&*guard)?)
    }

    /// Replace the whole tree from a serialized image.
    pub fn import(&self, raw: &[u8]) -> Result<()> {
        let tree: Tree = serde_json::from_slice(raw)?;
        *self.tree.write() = tree;
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, raw)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().values().all(BTreeMap::is_empty)
    }
}

/// Composite key for link buckets.
pub fn link_key(a: &str, b: &str) -> String {
    format!("{a}{SEP}{b}")
}

/// Split a composite link key back into its halves.
pub fn split_link_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(SEP)
}
