//! Index primitives over the bucket store: unique, nullable-unique and
//! non-unique field indexes, plus foreign-key symbols.

use serde_json::Value;

use trellis_domain::{Error, Result};

use super::kv::{link_key, split_link_key, Tx, SEP};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unique index
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maps a field value to exactly one entity id. Colliding inserts fail
/// with `Conflict` and abort the transaction.
#[derive(Debug, Clone)]
pub struct UniqueIndex {
    bucket: String,
    entity_type: &'static str,
    field: &'static str,
}

impl UniqueIndex {
    pub fn new(entity_type: &'static str, field: &'static str) -> Self {
        Self {
            bucket: format!("{entity_type}.idx.{field}"),
            entity_type,
            field,
        }
    }

    pub fn insert(&self, tx: &mut Tx, value: &str, id: &str) -> Result<()> {
        if let Some(existing) = tx.get(&self.bucket, value) {
            if existing.as_str() != Some(id) {
                return Err(Error::Conflict {
                    entity_type: self.entity_type,
                    field: self.field,
                    value: value.to_string(),
                });
            }
            return Ok(());
        }
        tx.put(&self.bucket, value, Value::String(id.to_string()));
        Ok(())
    }

    pub fn remove(&self, tx: &mut Tx, value: &str) {
        tx.delete(&self.bucket, value);
    }

    /// Re-point the index when a field value changes.
    pub fn update(&self, tx: &mut Tx, old: &str, new: &str, id: &str) -> Result<()> {
        if old == new {
            return Ok(());
        }
        self.insert(tx, new, id)?;
        self.remove(tx, old);
        Ok(())
    }

    pub fn get(&self, tx: &Tx, value: &str) -> Option<String> {
        tx.get(&self.bucket, value)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// A unique index over an optional field; absent values are simply not
/// indexed.
#[derive(Debug, Clone)]
pub struct NullableUniqueIndex {
    inner: UniqueIndex,
}

impl NullableUniqueIndex {
    pub fn new(entity_type: &'static str, field: &'static str) -> Self {
        Self {
            inner: UniqueIndex::new(entity_type, field),
        }
    }

    pub fn insert(&self, tx: &mut Tx, value: Option<&str>, id: &str) -> Result<()> {
        match value {
            Some(value) => self.inner.insert(tx, value, id),
            None => Ok(()),
        }
    }

    pub fn remove(&self, tx: &mut Tx, value: Option<&str>) {
        if let Some(value) = value {
            self.inner.remove(tx, value);
        }
    }

    pub fn update(&self, tx: &mut Tx, old: Option<&str>, new: Option<&str>, id: &str) -> Result<()> {
        if old == new {
            return Ok(());
        }
        self.insert(tx, new, id)?;
        self.remove(tx, old);
        Ok(())
    }

    pub fn get(&self, tx: &Tx, value: &str) -> Option<String> {
        self.inner.get(tx, value)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Non-unique index
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maps a field value to many entity ids, stored as composite
/// `value\0id` keys so lookups are ordered prefix scans.
#[derive(Debug, Clone)]
pub struct NonUniqueIndex {
    bucket: String,
}

impl NonUniqueIndex {
    pub fn new(entity_type: &'static str, field: &'static str) -> Self {
        Self {
            bucket: format!("{entity_type}.idx.{field}"),
        }
    }

    pub fn insert(&self, tx: &mut Tx, value: &str, id: &str) {
        tx.put(&self.bucket, link_key(value, id), Value::Bool(true));
    }

    pub fn remove(&self, tx: &mut Tx, value: &str, id: &str) {
        tx.delete(&self.bucket, &link_key(value, id));
    }

    /// Ids carrying `value`, in id order.
    pub fn get(&self, tx: &Tx, value: &str) -> Vec<String> {
        tx.keys_with_prefix(&self.bucket, &format!("{value}{SEP}"))
            .iter()
            .filter_map(|k| split_link_key(k).map(|(_, id)| id.to_string()))
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Foreign keys
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Single foreign-key column: the referenced entity must exist at insert
/// time; a reverse index answers "who references X" at delete time.
#[derive(Debug, Clone)]
pub struct FkSymbol {
    target_bucket: &'static str,
    target_type: &'static str,
    reverse: NonUniqueIndex,
}

impl FkSymbol {
    pub fn new(
        entity_type: &'static str,
        field: &'static str,
        target_bucket: &'static str,
        target_type: &'static str,
    ) -> Self {
        Self {
            target_bucket,
            target_type,
            reverse: NonUniqueIndex::new(entity_type, field),
        }
    }

    pub fn link(&self, tx: &mut Tx, id: &str, target_id: &str) -> Result<()> {
        if tx.get(self.target_bucket, target_id).is_none() {
            return Err(Error::not_found(self.target_type, target_id));
        }
        self.reverse.insert(tx, target_id, id);
        Ok(())
    }

    pub fn unlink(&self, tx: &mut Tx, id: &str, target_id: &str) {
        self.reverse.remove(tx, target_id, id);
    }

    /// Entity ids referencing `target_id` through this column.
    pub fn referrers(&self, tx: &Tx, target_id: &str) -> Vec<String> {
        self.reverse.get(tx, target_id)
    }
}

/// Foreign-key set column: like [`FkSymbol`] for a list-valued field.
#[derive(Debug, Clone)]
pub struct FkSetSymbol {
    inner: FkSymbol,
}

impl FkSetSymbol {
    pub fn new(
        entity_type: &'static str,
        field: &'static str,
        target_bucket: &'static str,
        target_type: &'static str,
    ) -> Self {
        Self {
            inner: FkSymbol::new(entity_type, field, target_bucket, target_type),
        }
    }

    pub fn link_all(&self, tx: &mut Tx, id: &str, target_ids: &[String]) -> Result<()> {
        for target_id in target_ids {
            self.inner.link(tx, id, target_id)?;
        }
        Ok(())
    }

    pub fn unlink_all(&self, tx: &mut Tx, id: &str, target_ids: &[String]) {
        for target_id in target_ids {
            self.inner.unlink(tx, id, target_id);
        }
    }

    pub fn referrers(&self, tx: &Tx, target_id: &str) -> Vec<String> {
        self.inner.referrers(tx, target_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::Db;
    use serde_json::json;

    #[test]
    fn unique_index_rejects_collisions() {
        let db = Db::in_memory();
        db.update(|tx| {
            let idx = UniqueIndex::new("identities", "name");
            idx.insert(tx, "alpha", "i1")?;
            // Same id re-insert is fine (update path).
            idx.insert(tx, "alpha", "i1")?;
            let err = idx.insert(tx, "alpha", "i2").unwrap_err();
            assert!(matches!(err, Error::Conflict { .. }));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn unique_index_update_moves_pointer() {
        let db = Db::in_memory();
        db.update(|tx| {
            let idx = UniqueIndex::new("identities", "name");
            idx.insert(tx, "alpha", "i1")?;
            idx.update(tx, "alpha", "beta", "i1")?;
            assert_eq!(idx.get(tx, "beta"), Some("i1".to_string()));
            assert_eq!(idx.get(tx, "alpha"), None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn non_unique_index_collects_ids() {
        let db = Db::in_memory();
        db.update(|tx| {
            let idx = NonUniqueIndex::new("terminators", "service");
            idx.insert(tx, "svc1", "t2");
            idx.insert(tx, "svc1", "t1");
            idx.insert(tx, "svc2", "t3");
            assert_eq!(idx.get(tx, "svc1"), vec!["t1", "t2"]);
            idx.remove(tx, "svc1", "t1");
            assert_eq!(idx.get(tx, "svc1"), vec!["t2"]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn fk_requires_target_and_tracks_referrers() {
        let db = Db::in_memory();
        db.update(|tx| {
            tx.put("routers", "r1", json!({}));
            let fk = FkSymbol::new("terminators", "router", "routers", "router");
            assert!(fk.link(tx, "t1", "ghost").is_err());
            fk.link(tx, "t1", "r1")?;
            fk.link(tx, "t2", "r1")?;
            assert_eq!(fk.referrers(tx, "r1"), vec!["t1", "t2"]);
            fk.unlink(tx, "t1", "r1");
            assert_eq!(fk.referrers(tx, "r1"), vec!["t2"]);
            Ok(())
        })
        .unwrap();
    }
}
