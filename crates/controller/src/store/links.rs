//! Many-to-many link collections with pointers in both directions, and
//! the ref-counted variant backing the policy denormalization tables.

use serde_json::Value;

use trellis_domain::Result;

use super::kv::{link_key, split_link_key, Tx, SEP};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LinkCollection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Symmetric many-to-many relation stored as `a\0b` in a forward bucket
/// and `b\0a` in a reverse bucket, so both sides iterate in order.
#[derive(Debug, Clone)]
pub struct LinkCollection {
    forward: String,
    reverse: String,
}

impl LinkCollection {
    pub fn new(name: &str) -> Self {
        Self {
            forward: format!("links.{name}.fwd"),
            reverse: format!("links.{name}.rev"),
        }
    }

    /// Returns `true` when the link was newly added.
    pub fn add_link(&self, tx: &mut Tx, a: &str, b: &str) -> Result<bool> {
        let key = link_key(a, b);
        if tx.get(&self.forward, &key).is_some() {
            return Ok(false);
        }
        tx.put(&self.forward, key, Value::Bool(true));
        tx.put(&self.reverse, link_key(b, a), Value::Bool(true));
        Ok(true)
    }

    /// Returns `true` when the link existed.
    pub fn remove_link(&self, tx: &mut Tx, a: &str, b: &str) -> Result<bool> {
        let removed = tx.delete(&self.forward, &link_key(a, b));
        if removed {
            tx.delete(&self.reverse, &link_key(b, a));
        }
        Ok(removed)
    }

    pub fn has_link(&self, tx: &Tx, a: &str, b: &str) -> bool {
        tx.get(&self.forward, &link_key(a, b)).is_some()
    }

    /// The `b` side of every link from `a`, in order.
    pub fn iterate_links(&self, tx: &Tx, a: &str) -> Vec<String> {
        scan(tx, &self.forward, a)
    }

    /// The `a` side of every link to `b`, in order.
    pub fn iterate_reverse(&self, tx: &Tx, b: &str) -> Vec<String> {
        scan(tx, &self.reverse, b)
    }

    /// Drop every link where `a` is on the forward side.
    pub fn remove_all_for(&self, tx: &mut Tx, a: &str) -> Result<Vec<String>> {
        let others = self.iterate_links(tx, a);
        for b in &others {
            self.remove_link(tx, a, b)?;
        }
        Ok(others)
    }

    /// Drop every link where `b` is on the reverse side.
    pub fn remove_all_to(&self, tx: &mut Tx, b: &str) -> Result<Vec<String>> {
        let others = self.iterate_reverse(tx, b);
        for a in &others {
            self.remove_link(tx, a, b)?;
        }
        Ok(others)
    }
}

fn scan(tx: &Tx, bucket: &str, from: &str) -> Vec<String> {
    tx.keys_with_prefix(bucket, &format!("{from}{SEP}"))
        .iter()
        .filter_map(|k| split_link_key(k).map(|(_, to)| to.to_string()))
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RefCountedLinkCollection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Link collection with a u32 counter per pair. The increment/decrement
/// operations return `(old, new)` so callers detect 0↔1 transitions,
/// which are the access-gained/lost event source.
#[derive(Debug, Clone)]
pub struct RefCountedLinkCollection {
    forward: String,
    reverse: String,
}

impl RefCountedLinkCollection {
    pub fn new(name: &str) -> Self {
        Self {
            forward: format!("denorm.{name}.fwd"),
            reverse: format!("denorm.{name}.rev"),
        }
    }

    fn count(tx: &Tx, bucket: &str, key: &str) -> u32 {
        tx.get(bucket, key)
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(0)
    }

    fn set(tx: &mut Tx, bucket: &str, key: String, count: u32) {
        if count == 0 {
            tx.delete(bucket, &key);
        } else {
            tx.put(bucket, key, Value::from(count));
        }
    }

    pub fn increment_link_count(&self, tx: &mut Tx, a: &str, b: &str) -> Result<(u32, u32)> {
        let old = Self::count(tx, &self.forward, &link_key(a, b));
        let new = old + 1;
        Self::set(tx, &self.forward, link_key(a, b), new);
        Self::set(tx, &self.reverse, link_key(b, a), new);
        Ok((old, new))
    }

    /// Decrement, saturating at zero; the pair is removed when the count
    /// reaches zero.
    pub fn decrement_link_count(&self, tx: &mut Tx, a: &str, b: &str) -> Result<(u32, u32)> {
        let old = Self::count(tx, &self.forward, &link_key(a, b));
        let new = old.saturating_sub(1);
        Self::set(tx, &self.forward, link_key(a, b), new);
        Self::set(tx, &self.reverse, link_key(b, a), new);
        Ok((old, new))
    }

    /// Overwrite the count (denorm repair). Returns `(old, new)`.
    pub fn set_link_count(&self, tx: &mut Tx, a: &str, b: &str, count: u32) -> Result<(u32, u32)> {
        let old = Self::count(tx, &self.forward, &link_key(a, b));
        Self::set(tx, &self.forward, link_key(a, b), count);
        Self::set(tx, &self.reverse, link_key(b, a), count);
        Ok((old, count))
    }

    pub fn get_link_count(&self, tx: &Tx, a: &str, b: &str) -> u32 {
        Self::count(tx, &self.forward, &link_key(a, b))
    }

    /// The `b` side of every positive-count link from `a`.
    pub fn iterate_links(&self, tx: &Tx, a: &str) -> Vec<String> {
        scan(tx, &self.forward, a)
    }

    pub fn iterate_reverse(&self, tx: &Tx, b: &str) -> Vec<String> {
        scan(tx, &self.reverse, b)
    }

    /// Every (a, b, count) triple, for the denorm validator.
    pub fn all_counts(&self, tx: &Tx) -> Vec<(String, String, u32)> {
        tx.keys(&self.forward)
            .iter()
            .filter_map(|k| {
                let (a, b) = split_link_key(k)?;
                Some((a.to_string(), b.to_string(), Self::count(tx, &self.forward, k)))
            })
            .collect()
    }

    /// Drop every pair touching `id` on either side (entity deleted).
    pub fn remove_entity(&self, tx: &mut Tx, id: &str) -> Result<()> {
        for b in self.iterate_links(tx, id) {
            self.set_link_count(tx, id, &b, 0)?;
        }
        for a in self.iterate_reverse(tx, id) {
            self.set_link_count(tx, &a, id, 0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::Db;

    #[test]
    fn link_collection_is_bidirectional() {
        let db = Db::in_memory();
        db.update(|tx| {
            let links = LinkCollection::new("policy-identities");
            assert!(links.add_link(tx, "p1", "i1")?);
            assert!(!links.add_link(tx, "p1", "i1")?);
            links.add_link(tx, "p1", "i2")?;
            links.add_link(tx, "p2", "i1")?;

            assert_eq!(links.iterate_links(tx, "p1"), vec!["i1", "i2"]);
            assert_eq!(links.iterate_reverse(tx, "i1"), vec!["p1", "p2"]);

            assert!(links.remove_link(tx, "p1", "i1")?);
            assert!(!links.remove_link(tx, "p1", "i1")?);
            assert_eq!(links.iterate_reverse(tx, "i1"), vec!["p2"]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn ref_counts_report_transitions() {
        let db = Db::in_memory();
        db.update(|tx| {
            let denorm = RefCountedLinkCollection::new("identity-dial-services");
            assert_eq!(denorm.increment_link_count(tx, "i1", "s1")?, (0, 1));
            assert_eq!(denorm.increment_link_count(tx, "i1", "s1")?, (1, 2));
            assert_eq!(denorm.decrement_link_count(tx, "i1", "s1")?, (2, 1));
            assert_eq!(denorm.decrement_link_count(tx, "i1", "s1")?, (1, 0));
            // Saturates rather than underflowing.
            assert_eq!(denorm.decrement_link_count(tx, "i1", "s1")?, (0, 0));
            assert!(denorm.iterate_links(tx, "i1").is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn set_link_count_overwrites() {
        let db = Db::in_memory();
        db.update(|tx| {
            let denorm = RefCountedLinkCollection::new("d");
            denorm.increment_link_count(tx, "a", "b")?;
            assert_eq!(denorm.set_link_count(tx, "a", "b", 5)?, (1, 5));
            assert_eq!(denorm.get_link_count(tx, "a", "b"), 5);
            assert_eq!(denorm.set_link_count(tx, "a", "b", 0)?, (5, 0));
            assert!(denorm.all_counts(tx).is_empty());
            Ok(())
        })
        .unwrap();
    }
}
