//! Storage layer: a schema of indexed entity buckets, link collections
//! and ref-counted denormalization tables over a transactional
//! keyed-bucket store.

pub mod entities;
pub mod index;
pub mod kv;
pub mod links;

pub use entities::{Entity, EntityStore, RouterStore, Stores, TerminatorStore};
pub use kv::{Db, Tx};
pub use links::{LinkCollection, RefCountedLinkCollection};
