//! Router Data Model: the subset of the controller model a router needs
//! to authorize dial/bind decisions locally.
//!
//! The same structure runs in two modes. On a controller it is the
//! *sender*: a logging event cache retains recent change-sets so
//! reconnecting routers can be replayed from their last applied index.
//! On a router it is the *receiver*: a forgetful cache tracks only the
//! last applied index, and the model answers authorization queries
//! without a controller round-trip.

pub mod event_cache;
pub mod model;
pub mod snapshot;
pub mod subscription;

pub use event_cache::EventCache;
pub use model::{AccessPolicies, Rdm};
pub use subscription::{IdentityEventSubscriber, IdentityService};
