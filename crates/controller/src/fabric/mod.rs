//! The fabric: routers, the links between them, and path computation.

pub mod graph;
pub mod link;
pub mod router;

pub use graph::LinkGraph;
pub use link::{Link, LinkState};
pub use router::{RouterLinks, RouterRegistry, RouterState};
