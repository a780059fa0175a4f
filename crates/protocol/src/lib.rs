//! Controller↔router wire protocol.
//!
//! Routers hold one long-lived, mutually-authenticated channel per
//! controller. Each direction carries length-prefixed typed frames:
//!
//! ```text
//! u32 length | u32 content-type | u32 header-count
//!            | repeated (i32 key, u32 len, bytes value) | bytes body
//! ```
//!
//! The transport is assumed ordered and loss-free within a channel
//! incarnation; any framing error closes the channel and forces a
//! reconnect, which re-runs the `Hello` handshake.
//!
//! Frame bodies are serde-JSON encodings of the typed messages in
//! [`msgs`] and [`data_state`]; the envelope (content type, correlation
//! headers, peer-data headers) is binary.

pub mod codec;
pub mod data_state;
pub mod frame;
pub mod msgs;

pub use codec::FrameCodec;
pub use data_state::{Action, ChangeSet, ModelEntity, ModelEvent, RelatedEntityType, ServicePolicyChange};
pub use frame::{ContentType, Frame, header};
