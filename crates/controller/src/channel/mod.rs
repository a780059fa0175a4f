//! Controller↔router messaging: one long-lived full-duplex channel per
//! router, served by reader, writer and heartbeat tasks, plus the
//! bounded worker pool for outbound fan-out.

pub mod channel;
pub mod pool;
pub mod validation;

use std::time::Duration;

use async_trait::async_trait;
use trellis_domain::Result;
use trellis_protocol::Frame;

pub use channel::{ChannelConfig, RouterChannel};
pub use pool::SendPool;

/// The control-channel surface the rest of the controller programs
/// against. The concrete implementation is [`RouterChannel`]; tests
/// substitute stubs.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn router_id(&self) -> &str;

    /// Fire-and-forget send; fails when the channel is down or the
    /// outbound queue never drains within the channel's send timeout.
    async fn send(&self, frame: Frame) -> Result<()>;

    /// Send a correlated request and await its reply.
    async fn send_for_reply(&self, frame: Frame, timeout: Duration) -> Result<Frame>;

    fn is_connected(&self) -> bool;

    /// Heartbeat round trip exceeded the unresponsive threshold, or a
    /// heartbeat went unanswered. The channel stays open; multi-homed
    /// routers use this to prefer a healthier controller.
    fn is_unresponsive(&self) -> bool;

    /// Most recent heartbeat round trip.
    fn latency(&self) -> Option<Duration>;

    fn close(&self);
}

impl std::fmt::Debug for dyn ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("router_id", &self.router_id())
            .finish()
    }
}

/// Inbound frames and channel lifecycle, handled by the network layer.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn handle(&self, router_id: &str, frame: Frame);
    async fn channel_closed(&self, router_id: &str);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use trellis_protocol::ContentType;

    type Responder = Box<dyn FnMut(&Frame) -> Result<Frame> + Send>;

    /// Scriptable in-memory channel for engine tests: records sent
    /// frames and answers `send_for_reply` through a responder closure
    /// (default: success with no peer data).
    pub struct StubChannel {
        router_id: String,
        pub sent: Mutex<Vec<Frame>>,
        responder: Mutex<Option<Responder>>,
        connected: AtomicBool,
        unresponsive: AtomicBool,
    }

    impl StubChannel {
        pub fn new(router_id: &str) -> Self {
            Self {
                router_id: router_id.to_string(),
                sent: Mutex::new(Vec::new()),
                responder: Mutex::new(None),
                connected: AtomicBool::new(true),
                unresponsive: AtomicBool::new(false),
            }
        }

        pub fn with_responder(
            router_id: &str,
            responder: impl FnMut(&Frame) -> Result<Frame> + Send + 'static,
        ) -> Self {
            let stub = Self::new(router_id);
            *stub.responder.lock() = Some(Box::new(responder));
            stub
        }

        pub fn sent_frames(&self) -> Vec<Frame> {
            self.sent.lock().clone()
        }

        pub fn sent_count_of(&self, content_type: ContentType) -> usize {
            self.sent
                .lock()
                .iter()
                .filter(|f| f.content_type == content_type)
                .count()
        }

        pub fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ControlChannel for StubChannel {
        fn router_id(&self) -> &str {
            &self.router_id
        }

        async fn send(&self, frame: Frame) -> Result<()> {
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn send_for_reply(&self, frame: Frame, _timeout: Duration) -> Result<Frame> {
            self.sent.lock().push(frame.clone());
            let mut responder = self.responder.lock();
            match responder.as_mut() {
                Some(respond) => respond(&frame),
                None => Ok(Frame::new(ContentType::RouteResult, Vec::new()).with_success()),
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn is_unresponsive(&self) -> bool {
            self.unresponsive.load(Ordering::SeqCst)
        }

        fn latency(&self) -> Option<Duration> {
            None
        }

        fn close(&self) {
            self.set_connected(false);
        }
    }
}
