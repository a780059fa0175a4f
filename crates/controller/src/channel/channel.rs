//! The concrete per-router channel over any ordered byte stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use trellis_domain::{Error, Result};
use trellis_protocol::msgs::{Heartbeat, Hello};
use trellis_protocol::{ContentType, Frame, FrameCodec};

use super::{ControlChannel, InboundSink};

/// Latency sentinel meaning "not yet measured".
const LATENCY_UNKNOWN: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub heartbeat_interval: Duration,
    pub unresponsive_after: Duration,
    pub send_timeout: Duration,
    /// Outbound queue depth between callers and the writer task.
    pub outbound_queue: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            unresponsive_after: Duration::from_secs(5),
            send_timeout: Duration::from_secs(10),
            outbound_queue: 64,
        }
    }
}

/// One router's control channel. Dropping the struct does not close the
/// tasks; call [`ControlChannel::close`].
pub struct RouterChannel {
    router_id: String,
    /// Unique per accepted connection; ordering guarantees hold within
    /// one incarnation only.
    incarnation: String,
    outbound: mpsc::Sender<Frame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Frame>>>,
    next_correlation: AtomicU64,
    connected: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
    /// Instant of the oldest unanswered heartbeat, in ms since channel
    /// start; 0 = none outstanding.
    heartbeat_outstanding: Arc<AtomicU64>,
    started: Instant,
    config: ChannelConfig,
}

impl RouterChannel {
    /// Start the reader/writer/heartbeat tasks over `stream`. The
    /// handshake must already have completed; `hello` is the router's.
    pub fn start<S>(
        stream: S,
        hello: &Hello,
        config: ChannelConfig,
        sink: Arc<dyn InboundSink>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(config.outbound_queue);

        let channel = Arc::new(Self {
            router_id: hello.peer_id.clone(),
            incarnation: uuid::Uuid::new_v4().to_string(),
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            next_correlation: AtomicU64::new(1),
            connected: Arc::new(AtomicBool::new(true)),
            latency_ms: Arc::new(AtomicU64::new(LATENCY_UNKNOWN)),
            heartbeat_outstanding: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
            config,
        });

        tracing::info!(
            router_id = %channel.router_id,
            incarnation = %channel.incarnation,
            "channel started"
        );
        tokio::spawn(Self::writer_task(
            write_half,
            outbound_rx,
            channel.connected.clone(),
            channel.router_id.clone(),
        ));
        tokio::spawn(Self::reader_task(read_half, channel.clone(), sink));
        tokio::spawn(Self::heartbeat_task(channel.clone()));
        channel
    }

    pub fn incarnation(&self) -> &str {
        &self.incarnation
    }

    async fn writer_task(
        write_half: WriteHalf<impl AsyncRead + AsyncWrite + Send + 'static>,
        mut outbound_rx: mpsc::Receiver<Frame>,
        connected: Arc<AtomicBool>,
        router_id: String,
    ) {
        let mut framed = FramedWrite::new(write_half, FrameCodec);
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(err) = framed.send(frame).await {
                tracing::warn!(router_id = %router_id, error = %err, "channel write failed");
                break;
            }
        }
        connected.store(false, Ordering::Release);
    }

    async fn reader_task(
        read_half: ReadHalf<impl AsyncRead + AsyncWrite + Send + 'static>,
        channel: Arc<RouterChannel>,
        sink: Arc<dyn InboundSink>,
    ) {
        let mut framed = FramedRead::new(read_half, FrameCodec);
        loop {
            match framed.next().await {
                Some(Ok(frame)) => channel.handle_inbound(frame, &sink).await,
                Some(Err(err)) => {
                    // Any framing violation closes the channel; the
                    // router reconnects and re-runs discovery.
                    tracing::warn!(
                        router_id = %channel.router_id,
                        error = %err,
                        "closing channel on protocol error"
                    );
                    break;
                }
                None => break,
            }
        }
        channel.shutdown();
        sink.channel_closed(&channel.router_id).await;
    }

    async fn heartbeat_task(channel: Arc<RouterChannel>) {
        let mut ticker = tokio::time::interval(channel.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !channel.is_connected() {
                return;
            }

            let now_nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            let heartbeat = Heartbeat {
                sent_at_nanos: now_nanos,
            };
            let frame = match Frame::typed(ContentType::Heartbeat, &heartbeat) {
                Ok(frame) => frame,
                Err(_) => continue,
            };

            // Record the oldest outstanding heartbeat only.
            let elapsed = channel.started.elapsed().as_millis() as u64;
            let _ = channel.heartbeat_outstanding.compare_exchange(
                0,
                elapsed.max(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            if channel.outbound.send(frame).await.is_err() {
                return;
            }
        }
    }

    async fn handle_inbound(&self, frame: Frame, sink: &Arc<dyn InboundSink>) {
        // Correlated replies complete their waiter directly.
        if let Some(reply_for) = frame.reply_for() {
            let waiter = self.pending.lock().remove(&reply_for);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => {
                    tracing::warn!(
                        router_id = %self.router_id,
                        correlation_id = reply_for,
                        "reply for unknown request"
                    );
                }
            }
            return;
        }

        match frame.content_type {
            ContentType::Heartbeat => {
                // Echo so the router can measure its own round trip.
                let reply = Frame::new(ContentType::HeartbeatResponse, frame.body.clone());
                let _ = self.outbound.send(reply).await;
            }
            ContentType::HeartbeatResponse => {
                if let Ok(heartbeat) = frame.decode_body::<Heartbeat>() {
                    let now_nanos = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_nanos() as u64;
                    let rtt_ms = now_nanos.saturating_sub(heartbeat.sent_at_nanos) / 1_000_000;
                    self.latency_ms.store(rtt_ms, Ordering::Release);
                }
                self.heartbeat_outstanding.store(0, Ordering::Release);
            }
            _ => sink.handle(&self.router_id, frame).await,
        }
    }

    fn shutdown(&self) {
        self.connected.store(false, Ordering::Release);
        let waiters: Vec<(u64, oneshot::Sender<Frame>)> =
            self.pending.lock().drain().collect();
        let failed = waiters.len();
        drop(waiters); // dropping the senders fails the awaiting callers
        if failed > 0 {
            tracing::warn!(
                router_id = %self.router_id,
                failed_requests = failed,
                "failed in-flight requests on channel close"
            );
        }
    }
}

#[async_trait]
impl ControlChannel for RouterChannel {
    fn router_id(&self) -> &str {
        &self.router_id
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Channel(format!(
                "channel to {} is closed",
                self.router_id
            )));
        }
        self.outbound
            .send_timeout(frame, self.config.send_timeout)
            .await
            .map_err(|_| {
                Error::Channel(format!("send to router {} failed", self.router_id))
            })
    }

    async fn send_for_reply(&self, frame: Frame, timeout: Duration) -> Result<Frame> {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let frame = frame.with_correlation_id(correlation_id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, tx);

        if let Err(err) = self.send(frame).await {
            self.pending.lock().remove(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Channel(format!(
                "router {} disconnected before replying",
                self.router_id
            ))),
            Err(_) => {
                self.pending.lock().remove(&correlation_id);
                Err(Error::Timeout(
                    timeout,
                    format!("awaiting reply from router {}", self.router_id),
                ))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn is_unresponsive(&self) -> bool {
        let threshold_ms = self.config.unresponsive_after.as_millis() as u64;
        let latency = self.latency_ms.load(Ordering::Acquire);
        if latency != LATENCY_UNKNOWN && latency > threshold_ms {
            return true;
        }
        let outstanding = self.heartbeat_outstanding.load(Ordering::Acquire);
        if outstanding > 0 {
            let age_ms = (self.started.elapsed().as_millis() as u64).saturating_sub(outstanding);
            if age_ms > threshold_ms {
                return true;
            }
        }
        false
    }

    fn latency(&self) -> Option<Duration> {
        match self.latency_ms.load(Ordering::Acquire) {
            LATENCY_UNKNOWN => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn close(&self) {
        self.shutdown();
    }
}

/// Controller side of the handshake: read the router's `Hello`, answer
/// with ours. Returns the router's hello and the stream for
/// [`RouterChannel::start`].
///
/// The router must not pipeline frames behind its `Hello`; the exchange
/// is strictly one frame each way, so the temporary read framing here
/// cannot buffer past the hello.
pub async fn accept_handshake<S>(
    mut stream: S,
    controller_hello: &Hello,
    timeout: Duration,
) -> Result<(Hello, S)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let hello = tokio::time::timeout(timeout, async {
        let mut framed = FramedRead::new(&mut stream, FrameCodec);
        match framed.next().await {
            Some(Ok(frame)) if frame.content_type == ContentType::Hello => {
                frame.decode_body::<Hello>().map_err(Error::from)
            }
            Some(Ok(frame)) => Err(Error::Channel(format!(
                "expected hello, got {:?}",
                frame.content_type
            ))),
            Some(Err(err)) => Err(Error::from(err)),
            None => Err(Error::Channel("connection closed during handshake".into())),
        }
    })
    .await
    .map_err(|_| Error::Timeout(timeout, "awaiting router hello".into()))??;

    let reply = Frame::typed(ContentType::Hello, controller_hello)?;
    let mut framed = FramedWrite::new(&mut stream, FrameCodec);
    framed.send(reply).await?;
    Ok((hello, stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_protocol::msgs::Unroute;

    fn hello(peer_id: &str) -> Hello {
        Hello {
            peer_id: peer_id.into(),
            version: "1.0.0".into(),
            capabilities: vec![],
            listeners: vec![],
            last_data_state_index: None,
        }
    }

    struct CollectSink {
        frames: Mutex<Vec<(String, Frame)>>,
        closed: AtomicBool,
    }

    impl CollectSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl InboundSink for CollectSink {
        async fn handle(&self, router_id: &str, frame: Frame) {
            self.frames.lock().push((router_id.to_string(), frame));
        }
        async fn channel_closed(&self, _router_id: &str) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Drive the far end of a duplex pipe with a responder.
    fn spawn_router_peer(
        stream: tokio::io::DuplexStream,
        mut respond: impl FnMut(Frame) -> Option<Frame> + Send + 'static,
    ) {
        tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(stream);
            let mut reader = FramedRead::new(read_half, FrameCodec);
            let mut writer = FramedWrite::new(write_half, FrameCodec);
            while let Some(Ok(frame)) = reader.next().await {
                if let Some(reply) = respond(frame) {
                    if writer.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn send_for_reply_round_trip() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        spawn_router_peer(remote, |frame| {
            frame.correlation_id().map(|id| {
                Frame::new(ContentType::RouteResult, Vec::new())
                    .with_reply_for(id)
                    .with_success()
            })
        });

        let channel = RouterChannel::start(
            local,
            &hello("r1"),
            ChannelConfig::default(),
            CollectSink::new(),
        );
        let reply = channel
            .send_for_reply(
                Frame::typed(ContentType::Unroute, &Unroute {
                    circuit_id: "c1".into(),
                    now: true,
                })
                .unwrap(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn reply_timeout_is_a_timeout_error() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        spawn_router_peer(remote, |_| None); // never replies

        let channel = RouterChannel::start(
            local,
            &hello("r1"),
            ChannelConfig::default(),
            CollectSink::new(),
        );
        let err = channel
            .send_for_reply(
                Frame::new(ContentType::InspectRequest, Vec::new()),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(..)));
    }

    #[tokio::test]
    async fn peer_close_fails_pending_and_notifies_sink() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let sink = CollectSink::new();
        let channel = RouterChannel::start(
            local,
            &hello("r1"),
            ChannelConfig::default(),
            sink.clone(),
        );

        let pending = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .send_for_reply(
                        Frame::new(ContentType::InspectRequest, Vec::new()),
                        Duration::from_secs(5),
                    )
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(remote);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!channel.is_connected());
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn heartbeats_measure_latency() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        spawn_router_peer(remote, |frame| {
            (frame.content_type == ContentType::Heartbeat)
                .then(|| Frame::new(ContentType::HeartbeatResponse, frame.body.clone()))
        });

        let config = ChannelConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let channel =
            RouterChannel::start(local, &hello("r1"), config, CollectSink::new());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(channel.latency().is_some());
        assert!(!channel.is_unresponsive());
    }

    #[tokio::test]
    async fn unanswered_heartbeats_mark_unresponsive_not_closed() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        spawn_router_peer(remote, |_| None); // swallows heartbeats

        let config = ChannelConfig {
            heartbeat_interval: Duration::from_millis(10),
            unresponsive_after: Duration::from_millis(50),
            ..Default::default()
        };
        let channel =
            RouterChannel::start(local, &hello("r1"), config, CollectSink::new());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(channel.is_unresponsive());
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn handshake_exchanges_hellos() {
        let (local, remote) = tokio::io::duplex(64 * 1024);

        let router_side = tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(remote);
            let mut writer = FramedWrite::new(write_half, FrameCodec);
            let mut router_hello = hello("r1");
            router_hello.last_data_state_index = Some(40);
            writer
                .send(Frame::typed(ContentType::Hello, &router_hello).unwrap())
                .await
                .unwrap();
            let mut reader = FramedRead::new(read_half, FrameCodec);
            let reply = reader.next().await.unwrap().unwrap();
            reply.decode_body::<Hello>().unwrap()
        });

        let (router_hello, _stream) =
            accept_handshake(local, &hello("ctrl1"), Duration::from_secs(1))
                .await
                .unwrap();
        assert_eq!(router_hello.peer_id, "r1");
        assert_eq!(router_hello.last_data_state_index, Some(40));

        let controller_hello = router_side.await.unwrap();
        assert_eq!(controller_hello.peer_id, "ctrl1");
    }
}
