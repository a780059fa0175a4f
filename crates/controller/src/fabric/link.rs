//! Inter-router links.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Link lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Pending,
    Connected,
    Failed,
}

#[derive(Debug)]
struct StateEntry {
    state: LinkState,
    since: DateTime<Utc>,
}

/// A bidirectional channel between two routers. Latency is tracked per
/// direction; the traversal cost is the static cost plus both measured
/// latencies, so unmeasured links start expensive and become attractive
/// as real measurements arrive.
pub struct Link {
    pub id: String,
    pub src: String,
    pub dst: String,
    pub protocol: String,
    pub dial_address: String,
    pub static_cost: u16,
    iteration: AtomicU32,
    state: Mutex<StateEntry>,
    src_latency_ms: AtomicU64,
    dst_latency_ms: AtomicU64,
    last_activity: Mutex<DateTime<Utc>>,
}

impl Link {
    pub fn new(
        id: impl Into<String>,
        src: impl Into<String>,
        dst: impl Into<String>,
        protocol: impl Into<String>,
        dial_address: impl Into<String>,
        iteration: u32,
        initial_latency_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            src: src.into(),
            dst: dst.into(),
            protocol: protocol.into(),
            dial_address: dial_address.into(),
            static_cost: 1,
            iteration: AtomicU32::new(iteration),
            state: Mutex::new(StateEntry {
                state: LinkState::Pending,
                since: Utc::now(),
            }),
            src_latency_ms: AtomicU64::new(initial_latency_ms),
            dst_latency_ms: AtomicU64::new(initial_latency_ms),
            last_activity: Mutex::new(Utc::now()),
        }
    }

    pub fn with_static_cost(mut self, cost: u16) -> Self {
        self.static_cost = cost;
        self
    }

    pub fn state(&self) -> LinkState {
        self.state.lock().state
    }

    /// Timestamp of the last state transition.
    pub fn state_since(&self) -> DateTime<Utc> {
        self.state.lock().since
    }

    pub fn set_state(&self, state: LinkState) {
        let mut entry = self.state.lock();
        if entry.state != state {
            entry.state = state;
            entry.since = Utc::now();
        }
    }

    pub fn is_usable(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn iteration(&self) -> u32 {
        self.iteration.load(Ordering::Relaxed)
    }

    pub fn set_iteration(&self, iteration: u32) {
        self.iteration.store(iteration, Ordering::Relaxed);
    }

    pub fn set_src_latency(&self, ms: u64) {
        self.src_latency_ms.store(ms, Ordering::Relaxed);
        self.touch();
    }

    pub fn set_dst_latency(&self, ms: u64) {
        self.dst_latency_ms.store(ms, Ordering::Relaxed);
        self.touch();
    }

    /// Record traffic or heartbeat activity (dead-link scan input).
    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Traversal cost: static cost plus measured latency both ways.
    pub fn cost(&self) -> u64 {
        self.static_cost as u64
            + self.src_latency_ms.load(Ordering::Relaxed)
            + self.dst_latency_ms.load(Ordering::Relaxed)
    }

    /// The other endpoint, given one of the link's routers.
    pub fn other_router(&self, router_id: &str) -> Option<&str> {
        if self.src == router_id {
            Some(&self.dst)
        } else if self.dst == router_id {
            Some(&self.src)
        } else {
            None
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("state", &self.state())
            .field("cost", &self.cost())
            .finish()
    }
}
