//! Adaptive in-flight rate limiter.
//!
//! Keeps a target window of in-flight work; admissions beyond the
//! window fail with `Overloaded` instead of queueing. The window grows
//! on completed work and halves when work times out, so sustained
//! slowness sheds load early. The same limiter gates command dispatch
//! and connection-handshake admission.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use trellis_domain::{Error, Result};

struct Shared {
    in_flight: AtomicUsize,
    window: AtomicUsize,
    min_window: usize,
    max_window: usize,
}

pub struct AdaptiveLimiter {
    shared: Arc<Shared>,
}

/// Releases the slot on drop; call [`InFlightGuard::failed`] first when
/// the work timed out, to shrink the window.
pub struct InFlightGuard {
    shared: Arc<Shared>,
    outcome_recorded: bool,
}

impl AdaptiveLimiter {
    pub fn new(min_window: usize, max_window: usize) -> Self {
        let min_window = min_window.max(1);
        let max_window = max_window.max(min_window);
        Self {
            shared: Arc::new(Shared {
                in_flight: AtomicUsize::new(0),
                window: AtomicUsize::new(max_window),
                min_window,
                max_window,
            }),
        }
    }

    pub fn acquire(&self) -> Result<InFlightGuard> {
        let window = self.shared.window.load(Ordering::Acquire);
        let admitted = self
            .shared
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < window).then_some(current + 1)
            })
            .is_ok();
        if !admitted {
            return Err(Error::Overloaded(format!(
                "at limit of {window} in-flight requests"
            )));
        }
        Ok(InFlightGuard {
            shared: self.shared.clone(),
            outcome_recorded: false,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn window(&self) -> usize {
        self.shared.window.load(Ordering::Acquire)
    }
}

impl InFlightGuard {
    /// Record a timed-out or shed piece of work: halve the window.
    pub fn failed(mut self) {
        let shared = &self.shared;
        let window = shared.window.load(Ordering::Acquire);
        let next = (window / 2).max(shared.min_window);
        shared.window.store(next, Ordering::Release);
        self.outcome_recorded = true;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.outcome_recorded {
            // Completed work opens the window back up, one admission at
            // a time.
            let _ = self.shared.window.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |window| (window < self.shared.max_window).then_some(window + 1),
            );
        }
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
