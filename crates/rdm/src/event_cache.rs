//! Bounded ordered log of indexed change-sets.

use std::collections::VecDeque;

use parking_lot::Mutex;
use trellis_domain::{Error, Result};
use trellis_protocol::ChangeSet;

enum Mode {
    /// Ring of the most recent change-sets, in index order.
    Logging {
        capacity: usize,
        log: VecDeque<ChangeSet>,
    },
    /// Remembers only the last applied index.
    Forgetful,
}

struct Inner {
    mode: Mode,
    current_index: u64,
    initialized: bool,
}

/// Change-set cache shared by sender and receiver data models.
///
/// `store` is the single entry point for applying change-sets: the apply
/// callback runs under the cache lock, so `while_locked` callers observe
/// a consistent `(index, model)` pair.
pub struct EventCache {
    inner: Mutex<Inner>,
}

impl EventCache {
    pub fn logging(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                mode: Mode::Logging {
                    capacity,
                    log: VecDeque::new(),
                },
                current_index: 0,
                initialized: false,
            }),
        }
    }

    pub fn forgetful() -> Self {
        Self {
            inner: Mutex::new(Inner {
                mode: Mode::Forgetful,
                current_index: 0,
                initialized: false,
            }),
        }
    }

    /// Store a change-set, invoking `apply` under the cache lock when it
    /// is accepted. Returns whether the change-set was applied.
    ///
    /// - index ≤ current: dropped silently (idempotent replay)
    /// - index = current + 1: applied
    /// - index > current + 1: accepted by a forgetful cache (jump);
    ///   rejected by a logging cache as a gap fault
    /// - full-state change-sets reset the cache at their index
    pub fn store<F>(&self, change: &ChangeSet, apply: F) -> Result<bool>
    where
        F: FnOnce(u64, &ChangeSet),
    {
        let mut inner = self.inner.lock();

        if change.is_full_state {
            if let Mode::Logging { log, .. } = &mut inner.mode {
                log.clear();
            }
            inner.current_index = change.index;
            inner.initialized = true;
            apply(change.index, change);
            return Ok(true);
        }

        if inner.initialized {
            if change.index <= inner.current_index {
                return Ok(false);
            }
            if change.index != inner.current_index + 1 {
                if let Mode::Logging { .. } = inner.mode {
                    return Err(Error::GapFault {
                        expected: inner.current_index + 1,
                        actual: change.index,
                    });
                }
            }
        }

        inner.current_index = change.index;
        inner.initialized = true;
        if let Mode::Logging { capacity, log } = &mut inner.mode {
            if *capacity > 0 {
                if log.len() == *capacity {
                    log.pop_front();
                }
                log.push_back(change.clone());
            }
        }
        apply(change.index, change);
        Ok(true)
    }

    /// Run `f` with `(current_index, initialized)` under the same lock
    /// `store` applies under.
    pub fn while_locked<F: FnOnce(u64, bool)>(&self, f: F) {
        let inner = self.inner.lock();
        f(inner.current_index, inner.initialized);
    }

    /// Change-sets with index greater than `after_index`, in order.
    ///
    /// Fails with a gap fault when the requested span has aged out of the
    /// log; the caller falls back to a full data-state re-seed.
    pub fn replay_from(&self, after_index: u64) -> Result<Vec<ChangeSet>> {
        let inner = self.inner.lock();
        let log = match &inner.mode {
            Mode::Logging { log, .. } => log,
            Mode::Forgetful => {
                return Err(Error::Replication(
                    "forgetful event cache does not support replay".into(),
                ))
            }
        };

        if after_index >= inner.current_index {
            return Ok(Vec::new());
        }

        if let Some(oldest) = log.front() {
            if after_index + 1 < oldest.index {
                return Err(Error::GapFault {
                    expected: after_index + 1,
                    actual: oldest.index,
                });
            }
        } else {
            return Err(Error::GapFault {
                expected: after_index + 1,
                actual: inner.current_index,
            });
        }

        Ok(log
            .iter()
            .filter(|cs| cs.index > after_index)
            .cloned()
            .collect())
    }

    /// Seed the index without storing anything (snapshot load).
    pub fn set_current_index(&self, index: u64) {
        let mut inner = self.inner.lock();
        inner.current_index = index;
        inner.initialized = true;
    }

    pub fn current_index(&self) -> Option<u64> {
        let inner = self.inner.lock();
        inner.initialized.then_some(inner.current_index)
    }
}
