#![forbid(unsafe_code)]

//! Task-system release barrier
//!
//! A [`ReleaseBarrier`] lets independently started periodic tasks begin their
//! first period at one shared instant instead of drifting apart. Each task
//! registers as waiting once its setup is done and blocks; a coordinator
//! watches the waiter count and fires [`release`](ReleaseBarrier::release)
//! exactly once, publishing a single release timestamp that every waiter
//! observes identically.
//!
//! The release transition is linearizable: it happens under the barrier's
//! internal mutex, so no waiter can observe the barrier as unreleased after
//! any other waiter has obtained the release timestamp. The only polling in
//! this module is the coordinator's own decision loop in
//! [`release_when_assembled`](ReleaseBarrier::release_when_assembled), which
//! is bounded by its `poll_interval` and adds at most one interval of latency
//! to the release.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::clock::{MonotonicClock, Timestamp};
use crate::metrics::{BarrierMetrics, BarrierMetricsSnapshot};
use crate::namespace::Namespace;
use crate::task::TaskId;

#[cfg(feature = "tracing")]
use tracing::{debug, info};

/// Errors reported by [`ReleaseBarrier`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BarrierError {
    /// The task already registered on this barrier; registering twice is a
    /// caller error.
    #[error("task {0:?} is already waiting on this barrier")]
    AlreadyWaiting(TaskId),

    /// The barrier fired already; the original timestamp stands.
    #[error("barrier was already released")]
    AlreadyReleased,

    /// A reopen disagreed with the task-system size the name was created
    /// with.
    #[error("barrier '{name}' is open for {existing} waiters, requested {requested}")]
    SizeMismatch {
        /// Barrier name.
        name: String,
        /// Size the barrier was created with.
        existing: usize,
        /// Size this open requested.
        requested: usize,
    },

    /// The registration deadline elapsed before the release fired.
    #[error("timed out waiting for release")]
    Timeout,
}

#[derive(Debug)]
struct BarrierState {
    registered: HashSet<TaskId>,
    released: bool,
    release_timestamp: Option<Timestamp>,
}

#[derive(Debug)]
struct BarrierShared {
    name: String,
    expected_waiters: usize,
    state: Mutex<BarrierState>,
    released_cv: Condvar,
    metrics: BarrierMetrics,
}

impl BarrierShared {
    fn new(name: &str, expected_waiters: usize) -> Self {
        Self {
            name: name.to_owned(),
            expected_waiters,
            state: Mutex::new(BarrierState {
                registered: HashSet::new(),
                released: false,
                release_timestamp: None,
            }),
            released_cv: Condvar::new(),
            metrics: BarrierMetrics::default(),
        }
    }
}

fn barrier_namespace() -> &'static Namespace<BarrierShared> {
    static BARRIERS: OnceLock<Namespace<BarrierShared>> = OnceLock::new();
    BARRIERS.get_or_init(Namespace::new)
}

/// One-shot rendezvous that publishes a shared release timestamp.
///
/// Handles are cheap to clone; clones and same-name reopens share one
/// barrier. A barrier releases at most once and is never reset.
#[derive(Debug, Clone)]
pub struct ReleaseBarrier {
    shared: Arc<BarrierShared>,
}

impl ReleaseBarrier {
    /// Opens the barrier named `name`, creating it on first open.
    ///
    /// `expected_waiters` is the task-system size the coordinator will wait
    /// for. Opening is idempotent per name within the process group.
    ///
    /// # Errors
    ///
    /// [`BarrierError::SizeMismatch`] when the name is already open with a
    /// different `expected_waiters`.
    pub fn open(name: &str, expected_waiters: usize) -> Result<Self, BarrierError> {
        let (shared, _created) =
            barrier_namespace().open_or_insert(name, || BarrierShared::new(name, expected_waiters));

        if shared.expected_waiters != expected_waiters {
            return Err(BarrierError::SizeMismatch {
                name: name.to_owned(),
                existing: shared.expected_waiters,
                requested: expected_waiters,
            });
        }

        #[cfg(feature = "tracing")]
        debug!(name, expected_waiters, "release barrier opened");

        Ok(Self { shared })
    }

    /// Registers the calling task as waiting and blocks until release.
    ///
    /// Returns the release timestamp, identical for every waiter. A task that
    /// registers after the barrier fired observes the published timestamp
    /// immediately; the barrier tolerates a coordinator that fires before the
    /// nominal count is reached.
    ///
    /// # Errors
    ///
    /// [`BarrierError::AlreadyWaiting`] on a repeated registration from the
    /// same task.
    pub fn register_waiting(&self, task: TaskId) -> Result<Timestamp, BarrierError> {
        self.register_inner(task, None)
    }

    /// [`register_waiting`](Self::register_waiting) with a deadline.
    ///
    /// # Errors
    ///
    /// [`BarrierError::Timeout`] when `timeout` elapses first; the task is
    /// deregistered so a later retry is possible.
    pub fn register_waiting_timeout(
        &self,
        task: TaskId,
        timeout: Duration,
    ) -> Result<Timestamp, BarrierError> {
        self.register_inner(task, Instant::now().checked_add(timeout))
    }

    fn register_inner(
        &self,
        task: TaskId,
        deadline: Option<Instant>,
    ) -> Result<Timestamp, BarrierError> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();

        if !state.registered.insert(task) {
            return Err(BarrierError::AlreadyWaiting(task));
        }

        if state.released {
            shared.metrics.record_registration(true);
            if let Some(at) = state.release_timestamp {
                return Ok(at);
            }
        }
        shared.metrics.record_registration(false);

        #[cfg(feature = "tracing")]
        debug!(name = %shared.name, ?task, waiting = state.registered.len(), "task waiting for release");

        loop {
            let timed_out = match deadline {
                Some(at) => shared.released_cv.wait_until(&mut state, at).timed_out(),
                None => {
                    shared.released_cv.wait(&mut state);
                    false
                }
            };

            if state.released {
                if let Some(at) = state.release_timestamp {
                    return Ok(at);
                }
            }

            if timed_out {
                state.registered.remove(&task);
                shared.metrics.record_timeout();
                return Err(BarrierError::Timeout);
            }
        }
    }

    /// Number of tasks registered so far. Non-blocking coordinator poll.
    #[must_use]
    pub fn observe_waiter_count(&self) -> usize {
        self.shared.state.lock().registered.len()
    }

    /// Fires the barrier at `at`, waking every waiter simultaneously.
    ///
    /// Callable regardless of the current waiter count; the count policy is
    /// the coordinator's decision, not the barrier's.
    ///
    /// # Errors
    ///
    /// [`BarrierError::AlreadyReleased`] on any call after the first; the
    /// original timestamp is untouched.
    pub fn release(&self, at: Timestamp) -> Result<(), BarrierError> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();

        if state.released {
            return Err(BarrierError::AlreadyReleased);
        }
        state.released = true;
        state.release_timestamp = Some(at);

        let woken = state.registered.len();
        shared.released_cv.notify_all();
        shared.metrics.record_release(woken);

        #[cfg(feature = "tracing")]
        info!(name = %shared.name, %at, woken, "task system released");

        Ok(())
    }

    /// Coordinator decision loop: poll until the task system is assembled,
    /// then release at the clock's current reading.
    ///
    /// Polls [`observe_waiter_count`](Self::observe_waiter_count) every
    /// `poll_interval` until it reaches the expected waiter count, then calls
    /// [`release`](Self::release) with `clock.now()` and returns the
    /// published timestamp. The poll is bounded and low-frequency; it adds at
    /// most one `poll_interval` of latency between the last task registering
    /// and the release.
    ///
    /// # Errors
    ///
    /// [`BarrierError::Timeout`] when `patience` elapses before the system
    /// assembles; [`BarrierError::AlreadyReleased`] if someone else fired the
    /// barrier meanwhile.
    pub fn release_when_assembled(
        &self,
        clock: &dyn MonotonicClock,
        poll_interval: Duration,
        patience: Option<Duration>,
    ) -> Result<Timestamp, BarrierError> {
        let give_up = patience.and_then(|p| Instant::now().checked_add(p));

        loop {
            if self.observe_waiter_count() >= self.shared.expected_waiters {
                let at = clock.now();
                self.release(at)?;
                return Ok(at);
            }
            if let Some(at) = give_up {
                if Instant::now() >= at {
                    return Err(BarrierError::Timeout);
                }
            }
            std::thread::sleep(poll_interval);
        }
    }

    /// Whether the barrier has fired.
    #[must_use]
    pub fn released(&self) -> bool {
        self.shared.state.lock().released
    }

    /// The published release timestamp, `Some` exactly when
    /// [`released`](Self::released) is true.
    #[must_use]
    pub fn release_timestamp(&self) -> Option<Timestamp> {
        self.shared.state.lock().release_timestamp
    }

    /// The barrier's name in the shared namespace.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Task-system size the coordinator waits for.
    #[must_use]
    pub fn expected_waiters(&self) -> usize {
        self.shared.expected_waiters
    }

    /// Snapshot of the barrier's counters.
    #[must_use]
    pub fn metrics(&self) -> BarrierMetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}
