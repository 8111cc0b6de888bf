#![forbid(unsafe_code)]
#![allow(clippy::significant_drop_tightening)] // arena guards are held for short durations

//! K-exclusion lock with stable slot assignment
//!
//! A [`KExclusionLock`] admits up to `capacity` concurrent holders, each
//! assigned the lowest free slot index in `[0, capacity)`. Slots partition a
//! scarce resource into `capacity` disjoint shares (for example, `capacity`
//! parallel hardware units), so a holder can use its slot index directly as a
//! resource selector.
//!
//! Locks are named: every opener of the same name in the process group shares
//! one slot arena (see [`crate::namespace`]).
//!
//! # Fairness
//!
//! Admission is strict FIFO by arrival: each blocked acquirer takes a ticket
//! and only the head ticket may claim a freed slot. Wakeups are broadcast
//! internally, but exactly one waiter is admitted per released slot.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::metrics::{LockMetrics, LockMetricsSnapshot};
use crate::namespace::Namespace;
use crate::task::TaskId;

#[cfg(feature = "tracing")]
use tracing::{debug, trace};

/// Errors reported by [`KExclusionLock`] operations.
///
/// All variants are local, synchronous, and recoverable by the caller; the
/// holder/slot invariants stay intact after any error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    /// Capacity must satisfy `1 <= capacity <= max_waiters`, and reopening a
    /// name must agree with the existing geometry.
    #[error("invalid capacity {capacity} for max_waiters {max_waiters}")]
    InvalidCapacity {
        /// Requested number of concurrent holders.
        capacity: usize,
        /// Requested waiter bound.
        max_waiters: usize,
    },

    /// The lock was closed, so the handle no longer resolves to an arena.
    #[error("lock '{0}' is closed")]
    InvalidHandle(String),

    /// The caller does not currently hold the slot it tried to use.
    #[error("caller does not hold a slot on this lock")]
    NotHolder,

    /// The task already holds a slot and may not acquire a second one.
    #[error("task {0:?} already holds a slot on this lock")]
    AlreadyHolder(TaskId),

    /// The acquire deadline elapsed before a slot became free.
    #[error("timed out waiting for a free slot")]
    Timeout,
}

/// A granted slot: which task holds which slot index.
///
/// Created by [`KExclusionLock::acquire`] and consumed by
/// [`KExclusionLock::release`]. Slot indices held concurrently are pairwise
/// distinct and lie in `[0, capacity)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAssignment {
    holder: TaskId,
    slot_index: usize,
}

impl SlotAssignment {
    /// The task the slot was granted to.
    #[must_use]
    pub fn holder(&self) -> TaskId {
        self.holder
    }

    /// The granted slot index in `[0, capacity)`.
    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }
}

// Slot arena plus FIFO ticket queue, all mutated under one mutex.
#[derive(Debug)]
struct ArenaState {
    slots: Vec<Option<TaskId>>, // index = slot
    wait_queue: VecDeque<u64>,  // arrival tickets, front is next admitted
    next_ticket: u64,
    closed: bool,
}

impl ArenaState {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            wait_queue: VecDeque::new(),
            next_ticket: 0,
            closed: false,
        }
    }

    fn lowest_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    fn holder_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn slot_of(&self, holder: TaskId) -> Option<usize> {
        self.slots.iter().position(|s| *s == Some(holder))
    }

    // Head-of-queue admission; returns the claimed slot.
    fn try_admit(&mut self, ticket: u64, holder: TaskId) -> Option<usize> {
        if self.wait_queue.front() != Some(&ticket) {
            return None;
        }
        let slot = self.lowest_free_slot()?;
        self.wait_queue.pop_front();
        self.slots[slot] = Some(holder);
        Some(slot)
    }

    fn drop_ticket(&mut self, ticket: u64) {
        self.wait_queue.retain(|t| *t != ticket);
    }
}

#[derive(Debug)]
struct LockShared {
    name: String,
    capacity: usize,
    max_waiters: usize,
    state: Mutex<ArenaState>,
    admitted: Condvar,
    metrics: LockMetrics,
}

impl LockShared {
    fn new(name: &str, max_waiters: usize, capacity: usize) -> Self {
        Self {
            name: name.to_owned(),
            capacity,
            max_waiters,
            state: Mutex::new(ArenaState::new(capacity)),
            admitted: Condvar::new(),
            metrics: LockMetrics::default(),
        }
    }
}

fn lock_namespace() -> &'static Namespace<LockShared> {
    static LOCKS: OnceLock<Namespace<LockShared>> = OnceLock::new();
    LOCKS.get_or_init(Namespace::new)
}

/// Named lock admitting up to `capacity` concurrent holders.
///
/// Handles are cheap to clone; clones and same-name reopens share one arena.
#[derive(Debug, Clone)]
pub struct KExclusionLock {
    shared: Arc<LockShared>,
}

impl KExclusionLock {
    /// Opens the lock named `name`, creating it on first open.
    ///
    /// `max_waiters` declares the task-system size the arena is provisioned
    /// for; `capacity` is the number of concurrent holders. Opening is
    /// idempotent per name within the process group.
    ///
    /// # Errors
    ///
    /// [`LockError::InvalidCapacity`] when `capacity < 1`,
    /// `capacity > max_waiters`, or the name is already open with different
    /// geometry.
    pub fn open(name: &str, max_waiters: usize, capacity: usize) -> Result<Self, LockError> {
        if capacity < 1 || capacity > max_waiters {
            return Err(LockError::InvalidCapacity {
                capacity,
                max_waiters,
            });
        }

        loop {
            let (shared, created) =
                lock_namespace().open_or_insert(name, || LockShared::new(name, max_waiters, capacity));

            if !created {
                if shared.capacity != capacity || shared.max_waiters != max_waiters {
                    return Err(LockError::InvalidCapacity {
                        capacity,
                        max_waiters,
                    });
                }
                // Lost a race against close: retry against a fresh generation.
                if shared.state.lock().closed {
                    lock_namespace().remove_matching(name, &shared);
                    continue;
                }
            }

            #[cfg(feature = "tracing")]
            debug!(name, capacity, max_waiters, created, "k-exclusion lock opened");

            return Ok(Self { shared });
        }
    }

    /// Blocks until a slot is free, then claims the lowest free slot index.
    ///
    /// The wait is a cooperative block on a condition variable, not a busy
    /// loop. Admission is FIFO among waiters.
    ///
    /// # Errors
    ///
    /// [`LockError::InvalidHandle`] if the lock is closed (before or during
    /// the wait), [`LockError::AlreadyHolder`] if `holder` already holds a
    /// slot.
    pub fn acquire(&self, holder: TaskId) -> Result<SlotAssignment, LockError> {
        self.acquire_inner(holder, None)
    }

    /// [`acquire`](Self::acquire) with a deadline.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] when `timeout` elapses before a slot is
    /// granted; the waiter is removed from the queue and may retry.
    pub fn acquire_timeout(
        &self,
        holder: TaskId,
        timeout: Duration,
    ) -> Result<SlotAssignment, LockError> {
        self.acquire_inner(holder, Instant::now().checked_add(timeout))
    }

    fn acquire_inner(
        &self,
        holder: TaskId,
        deadline: Option<Instant>,
    ) -> Result<SlotAssignment, LockError> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();

        if state.closed {
            return Err(LockError::InvalidHandle(shared.name.clone()));
        }
        if state.slot_of(holder).is_some() {
            return Err(LockError::AlreadyHolder(holder));
        }

        // Fast path: free capacity and nobody queued ahead of us.
        if state.wait_queue.is_empty() {
            if let Some(slot) = state.lowest_free_slot() {
                state.slots[slot] = Some(holder);
                shared.metrics.record_acquire(false);

                #[cfg(feature = "tracing")]
                trace!(name = %shared.name, ?holder, slot, "slot granted");

                return Ok(SlotAssignment {
                    holder,
                    slot_index: slot,
                });
            }
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.wait_queue.push_back(ticket);

        #[cfg(feature = "tracing")]
        trace!(name = %shared.name, ?holder, ticket, "acquire blocked");

        loop {
            let timed_out = match deadline {
                Some(at) => shared.admitted.wait_until(&mut state, at).timed_out(),
                None => {
                    shared.admitted.wait(&mut state);
                    false
                }
            };

            if state.closed {
                state.drop_ticket(ticket);
                return Err(LockError::InvalidHandle(shared.name.clone()));
            }

            if let Some(slot) = state.try_admit(ticket, holder) {
                // Capacity may remain for the next ticket in line.
                if !state.wait_queue.is_empty() && state.lowest_free_slot().is_some() {
                    shared.admitted.notify_all();
                }
                shared.metrics.record_acquire(true);

                #[cfg(feature = "tracing")]
                trace!(name = %shared.name, ?holder, slot, "slot granted after wait");

                return Ok(SlotAssignment {
                    holder,
                    slot_index: slot,
                });
            }

            if timed_out {
                state.drop_ticket(ticket);
                // Our departure may make the new head admissible.
                shared.admitted.notify_all();
                shared.metrics.record_timeout();
                return Err(LockError::Timeout);
            }
        }
    }

    /// Relinquishes a held slot and admits the next waiter, if any.
    ///
    /// # Errors
    ///
    /// [`LockError::NotHolder`] unless the arena currently records
    /// `assignment.holder()` in `assignment.slot_index()`; the holder set is
    /// left untouched on error. [`LockError::InvalidHandle`] if closed.
    pub fn release(&self, assignment: SlotAssignment) -> Result<(), LockError> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();

        if state.closed {
            return Err(LockError::InvalidHandle(shared.name.clone()));
        }

        let slot = assignment.slot_index;
        if slot >= state.slots.len() || state.slots[slot] != Some(assignment.holder) {
            shared.metrics.record_not_holder();
            return Err(LockError::NotHolder);
        }

        state.slots[slot] = None;
        let handoff = !state.wait_queue.is_empty();
        if handoff {
            shared.admitted.notify_all();
        }
        shared.metrics.record_release(handoff);

        #[cfg(feature = "tracing")]
        trace!(name = %shared.name, holder = ?assignment.holder, slot, handoff, "slot released");

        Ok(())
    }

    /// Returns the slot index `holder` currently occupies, without blocking.
    ///
    /// # Errors
    ///
    /// [`LockError::NotHolder`] if the task holds no slot,
    /// [`LockError::InvalidHandle`] if closed.
    pub fn query_slot(&self, holder: TaskId) -> Result<usize, LockError> {
        let state = self.shared.state.lock();
        if state.closed {
            return Err(LockError::InvalidHandle(self.shared.name.clone()));
        }
        state.slot_of(holder).ok_or(LockError::NotHolder)
    }

    /// Closes the lock: wakes every waiter with `InvalidHandle` and retires
    /// the name from the namespace. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        lock_namespace().remove_matching(&self.shared.name, &self.shared);
        self.shared.admitted.notify_all();

        #[cfg(feature = "tracing")]
        debug!(name = %self.shared.name, "k-exclusion lock closed");
    }

    /// The lock's name in the shared namespace.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Maximum number of concurrent holders.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Declared task-system size the arena was provisioned for.
    #[must_use]
    pub fn max_waiters(&self) -> usize {
        self.shared.max_waiters
    }

    /// Number of slots currently held.
    #[must_use]
    pub fn holder_count(&self) -> usize {
        self.shared.state.lock().holder_count()
    }

    /// Number of acquirers currently blocked.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.shared.state.lock().wait_queue.len()
    }

    /// Snapshot of the lock's counters.
    #[must_use]
    pub fn metrics(&self) -> LockMetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}
