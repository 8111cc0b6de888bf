#![forbid(unsafe_code)]

//! Metrics for the coordination primitives
//!
//! Each lock and barrier embeds its own counter block, updated with relaxed
//! atomics on the hot paths and read through point-in-time snapshots. With
//! the `metrics` feature enabled the counters are also emitted through the
//! `metrics` facade.

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "metrics")]
use metrics::counter;

/// Counters embedded in every k-exclusion lock.
#[derive(Debug, Default)]
pub struct LockMetrics {
    /// Slot grants, contended or not.
    pub acquires: AtomicU64,
    /// Slot grants that had to wait for capacity.
    pub contended_acquires: AtomicU64,
    /// Slots returned to the arena.
    pub releases: AtomicU64,
    /// Releases that admitted a blocked waiter.
    pub handoffs: AtomicU64,
    /// Acquires abandoned at their deadline.
    pub timeouts: AtomicU64,
    /// Releases rejected because the caller held no slot.
    pub not_holder_errors: AtomicU64,
}

impl LockMetrics {
    pub(crate) fn record_acquire(&self, contended: bool) {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.contended_acquires.fetch_add(1, Ordering::Relaxed);
        }

        #[cfg(feature = "metrics")]
        counter!("phasesync_lock_acquires_total").increment(1);
    }

    pub(crate) fn record_release(&self, handoff: bool) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        if handoff {
            self.handoffs.fetch_add(1, Ordering::Relaxed);
        }

        #[cfg(feature = "metrics")]
        counter!("phasesync_lock_releases_total").increment(1);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("phasesync_lock_timeouts_total").increment(1);
    }

    pub(crate) fn record_not_holder(&self) {
        self.not_holder_errors.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("phasesync_lock_not_holder_errors_total").increment(1);
    }

    /// Takes a point-in-time snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            acquires: self.acquires.load(Ordering::Relaxed),
            contended_acquires: self.contended_acquires.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            handoffs: self.handoffs.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            not_holder_errors: self.not_holder_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`LockMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMetricsSnapshot {
    /// Slot grants, contended or not.
    pub acquires: u64,
    /// Slot grants that had to wait for capacity.
    pub contended_acquires: u64,
    /// Slots returned to the arena.
    pub releases: u64,
    /// Releases that admitted a blocked waiter.
    pub handoffs: u64,
    /// Acquires abandoned at their deadline.
    pub timeouts: u64,
    /// Releases rejected because the caller held no slot.
    pub not_holder_errors: u64,
}

/// Counters embedded in every release barrier.
#[derive(Debug, Default)]
pub struct BarrierMetrics {
    /// Tasks that registered as waiting.
    pub registrations: AtomicU64,
    /// Registrations arriving after the release already fired.
    pub late_registrations: AtomicU64,
    /// Successful release events (at most one per barrier).
    pub releases: AtomicU64,
    /// Waiters woken by the release broadcast.
    pub waiters_released: AtomicU64,
    /// Registrations abandoned at their deadline.
    pub timeouts: AtomicU64,
}

impl BarrierMetrics {
    pub(crate) fn record_registration(&self, late: bool) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
        if late {
            self.late_registrations.fetch_add(1, Ordering::Relaxed);
        }

        #[cfg(feature = "metrics")]
        counter!("phasesync_barrier_registrations_total").increment(1);
    }

    pub(crate) fn record_release(&self, waiters: usize) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.waiters_released
            .fetch_add(waiters as u64, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("phasesync_barrier_releases_total").increment(1);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("phasesync_barrier_timeouts_total").increment(1);
    }

    /// Takes a point-in-time snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> BarrierMetricsSnapshot {
        BarrierMetricsSnapshot {
            registrations: self.registrations.load(Ordering::Relaxed),
            late_registrations: self.late_registrations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            waiters_released: self.waiters_released.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`BarrierMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierMetricsSnapshot {
    /// Tasks that registered as waiting.
    pub registrations: u64,
    /// Registrations arriving after the release already fired.
    pub late_registrations: u64,
    /// Successful release events (at most one per barrier).
    pub releases: u64,
    /// Waiters woken by the release broadcast.
    pub waiters_released: u64,
    /// Registrations abandoned at their deadline.
    pub timeouts: u64,
}
