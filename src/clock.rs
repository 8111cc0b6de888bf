//! Monotonic time sources for task-system coordination
//!
//! Every timestamp in this crate comes from a [`MonotonicClock`]: the release
//! timestamp published by a barrier, the activation instant of a periodic
//! task, and the period boundaries it sleeps toward. All tasks in one system
//! must share a clock source so their readings are comparable.
//!
//! # Platform Support
//!
//! - **Linux**: `clock_gettime(CLOCK_MONOTONIC)` for nanosecond precision
//! - **Fallback**: `std::time::Instant` against a process-global anchor, so
//!   every instance still reports on a single shared epoch
//!
//! A [`ManualClock`] is provided for deterministic tests and harnesses.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

/// A monotonic instant with nanosecond resolution.
///
/// Timestamps are opaque readings from a [`MonotonicClock`]; only readings
/// taken from the same clock source are meaningfully comparable. The value is
/// nanoseconds since the source's epoch (boot time on Linux, first use for
/// the fallback source).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero reading, ordered before every other timestamp.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a timestamp from raw nanoseconds since the clock epoch.
    #[inline]
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    /// Returns the raw nanoseconds since the clock epoch.
    #[inline]
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Adds a duration, returning `None` on overflow.
    #[inline]
    #[must_use]
    pub fn checked_add(self, duration: Duration) -> Option<Timestamp> {
        let step = u64::try_from(duration.as_nanos()).ok()?;
        self.0.checked_add(step).map(Timestamp)
    }

    /// Adds a duration, clamping at the representable maximum.
    #[inline]
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Timestamp {
        self.checked_add(duration).unwrap_or(Timestamp(u64::MAX))
    }

    /// Duration elapsed since an earlier reading, zero if `earlier` is later.
    #[inline]
    #[must_use]
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}

/// Errors raised while constructing a clock source.
#[derive(Debug, Error)]
pub enum ClockError {
    /// The platform time source rejected the probe read.
    #[error("clock source unavailable: {0}")]
    SourceUnavailable(#[from] std::io::Error),
}

/// Trait for monotonic clock sources.
///
/// Implementations must never report a reading earlier than one previously
/// returned from the same instance. The trait is object-safe so callers can
/// share a single `Arc<dyn MonotonicClock>` across a whole task system.
pub trait MonotonicClock: Send + Sync {
    /// Returns the current reading.
    fn now(&self) -> Timestamp;

    /// Returns the name of the underlying source, for diagnostics.
    fn source_name(&self) -> &'static str;
}

/// Linux monotonic clock backed by `clock_gettime(CLOCK_MONOTONIC)`.
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct SystemClock {
    // High-water mark; a transient syscall failure re-reports the last
    // reading instead of going backwards.
    last_ns: AtomicU64,
}

#[cfg(target_os = "linux")]
impl SystemClock {
    /// Creates the clock, probing the time source once.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::SourceUnavailable`] if the probe read fails.
    pub fn new() -> Result<Self, ClockError> {
        let clock = Self {
            last_ns: AtomicU64::new(0),
        };
        clock.read_raw()?;
        Ok(clock)
    }

    #[inline]
    fn read_raw(&self) -> Result<u64, ClockError> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        // SAFETY: valid timespec pointer and clock ID
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };

        if ret == 0 {
            let secs_ns = (ts.tv_sec as u64).saturating_mul(1_000_000_000);
            Ok(secs_ns.saturating_add(ts.tv_nsec as u64))
        } else {
            Err(ClockError::SourceUnavailable(
                std::io::Error::last_os_error(),
            ))
        }
    }
}

#[cfg(target_os = "linux")]
impl MonotonicClock for SystemClock {
    #[inline]
    fn now(&self) -> Timestamp {
        match self.read_raw() {
            Ok(ns) => {
                let previous = self.last_ns.fetch_max(ns, Ordering::Relaxed);
                Timestamp(ns.max(previous))
            }
            Err(_) => Timestamp(self.last_ns.load(Ordering::Relaxed)),
        }
    }

    fn source_name(&self) -> &'static str {
        "Linux (clock_gettime CLOCK_MONOTONIC)"
    }
}

/// Portable monotonic clock measured against a process-global anchor.
///
/// Every instance shares one `Instant` anchor, so independently constructed
/// clocks in the same process agree on the epoch. Resolution and overhead
/// follow `std::time::Instant` on the host platform.
#[derive(Debug, Default)]
pub struct AnchoredClock;

impl AnchoredClock {
    /// Creates a clock on the shared process anchor.
    #[must_use]
    pub fn new() -> Self {
        // Pin the anchor eagerly so the epoch starts at construction, not at
        // the first reading.
        let _ = anchor();
        Self
    }
}

fn anchor() -> std::time::Instant {
    static ANCHOR: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    *ANCHOR.get_or_init(std::time::Instant::now)
}

impl MonotonicClock for AnchoredClock {
    #[inline]
    fn now(&self) -> Timestamp {
        let elapsed = anchor().elapsed();
        Timestamp(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
    }

    fn source_name(&self) -> &'static str {
        "Anchored (std::time::Instant)"
    }
}

/// Manually driven clock for deterministic tests and harnesses.
///
/// Readings only move when [`advance`](ManualClock::advance) or
/// [`set`](ManualClock::set) is called, which makes period arithmetic and
/// release-timestamp assertions exact.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward by `step`.
    pub fn advance(&self, step: Duration) {
        let step = u64::try_from(step.as_nanos()).unwrap_or(u64::MAX);
        self.now_ns.fetch_add(step, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute reading.
    ///
    /// Readings never move backwards; an earlier `at` is ignored.
    pub fn set(&self, at: Timestamp) {
        self.now_ns.fetch_max(at.as_nanos(), Ordering::SeqCst);
    }
}

impl MonotonicClock for ManualClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp(self.now_ns.load(Ordering::SeqCst))
    }

    fn source_name(&self) -> &'static str {
        "Manual"
    }
}

/// Creates the most precise monotonic clock available on this platform.
///
/// On Linux this is [`SystemClock`]; if the probe read fails, or on other
/// targets, the [`AnchoredClock`] fallback is used.
#[must_use]
pub fn create_monotonic_clock() -> std::sync::Arc<dyn MonotonicClock> {
    #[cfg(target_os = "linux")]
    {
        match SystemClock::new() {
            Ok(clock) => std::sync::Arc::new(clock),
            Err(_) => std::sync::Arc::new(AnchoredClock::new()),
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        std::sync::Arc::new(AnchoredClock::new())
    }
}
