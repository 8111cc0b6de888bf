//! Coordination primitives for periodic real-time task systems
//!
//! `phasesync` provides the pieces a set of periodic tasks needs to start in
//! phase and to share scarce resource instances without losing fairness:
//!
//! - [`KExclusionLock`]: a named k-exclusion lock where up to `k` tasks hold
//!   distinct resource slots concurrently and further tasks queue in FIFO
//!   order
//! - [`ReleaseBarrier`]: a one-shot rendezvous that releases an entire task
//!   system at a single shared timestamp
//! - [`PeriodicTaskContext`]: the lifecycle of one periodic task, with job
//!   numbering and period boundaries anchored to its activation instant
//! - [`MonotonicClock`]: the shared monotonic time source all of the above
//!   read from
//!
//! Primitives are looked up by name, so independently started components of
//! one system coordinate by agreeing on strings rather than by passing
//! handles around.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use phasesync::{KExclusionLock, TaskId};
//!
//! # fn main() -> Result<(), phasesync::LockError> {
//! // A system of up to 16 tasks sharing three identical devices.
//! let lock = KExclusionLock::open("/devices/encoder", 16, 3)?;
//!
//! let grant = lock.acquire(TaskId(0))?;
//! assert!(grant.slot_index() < 3);
//! lock.release(grant)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `tracing` (default): structured diagnostics through the `tracing` crate
//! - `metrics`: counter emission through the `metrics` facade

#![deny(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod barrier;
pub mod clock;
pub mod lock;
pub mod metrics;
pub mod namespace;
pub mod task;

pub use barrier::{BarrierError, ReleaseBarrier};
pub use clock::{
    create_monotonic_clock, AnchoredClock, ClockError, ManualClock, MonotonicClock, Timestamp,
};
pub use lock::{KExclusionLock, LockError, SlotAssignment};
pub use metrics::{BarrierMetricsSnapshot, LockMetricsSnapshot};
pub use task::{
    HostScheduler, PeriodicTaskContext, Scheduler, TaskError, TaskId, TaskParams, TaskState,
};
