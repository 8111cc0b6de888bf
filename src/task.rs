#![forbid(unsafe_code)]

//! Periodic task lifecycle
//!
//! A [`PeriodicTaskContext`] tracks one periodic real-time task through its
//! lifecycle: configure timing parameters, enter active mode, run jobs
//! separated by period boundaries, terminate. Job numbering and the next
//! release instant are derived purely from the activation timestamp and the
//! configured period, so a task that overruns a boundary stays aligned to the
//! original release grid instead of drifting.
//!
//! Host interaction goes through the [`Scheduler`] trait so tests can run the
//! lifecycle against a mock without real sleeping.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::clock::{MonotonicClock, Timestamp};

#[cfg(feature = "tracing")]
use tracing::{debug, trace};

/// Identifier of a task within its task system.
///
/// The coordination primitives treat the id as opaque; callers assign ids
/// (typically small dense integers) and keep them unique per system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

/// Errors reported by the task lifecycle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The timing parameters are internally inconsistent.
    #[error("invalid task parameters: {0}")]
    InvalidTaskParameters(&'static str),

    /// The operation is not legal in the task's current state.
    #[error("operation requires state {expected:?}, task is {actual:?}")]
    InvalidState {
        /// State the operation requires.
        expected: TaskState,
        /// State the task is actually in.
        actual: TaskState,
    },
}

/// Timing parameters of a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskParams {
    /// Worst-case execution cost per job.
    pub cost: Duration,
    /// Separation between consecutive releases.
    pub period: Duration,
    /// Relative deadline, measured from each release.
    pub deadline: Duration,
}

impl TaskParams {
    /// Creates validated parameters with the deadline equal to the period.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidTaskParameters`] when the parameters are
    /// inconsistent; see [`validate`](Self::validate).
    pub fn new(cost: Duration, period: Duration) -> Result<Self, TaskError> {
        let params = Self {
            cost,
            period,
            deadline: period,
        };
        params.validate()?;
        Ok(params)
    }

    /// Creates validated parameters with an explicit relative deadline.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidTaskParameters`] when the parameters are
    /// inconsistent; see [`validate`](Self::validate).
    pub fn with_deadline(
        cost: Duration,
        period: Duration,
        deadline: Duration,
    ) -> Result<Self, TaskError> {
        let params = Self {
            cost,
            period,
            deadline,
        };
        params.validate()?;
        Ok(params)
    }

    /// Checks internal consistency: cost and period positive, cost within
    /// the period, deadline at least the cost.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidTaskParameters`] naming the violated constraint.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.cost.is_zero() {
            return Err(TaskError::InvalidTaskParameters("cost must be positive"));
        }
        if self.period.is_zero() {
            return Err(TaskError::InvalidTaskParameters("period must be positive"));
        }
        if self.cost > self.period {
            return Err(TaskError::InvalidTaskParameters(
                "cost must not exceed period",
            ));
        }
        if self.deadline < self.cost {
            return Err(TaskError::InvalidTaskParameters(
                "deadline must be at least the cost",
            ));
        }
        Ok(())
    }

    /// Fraction of a processor this task demands (cost over period).
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.cost.as_secs_f64() / self.period.as_secs_f64()
    }
}

/// Lifecycle states of a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, no parameters configured yet.
    Uninitialized,
    /// Parameters accepted, not yet running periodically.
    Configured,
    /// Running jobs on the periodic release grid.
    Active,
    /// Retired; terminal.
    Terminated,
}

/// Host-facing seam for admitting, activating, and sleeping tasks.
///
/// The default [`HostScheduler`] sleeps on the calling thread; tests install
/// a mock to drive the lifecycle deterministically.
pub trait Scheduler: Send + Sync {
    /// Called when a task's parameters are accepted.
    fn admit(&self, task: TaskId, params: &TaskParams);

    /// Called when a task enters active mode; returns the activation instant
    /// that anchors its release grid.
    fn activate(&self, task: TaskId) -> Timestamp;

    /// Blocks the calling task until the given instant.
    fn sleep_until(&self, at: Timestamp);

    /// Called when a task terminates.
    fn retire(&self, task: TaskId);
}

/// Scheduler that runs tasks on host threads against a shared clock.
pub struct HostScheduler {
    clock: Arc<dyn MonotonicClock>,
}

impl HostScheduler {
    /// Creates a scheduler reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn MonotonicClock>) -> Self {
        Self { clock }
    }
}

impl Scheduler for HostScheduler {
    fn admit(&self, _task: TaskId, _params: &TaskParams) {
        #[cfg(feature = "tracing")]
        debug!(task = _task.0, cost = ?_params.cost, period = ?_params.period, "task admitted");
    }

    fn activate(&self, _task: TaskId) -> Timestamp {
        self.clock.now()
    }

    fn sleep_until(&self, at: Timestamp) {
        // thread::sleep may wake early; re-check against the clock until the
        // boundary is actually reached.
        loop {
            let now = self.clock.now();
            if now >= at {
                return;
            }
            thread::sleep(at.saturating_duration_since(now));
        }
    }

    fn retire(&self, _task: TaskId) {
        #[cfg(feature = "tracing")]
        debug!(task = _task.0, "task retired");
    }
}

/// Lifecycle and period tracking for one periodic task.
///
/// The context is single-owner: it lives with the thread running the task
/// and is driven through `&mut self` calls.
pub struct PeriodicTaskContext {
    task: TaskId,
    scheduler: Arc<dyn Scheduler>,
    state: TaskState,
    params: Option<TaskParams>,
    activated_at: Option<Timestamp>,
    job_counter: u64,
}

impl PeriodicTaskContext {
    /// Creates an uninitialized context for `task`.
    #[must_use]
    pub fn new(task: TaskId, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            task,
            scheduler,
            state: TaskState::Uninitialized,
            params: None,
            activated_at: None,
            job_counter: 0,
        }
    }

    /// Configures the task's timing parameters.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidTaskParameters`] when the parameters fail
    /// validation, [`TaskError::InvalidState`] unless the task is
    /// [`Uninitialized`](TaskState::Uninitialized).
    pub fn configure(&mut self, params: TaskParams) -> Result<(), TaskError> {
        self.require_state(TaskState::Uninitialized)?;
        params.validate()?;

        self.scheduler.admit(self.task, &params);
        self.params = Some(params);
        self.state = TaskState::Configured;
        Ok(())
    }

    /// Enters active mode, anchoring the release grid at the activation
    /// instant. Job numbering starts at 0.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidState`] unless the task is
    /// [`Configured`](TaskState::Configured).
    pub fn enter_active_mode(&mut self) -> Result<Timestamp, TaskError> {
        self.require_state(TaskState::Configured)?;

        let at = self.scheduler.activate(self.task);
        self.activated_at = Some(at);
        self.job_counter = 0;
        self.state = TaskState::Active;

        #[cfg(feature = "tracing")]
        debug!(task = self.task.0, activated_at = %at, "task entered active mode");

        Ok(at)
    }

    /// The number of the job currently running, starting at 0.
    #[must_use]
    pub fn current_job_number(&self) -> u64 {
        self.job_counter
    }

    /// The release instant of the next job, `None` before activation or when
    /// the grid arithmetic overflows the timestamp range.
    #[must_use]
    pub fn next_release(&self) -> Option<Timestamp> {
        let activated_at = self.activated_at?;
        let period_ns = u64::try_from(self.params?.period.as_nanos()).ok()?;
        let periods = self.job_counter.checked_add(1)?;
        let offset_ns = period_ns.checked_mul(periods)?;
        activated_at.checked_add(Duration::from_nanos(offset_ns))
    }

    /// Completes the current job: blocks until the next period boundary and
    /// advances the job counter, returning the new job number.
    ///
    /// A task that overruns its boundary does not sleep and immediately runs
    /// the next job, still on the original release grid.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidState`] unless the task is
    /// [`Active`](TaskState::Active).
    pub fn sleep_until_next_period(&mut self) -> Result<u64, TaskError> {
        self.require_state(TaskState::Active)?;

        if let Some(boundary) = self.next_release() {
            #[cfg(feature = "tracing")]
            trace!(task = self.task.0, job = self.job_counter, boundary = %boundary, "job complete");
            self.scheduler.sleep_until(boundary);
        }
        self.job_counter += 1;
        Ok(self.job_counter)
    }

    /// Terminates the task, returning the final job count.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidState`] unless the task is
    /// [`Active`](TaskState::Active).
    pub fn terminate(&mut self) -> Result<u64, TaskError> {
        self.require_state(TaskState::Active)?;

        self.scheduler.retire(self.task);
        self.state = TaskState::Terminated;
        Ok(self.job_counter)
    }

    /// The task's identifier.
    #[must_use]
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// The configured parameters, `None` while uninitialized.
    #[must_use]
    pub fn params(&self) -> Option<TaskParams> {
        self.params
    }

    /// The activation instant, `None` before active mode.
    #[must_use]
    pub fn activated_at(&self) -> Option<Timestamp> {
        self.activated_at
    }

    fn require_state(&self, expected: TaskState) -> Result<(), TaskError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(TaskError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Scheduler mock that records sleeps instead of blocking.
    #[derive(Default)]
    struct RecordingScheduler {
        activation_ns: AtomicU64,
        sleeps: Mutex<Vec<Timestamp>>,
    }

    impl Scheduler for RecordingScheduler {
        fn admit(&self, _task: TaskId, _params: &TaskParams) {}

        fn activate(&self, _task: TaskId) -> Timestamp {
            Timestamp::from_nanos(self.activation_ns.load(Ordering::SeqCst))
        }

        fn sleep_until(&self, at: Timestamp) {
            self.sleeps.lock().unwrap().push(at);
        }

        fn retire(&self, _task: TaskId) {}
    }

    fn active_context(sched: Arc<RecordingScheduler>) -> PeriodicTaskContext {
        let mut ctx = PeriodicTaskContext::new(TaskId(1), sched);
        ctx.configure(
            TaskParams::new(Duration::from_millis(2), Duration::from_millis(10)).unwrap(),
        )
        .unwrap();
        ctx.enter_active_mode().unwrap();
        ctx
    }

    #[test]
    fn test_params_validation() {
        assert!(TaskParams::new(Duration::from_millis(2), Duration::from_millis(10)).is_ok());

        assert_eq!(
            TaskParams::new(Duration::ZERO, Duration::from_millis(10)).unwrap_err(),
            TaskError::InvalidTaskParameters("cost must be positive")
        );
        assert_eq!(
            TaskParams::new(Duration::from_millis(2), Duration::ZERO).unwrap_err(),
            TaskError::InvalidTaskParameters("period must be positive")
        );
        assert_eq!(
            TaskParams::new(Duration::from_millis(20), Duration::from_millis(10)).unwrap_err(),
            TaskError::InvalidTaskParameters("cost must not exceed period")
        );
        assert_eq!(
            TaskParams::with_deadline(
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(2),
            )
            .unwrap_err(),
            TaskError::InvalidTaskParameters("deadline must be at least the cost")
        );
    }

    #[test]
    fn test_utilization() {
        let params =
            TaskParams::new(Duration::from_millis(25), Duration::from_millis(100)).unwrap();
        assert!((params.utilization() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_lifecycle_order_enforced() {
        let sched = Arc::new(RecordingScheduler::default());
        let mut ctx = PeriodicTaskContext::new(TaskId(1), sched);

        assert_eq!(ctx.state(), TaskState::Uninitialized);
        assert_eq!(
            ctx.enter_active_mode().unwrap_err(),
            TaskError::InvalidState {
                expected: TaskState::Configured,
                actual: TaskState::Uninitialized,
            }
        );
        assert_eq!(
            ctx.sleep_until_next_period().unwrap_err(),
            TaskError::InvalidState {
                expected: TaskState::Active,
                actual: TaskState::Uninitialized,
            }
        );

        let params =
            TaskParams::new(Duration::from_millis(1), Duration::from_millis(5)).unwrap();
        ctx.configure(params).unwrap();
        assert_eq!(ctx.state(), TaskState::Configured);

        // Reconfiguring after acceptance is rejected.
        assert_eq!(
            ctx.configure(params).unwrap_err(),
            TaskError::InvalidState {
                expected: TaskState::Uninitialized,
                actual: TaskState::Configured,
            }
        );

        ctx.enter_active_mode().unwrap();
        assert_eq!(ctx.state(), TaskState::Active);

        ctx.terminate().unwrap();
        assert_eq!(ctx.state(), TaskState::Terminated);
        assert_eq!(
            ctx.terminate().unwrap_err(),
            TaskError::InvalidState {
                expected: TaskState::Active,
                actual: TaskState::Terminated,
            }
        );
    }

    #[test]
    fn test_job_counting_and_release_grid() {
        let sched = Arc::new(RecordingScheduler::default());
        sched.activation_ns.store(1_000_000_000, Ordering::SeqCst);
        let mut ctx = active_context(Arc::clone(&sched));

        assert_eq!(ctx.current_job_number(), 0);
        assert_eq!(ctx.activated_at(), Some(Timestamp::from_nanos(1_000_000_000)));
        assert_eq!(
            ctx.next_release(),
            Some(Timestamp::from_nanos(1_010_000_000))
        );

        assert_eq!(ctx.sleep_until_next_period().unwrap(), 1);
        assert_eq!(ctx.sleep_until_next_period().unwrap(), 2);
        assert_eq!(ctx.current_job_number(), 2);

        // Boundaries stay on the activation-anchored grid.
        let sleeps = sched.sleeps.lock().unwrap();
        assert_eq!(
            *sleeps,
            vec![
                Timestamp::from_nanos(1_010_000_000),
                Timestamp::from_nanos(1_020_000_000),
            ]
        );
    }

    #[test]
    fn test_terminate_returns_job_count() {
        let sched = Arc::new(RecordingScheduler::default());
        let mut ctx = active_context(sched);

        ctx.sleep_until_next_period().unwrap();
        ctx.sleep_until_next_period().unwrap();
        ctx.sleep_until_next_period().unwrap();
        assert_eq!(ctx.terminate().unwrap(), 3);
    }

    #[test]
    fn test_activation_resets_job_counter() {
        let sched = Arc::new(RecordingScheduler::default());
        let mut ctx = active_context(sched);

        ctx.sleep_until_next_period().unwrap();
        assert_eq!(ctx.current_job_number(), 1);
        // A fresh context starts numbering at zero again.
        let sched2 = Arc::new(RecordingScheduler::default());
        let ctx2 = active_context(sched2);
        assert_eq!(ctx2.current_job_number(), 0);
    }

    #[test]
    fn test_release_grid_past_u32_jobs() {
        let sched = Arc::new(RecordingScheduler::default());
        let mut ctx = PeriodicTaskContext::new(TaskId(1), sched);
        ctx.configure(
            TaskParams::new(Duration::from_nanos(1), Duration::from_nanos(1)).unwrap(),
        )
        .unwrap();
        ctx.enter_active_mode().unwrap();

        // Long-running tasks cross the 2^32 job mark; the grid must keep
        // resolving until the timestamp range itself overflows.
        ctx.job_counter = u64::from(u32::MAX) + 10;
        assert_eq!(
            ctx.next_release(),
            Some(Timestamp::from_nanos(u64::from(u32::MAX) + 11))
        );
    }

    #[test]
    fn test_next_release_overflow_is_reported() {
        let sched = Arc::new(RecordingScheduler::default());
        sched.activation_ns.store(u64::MAX - 1, Ordering::SeqCst);
        let ctx = active_context(sched);

        assert_eq!(ctx.next_release(), None);
    }

    #[test]
    fn test_host_scheduler_sleeps_to_boundary() {
        let clock = crate::clock::create_monotonic_clock();
        let sched = HostScheduler::new(Arc::clone(&clock));

        let target = clock.now().saturating_add(Duration::from_millis(5));
        sched.sleep_until(target);
        assert!(clock.now() >= target);
    }
}
