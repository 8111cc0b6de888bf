//! Task-system release scenarios across real threads.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use crossbeam::channel;

use phasesync::{create_monotonic_clock, BarrierError, ReleaseBarrier, TaskId, Timestamp};

#[test]
fn test_all_waiters_observe_one_timestamp() {
    const WAITERS: u64 = 10;

    let barrier = ReleaseBarrier::open("/it/barrier/shared-ts", WAITERS as usize).unwrap();
    let (ts_tx, ts_rx) = channel::unbounded::<Timestamp>();

    let mut handles = Vec::new();
    for id in 0..WAITERS {
        let barrier = barrier.clone();
        let ts_tx = ts_tx.clone();
        handles.push(thread::spawn(move || {
            let at = barrier.register_waiting(TaskId(id)).unwrap();
            ts_tx.send(at).unwrap();
        }));
    }

    while barrier.observe_waiter_count() < WAITERS as usize {
        thread::yield_now();
    }
    let released_at = Timestamp::from_nanos(123_456_789);
    barrier.release(released_at).unwrap();

    let observed: HashSet<Timestamp> = (0..WAITERS)
        .map(|_| ts_rx.recv_timeout(Duration::from_secs(2)).unwrap())
        .collect();
    assert_eq!(observed, HashSet::from([released_at]));

    for handle in handles {
        handle.join().unwrap();
    }

    let snap = barrier.metrics();
    assert_eq!(snap.registrations, WAITERS);
    assert_eq!(snap.releases, 1);
    assert_eq!(snap.waiters_released, WAITERS);
}

#[test]
fn test_coordinator_releases_when_assembled() {
    const WAITERS: usize = 4;

    let barrier = ReleaseBarrier::open("/it/barrier/coordinator", WAITERS).unwrap();
    let clock = create_monotonic_clock();

    let mut handles = Vec::new();
    for id in 0..WAITERS as u64 {
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            // Stagger arrival so the coordinator has to poll a few times.
            thread::sleep(Duration::from_millis(5 * (id + 1)));
            barrier.register_waiting(TaskId(id)).unwrap()
        }));
    }

    let released_at = barrier
        .release_when_assembled(
            clock.as_ref(),
            Duration::from_millis(1),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), released_at);
    }
    assert_eq!(barrier.release_timestamp(), Some(released_at));
}

#[test]
fn test_coordinator_gives_up_without_waiters() {
    let barrier = ReleaseBarrier::open("/it/barrier/patience", 3).unwrap();
    let clock = create_monotonic_clock();

    let err = barrier
        .release_when_assembled(
            clock.as_ref(),
            Duration::from_millis(1),
            Some(Duration::from_millis(30)),
        )
        .unwrap_err();
    assert_eq!(err, BarrierError::Timeout);
    assert!(!barrier.released());
}

#[test]
fn test_second_release_rejected_across_handles() {
    let a = ReleaseBarrier::open("/it/barrier/one-shot", 2).unwrap();
    let b = ReleaseBarrier::open("/it/barrier/one-shot", 2).unwrap();

    let first = Timestamp::from_nanos(1_000);
    a.release(first).unwrap();

    assert_eq!(
        b.release(Timestamp::from_nanos(9_999)).unwrap_err(),
        BarrierError::AlreadyReleased
    );
    assert_eq!(b.release_timestamp(), Some(first));
}

#[test]
fn test_straggler_joins_released_system() {
    let barrier = ReleaseBarrier::open("/it/barrier/straggler", 3).unwrap();
    let at = Timestamp::from_nanos(777);

    barrier.release(at).unwrap();

    // A task arriving after the release starts immediately with the same
    // timestamp as everyone else.
    assert_eq!(barrier.register_waiting(TaskId(99)).unwrap(), at);
    assert_eq!(barrier.metrics().late_registrations, 1);
}
