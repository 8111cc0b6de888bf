//! Hot-path overhead of the coordination primitives.

use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};

use phasesync::{create_monotonic_clock, KExclusionLock, ReleaseBarrier, TaskId};

fn bench_clock_now(c: &mut Criterion) {
    let clock = create_monotonic_clock();
    c.bench_function("clock_now", |b| {
        b.iter(|| std::hint::black_box(clock.now()));
    });
}

fn bench_uncontended_acquire_release(c: &mut Criterion) {
    let lock = KExclusionLock::open("/bench/lock/uncontended", 8, 4).unwrap();
    c.bench_function("lock_acquire_release_uncontended", |b| {
        b.iter(|| {
            let grant = lock.acquire(TaskId(1)).unwrap();
            lock.release(std::hint::black_box(grant)).unwrap();
        });
    });
}

fn bench_query_slot(c: &mut Criterion) {
    let lock = KExclusionLock::open("/bench/lock/query", 8, 4).unwrap();
    let _grant = lock.acquire(TaskId(1)).unwrap();
    c.bench_function("lock_query_slot", |b| {
        b.iter(|| std::hint::black_box(lock.query_slot(TaskId(1))).unwrap());
    });
}

fn bench_barrier_observation(c: &mut Criterion) {
    let barrier = ReleaseBarrier::open("/bench/barrier/observe", 16).unwrap();
    c.bench_function("barrier_observe_waiter_count", |b| {
        b.iter(|| std::hint::black_box(barrier.observe_waiter_count()));
    });
}

fn configured_criterion() -> Criterion {
    Criterion::default()
        .measurement_time(Duration::from_secs(3))
        .warm_up_time(Duration::from_millis(500))
}

criterion_group! {
    name = benches;
    config = configured_criterion();
    targets = bench_clock_now,
        bench_uncontended_acquire_release,
        bench_query_slot,
        bench_barrier_observation
}
criterion_main!(benches);
