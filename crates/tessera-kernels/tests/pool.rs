//! WorkerPool coverage across worker counts and after close.

use std::sync::atomic::{AtomicUsize, Ordering};

use tessera_kernels::{PoolConfig, WorkerPool};

const N: usize = 100;

fn counts() -> Vec<AtomicUsize> {
    (0..N).map(|_| AtomicUsize::new(0)).collect()
}

fn assert_each_once(hits: &[AtomicUsize], ctx: &str) {
    for (i, h) in hits.iter().enumerate() {
        assert_eq!(h.load(Ordering::Relaxed), 1, "{ctx}: index {i}");
    }
}

fn exercise(pool: &WorkerPool, ctx: &str) {
    let hits = counts();
    pool.parallel_for(N, |i| {
        hits[i].fetch_add(1, Ordering::Relaxed);
    });
    assert_each_once(&hits, &format!("{ctx} parallel_for"));

    let hits = counts();
    pool.parallel_for_atomic(N, |i| {
        hits[i].fetch_add(1, Ordering::Relaxed);
    });
    assert_each_once(&hits, &format!("{ctx} parallel_for_atomic"));

    for batch in [1, 7, 32, 200] {
        let hits = counts();
        pool.parallel_for_atomic_batched(N, batch, |i| {
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        assert_each_once(&hits, &format!("{ctx} batched({batch})"));
    }
}

#[test]
fn every_index_exactly_once() {
    for workers in [1, 4, 8] {
        let pool = WorkerPool::new(&PoolConfig::with_threads(workers)).unwrap();
        assert_eq!(pool.size(), workers);
        exercise(&pool, &format!("{workers} workers"));
    }
}

#[test]
fn closed_pool_runs_sequentially() {
    let pool = WorkerPool::with_threads(4).unwrap();
    pool.close();
    pool.close();
    assert!(pool.is_closed());
    exercise(&pool, "closed");

    // Sequential execution preserves index order.
    let order = parking_lot::Mutex::new(Vec::new());
    pool.parallel_for_atomic(10, |i| order.lock().push(i));
    assert_eq!(order.into_inner(), (0..10).collect::<Vec<_>>());
}

#[test]
fn env_sized_pool() {
    let config = PoolConfig::from_lookup(|key| {
        (key == PoolConfig::NUM_THREADS_ENV).then(|| "3".to_string())
    });
    let pool = WorkerPool::new(&config).unwrap();
    assert_eq!(pool.size(), 3);
    exercise(&pool, "env");
}

#[test]
fn concurrent_callers_complete_independently() {
    let pool = WorkerPool::with_threads(4).unwrap();
    let callers = 6;

    std::thread::scope(|scope| {
        for caller in 0..callers {
            let pool = &pool;
            scope.spawn(move || {
                for round in 0..20 {
                    let n = 50 + caller * 13 + round;
                    let hits: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();
                    match (caller + round) % 3 {
                        0 => pool.parallel_for(n, |i| {
                            hits[i].fetch_add(1, Ordering::Relaxed);
                        }),
                        1 => pool.parallel_for_atomic(n, |i| {
                            hits[i].fetch_add(1, Ordering::Relaxed);
                        }),
                        _ => pool.parallel_for_atomic_batched(n, 5, |i| {
                            hits[i].fetch_add(1, Ordering::Relaxed);
                        }),
                    }
                    for (i, h) in hits.iter().enumerate() {
                        let seen = h.load(Ordering::Relaxed);
                        assert_eq!(seen, 1, "caller {caller} round {round} index {i}");
                    }
                }
            });
        }
    });
}
