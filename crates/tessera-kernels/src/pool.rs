//! Persistent worker pool with three blocking parallel-iteration primitives.
//!
//! Workers are long-lived threads draining a bounded queue of work items.
//! Every parallel call owns a completion latch and blocks on it, so the
//! closures it submits may borrow from the caller's stack. Calls fall back
//! to plain sequential loops when the work is tiny, the pool is closed, or
//! the caller is itself a pool worker.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, SendError, Sender};
use parking_lot::{Condvar, Mutex};
use tessera_core::{Result, TesseraError};

use crate::config::PoolConfig;

type Job = Box<dyn FnOnce() + Send + 'static>;
type PanicPayload = Box<dyn Any + Send + 'static>;

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// One deferred unit of work and the latch it reports to.
struct WorkItem {
    job: Job,
    latch: Arc<Latch>,
}

impl WorkItem {
    fn execute(self) {
        let result = panic::catch_unwind(AssertUnwindSafe(self.job));
        self.latch.complete(result.err());
    }
}

/// Counts outstanding items of one parallel call.
struct Latch {
    state: Mutex<LatchState>,
    done: Condvar,
}

struct LatchState {
    remaining: usize,
    panic: Option<PanicPayload>,
}

impl Latch {
    fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(LatchState { remaining: count, panic: None }),
            done: Condvar::new(),
        }
    }

    fn complete(&self, panic: Option<PanicPayload>) {
        let mut state = self.state.lock();
        if state.panic.is_none() {
            state.panic = panic;
        }
        state.remaining -= 1;
        if state.remaining == 0 {
            self.done.notify_all();
        }
    }

    /// Block until every item has completed; yields the first panic, if any.
    fn wait(&self) -> Option<PanicPayload> {
        let mut state = self.state.lock();
        while state.remaining > 0 {
            self.done.wait(&mut state);
        }
        state.panic.take()
    }
}

/// Fixed set of worker threads shared by all parallel calls.
pub struct WorkerPool {
    size: usize,
    sequential_threshold: usize,
    sender: Mutex<Option<Sender<WorkItem>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig) -> Result<Self> {
        config.validate()?;
        let size = config.resolved_threads();
        let (sender, receiver) = crossbeam_channel::bounded::<WorkItem>(config.queue_capacity);

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("tessera-worker-{id}"))
                .spawn(move || worker_loop(rx))
                .map_err(|e| TesseraError::WorkerSpawn(e.to_string()))?;
            workers.push(handle);
        }

        tracing::info!("worker pool started with {} threads", size);
        Ok(Self {
            size,
            sequential_threshold: config.sequential_threshold,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        })
    }

    /// Pool with `threads` workers and default queue settings.
    pub fn with_threads(threads: usize) -> Result<Self> {
        Self::new(&PoolConfig::with_threads(threads.max(1)))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting work and join the workers. Idempotent; later parallel
    /// calls run on the calling thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender disconnects the queue once in-flight calls
        // release their clones; workers drain it and exit.
        self.sender.lock().take();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if IN_WORKER.with(Cell::get) {
            tracing::debug!("worker pool closed from a worker; not joining");
            return;
        }
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!("worker pool closed");
    }

    /// Static partition: `[0, n)` split into `min(size, n)` contiguous
    /// ranges of `⌈n/w⌉` indices, one per worker.
    pub fn parallel_for<F>(&self, n: usize, f: F)
    where
        F: Fn(usize) + Sync,
    {
        let workers = self.size.min(n);
        if self.run_sequential(n, workers) {
            (0..n).for_each(f);
            return;
        }
        let chunk = n.div_ceil(workers);
        self.broadcast(workers, &|slot| {
            let start = slot * chunk;
            let end = (start + chunk).min(n);
            for i in start..end {
                f(i);
            }
        });
    }

    /// Dynamic scheduling: workers claim one index at a time from a shared
    /// counter. Suited to indices of uneven cost.
    pub fn parallel_for_atomic<F>(&self, n: usize, f: F)
    where
        F: Fn(usize) + Sync,
    {
        self.parallel_for_atomic_batched(n, 1, f);
    }

    /// Like [`WorkerPool::parallel_for_atomic`] but each claim takes `batch`
    /// consecutive indices.
    pub fn parallel_for_atomic_batched<F>(&self, n: usize, batch: usize, f: F)
    where
        F: Fn(usize) + Sync,
    {
        let batch = batch.max(1);
        let workers = self.size.min(n.div_ceil(batch));
        if self.run_sequential(n, workers) {
            (0..n).for_each(f);
            return;
        }
        let next = AtomicUsize::new(0);
        self.broadcast(workers, &|_| loop {
            let start = next.fetch_add(batch, Ordering::Relaxed);
            if start >= n {
                break;
            }
            for i in start..(start + batch).min(n) {
                f(i);
            }
        });
    }

    fn run_sequential(&self, n: usize, workers: usize) -> bool {
        n < self.sequential_threshold
            || workers <= 1
            || self.is_closed()
            || IN_WORKER.with(Cell::get)
    }

    /// Run `body(slot)` for `slot in 0..count` on the workers and wait.
    fn broadcast(&self, count: usize, body: &(dyn Fn(usize) + Sync)) {
        let sender = match self.sender.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => {
                (0..count).for_each(body);
                return;
            }
        };

        // Work items cross a bounded channel to long-lived workers, so they
        // must be 'static; a rayon scope would bring its own threads and
        // queue instead of this pool's. The lifetime is erased here instead.
        // Safety: `latch.wait()` below returns only after every submitted
        // item has finished (panics included), so `body` outlives all uses
        // on the workers.
        let body: &'static (dyn Fn(usize) + Sync) = unsafe {
            std::mem::transmute::<&(dyn Fn(usize) + Sync), &'static (dyn Fn(usize) + Sync)>(body)
        };

        let latch = Arc::new(Latch::new(count));
        for slot in 0..count {
            let item = WorkItem {
                job: Box::new(move || body(slot)),
                latch: Arc::clone(&latch),
            };
            if let Err(SendError(item)) = sender.send(item) {
                item.execute();
            }
        }
        drop(sender);

        if let Some(payload) = latch.wait() {
            panic::resume_unwind(payload);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn worker_loop(rx: Receiver<WorkItem>) {
    IN_WORKER.with(|flag| flag.set(true));
    while let Ok(item) = rx.recv() {
        item.execute();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;

    fn counts(n: usize) -> Vec<AtomicU32> {
        (0..n).map(|_| AtomicU32::new(0)).collect()
    }

    fn assert_once(hits: &[AtomicU32]) {
        for (i, h) in hits.iter().enumerate() {
            assert_eq!(h.load(Ordering::Relaxed), 1, "index {i}");
        }
    }

    #[test]
    fn test_each_primitive_visits_once() {
        for threads in [1, 4, 8] {
            let pool = WorkerPool::with_threads(threads).unwrap();
            assert_eq!(pool.size(), threads);

            let hits = counts(100);
            pool.parallel_for(100, |i| {
                hits[i].fetch_add(1, Ordering::Relaxed);
            });
            assert_once(&hits);

            let hits = counts(100);
            pool.parallel_for_atomic(100, |i| {
                hits[i].fetch_add(1, Ordering::Relaxed);
            });
            assert_once(&hits);

            let hits = counts(100);
            pool.parallel_for_atomic_batched(100, 7, |i| {
                hits[i].fetch_add(1, Ordering::Relaxed);
            });
            assert_once(&hits);
        }
    }

    #[test]
    fn test_uses_worker_threads() {
        let pool = WorkerPool::with_threads(4).unwrap();
        let names = Mutex::new(HashSet::new());
        pool.parallel_for(64, |_| {
            let name = thread::current().name().unwrap_or("").to_string();
            names.lock().insert(name);
            thread::sleep(std::time::Duration::from_millis(1));
        });
        let names = names.into_inner();
        assert!(names.iter().all(|n| n.starts_with("tessera-worker-")), "{names:?}");
    }

    #[test]
    fn test_closed_pool_runs_in_order_on_caller() {
        let pool = WorkerPool::with_threads(4).unwrap();
        pool.close();
        pool.close();
        assert!(pool.is_closed());

        let caller = thread::current().id();
        let order = Mutex::new(Vec::new());
        pool.parallel_for(100, |i| {
            assert_eq!(thread::current().id(), caller);
            order.lock().push(i);
        });
        pool.parallel_for_atomic(100, |i| order.lock().push(100 + i));
        pool.parallel_for_atomic_batched(100, 8, |i| order.lock().push(200 + i));
        assert_eq!(order.into_inner(), (0..300).collect::<Vec<_>>());
    }

    #[test]
    fn test_small_n_stays_on_caller() {
        let config =
            PoolConfig { num_threads: 4, sequential_threshold: 10, ..PoolConfig::default() };
        let pool = WorkerPool::new(&config).unwrap();
        let caller = thread::current().id();
        pool.parallel_for(5, |_| assert_eq!(thread::current().id(), caller));
        pool.parallel_for(0, |_| panic!("no indices"));
    }

    #[test]
    fn test_nested_calls_do_not_deadlock() {
        let pool = WorkerPool::with_threads(2).unwrap();
        let total = AtomicUsize::new(0);
        pool.parallel_for(4, |_| {
            pool.parallel_for(10, |_| {
                total.fetch_add(1, Ordering::Relaxed);
            });
        });
        assert_eq!(total.load(Ordering::Relaxed), 40);
    }

    #[test]
    fn test_disjoint_writes() {
        let pool = WorkerPool::with_threads(4).unwrap();
        let out: Vec<Mutex<usize>> = (0..257).map(|_| Mutex::new(0)).collect();
        pool.parallel_for_atomic_batched(257, 16, |i| *out[i].lock() = i * 2);
        assert!(out.iter().enumerate().all(|(i, v)| *v.lock() == i * 2));
    }

    #[test]
    fn test_panic_propagates_after_barrier() {
        let pool = WorkerPool::with_threads(4).unwrap();
        let ran = AtomicUsize::new(0);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.parallel_for(8, |i| {
                ran.fetch_add(1, Ordering::Relaxed);
                if i == 3 {
                    panic!("boom");
                }
            });
        }));
        assert!(result.is_err());
        assert_eq!(ran.load(Ordering::Relaxed), 8);

        // The pool is still usable afterwards.
        let hits = counts(10);
        pool.parallel_for(10, |i| {
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        assert_once(&hits);
    }
}
