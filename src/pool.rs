//! The thread pool seam.
//!
//! Futures only ever ask a pool four things: run a job, run a specific
//! queued job right here on the caller's thread, and give up or take back a
//! worker slot while a producer is parked. [`WorkerPool`] is a small
//! reference implementation of that contract.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::config::PoolConfig;
use crate::consumer::Consumer;
use crate::error::Exception;
use crate::producer::Producer;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a job submitted to a [`ThreadPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub trait ThreadPool: Send + Sync {
    /// Queues `job` and returns its id.
    fn submit(&self, job: Job) -> TaskId;

    /// Runs `task` on the calling thread if it is still queued.
    fn try_run_inline(&self, task: TaskId) -> bool;

    /// The calling thread is about to block; let another worker run.
    fn release_worker_slot(&self);

    /// Takes back a slot given up by [`release_worker_slot`](Self::release_worker_slot).
    fn reserve_worker_slot(&self);
}

/// Gives a worker slot back to the pool for the guard's lifetime.
pub(crate) struct ReleasedSlot(Option<Arc<dyn ThreadPool>>);

impl ReleasedSlot {
    pub(crate) fn new(pool: Option<Arc<dyn ThreadPool>>) -> Self {
        if let Some(pool) = &pool {
            pool.release_worker_slot();
        }
        Self(pool)
    }
}

impl Drop for ReleasedSlot {
    fn drop(&mut self) {
        if let Some(pool) = &self.0 {
            pool.reserve_worker_slot();
        }
    }
}

struct PoolState {
    queue: VecDeque<(TaskId, Job)>,
    /// Worker threads alive.
    threads: usize,
    /// Workers waiting for a job.
    idle: usize,
    /// Workers allowed to run at once; grows while producers are parked.
    capacity: usize,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
    name_prefix: String,
}

/// Fixed-capacity pool of OS threads, spawned lazily.
///
/// Releasing a slot raises the capacity by one so a parked producer does not
/// starve the queue; extra threads spawned that way stay around until the
/// pool is dropped.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkerPool")
            .field("threads", &state.threads)
            .field("idle", &state.idle)
            .field("capacity", &state.capacity)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    threads: 0,
                    idle: 0,
                    capacity: config.threads.max(1),
                    shutdown: false,
                }),
                available: Condvar::new(),
                name_prefix: config.name_prefix,
            }),
        }
    }

    /// Process-wide pool used by [`Launch::Async`](crate::Launch::Async).
    pub fn global() -> Arc<dyn ThreadPool> {
        static GLOBAL: OnceLock<Arc<WorkerPool>> = OnceLock::new();
        let pool = GLOBAL.get_or_init(|| Arc::new(WorkerPool::new(PoolConfig::default())));
        pool.clone()
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    fn maybe_spawn(&self, state: &mut PoolState) {
        if state.shutdown || state.queue.is_empty() || state.idle > 0 {
            return;
        }
        if state.threads >= state.capacity {
            return;
        }
        let shared = self.shared.clone();
        let name = format!("{}-{}", self.shared.name_prefix, state.threads);
        match thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(shared))
        {
            Ok(_) => {
                state.threads += 1;
                trace!(threads = state.threads, "spawned pool worker");
            }
            Err(e) => error!(error = %e, "failed to spawn pool worker"),
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let (task, job) = {
            let mut state = shared.state.lock();
            loop {
                if let Some(next) = state.queue.pop_front() {
                    break next;
                }
                if state.shutdown {
                    state.threads -= 1;
                    return;
                }
                state.idle += 1;
                shared.available.wait(&mut state);
                state.idle -= 1;
            }
        };
        trace!(?task, "worker running task");
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(?task, "pool job panicked");
        }
    }
}

impl ThreadPool for WorkerPool {
    fn submit(&self, job: Job) -> TaskId {
        let task = TaskId::next();
        let mut state = self.shared.state.lock();
        state.queue.push_back((task, job));
        if state.idle > 0 {
            self.shared.available.notify_one();
        } else {
            self.maybe_spawn(&mut state);
        }
        task
    }

    fn try_run_inline(&self, task: TaskId) -> bool {
        let job = {
            let mut state = self.shared.state.lock();
            let position = state.queue.iter().position(|(id, _)| *id == task);
            position.and_then(|p| state.queue.remove(p))
        };
        match job {
            Some((_, job)) => {
                job();
                true
            }
            None => false,
        }
    }

    fn release_worker_slot(&self) {
        let mut state = self.shared.state.lock();
        state.capacity += 1;
        self.maybe_spawn(&mut state);
    }

    fn reserve_worker_slot(&self) {
        let mut state = self.shared.state.lock();
        state.capacity = state.capacity.saturating_sub(1).max(1);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        debug!(queued = state.queue.len(), "worker pool shutting down");
        self.shared.available.notify_all();
    }
}

/// Runs `f` on `pool` and returns a future for its return value.
///
/// A panic inside `f` becomes the future's exception.
pub fn run<T, F>(pool: &Arc<dyn ThreadPool>, f: F) -> Consumer<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    run_with_producer(pool, move |producer: &Producer<T>| {
        producer.report_result(f());
    })
}

/// Runs `f` on `pool`, handing it the producer so it can report progress,
/// several results, and honor suspension requests.
pub fn run_with_producer<T, F>(pool: &Arc<dyn ThreadPool>, f: F) -> Consumer<T>
where
    T: Send + 'static,
    F: FnOnce(&Producer<T>) + Send + 'static,
{
    let (producer, consumer) = Producer::<T>::new();
    producer.set_thread_pool(Some(pool.clone()));
    let job: Job = Box::new(move || {
        producer.report_started();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(&producer))) {
            producer.report_exception(Exception::from_panic(payload));
        }
        producer.report_finished();
    });
    let task = pool.submit(job);
    consumer.set_task(task);
    consumer
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Default)]
    struct ManualPool {
        queue: Mutex<VecDeque<(TaskId, Job)>>,
        released: AtomicUsize,
        reserved: AtomicUsize,
    }

    impl ThreadPool for ManualPool {
        fn submit(&self, job: Job) -> TaskId {
            let id = TaskId::next();
            self.queue.lock().push_back((id, job));
            id
        }

        fn try_run_inline(&self, task: TaskId) -> bool {
            let job = {
                let mut queue = self.queue.lock();
                let p = queue.iter().position(|(id, _)| *id == task);
                p.and_then(|p| queue.remove(p))
            };
            job.map(|(_, job)| job()).is_some()
        }

        fn release_worker_slot(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn reserve_worker_slot(&self) {
            self.reserved.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn worker_pool_runs_jobs() {
        let pool = WorkerPool::new(PoolConfig::default().with_threads(2));
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            pool.submit(Box::new(move || tx.send(i).expect("receiver alive")));
        }
        let mut got: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("job ran"))
            .collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[test]
    fn waiting_steals_the_queued_task() {
        let manual = Arc::new(ManualPool::default());
        let pool: Arc<dyn ThreadPool> = manual.clone();
        let future = run(&pool, || 6 * 7);
        assert!(!future.is_finished());
        // nobody drains ManualPool; the waiter has to run the job itself
        assert_eq!(future.results().expect("no exception"), vec![42]);
        assert!(manual.queue.lock().is_empty());
    }

    #[test]
    fn panics_become_exceptions() {
        let manual = Arc::new(ManualPool::default());
        let pool: Arc<dyn ThreadPool> = manual.clone();
        let future = run::<i32, _>(&pool, || panic!("bad input"));
        let err = future.wait_for_finished().expect_err("panic stored");
        assert!(err.to_string().contains("bad input"));
    }

    #[test]
    fn released_slot_is_reserved_again() {
        let manual = Arc::new(ManualPool::default());
        {
            let _slot = ReleasedSlot::new(Some(manual.clone() as Arc<dyn ThreadPool>));
            assert_eq!(manual.released.load(Ordering::SeqCst), 1);
            assert_eq!(manual.reserved.load(Ordering::SeqCst), 0);
        }
        assert_eq!(manual.reserved.load(Ordering::SeqCst), 1);
    }
}
