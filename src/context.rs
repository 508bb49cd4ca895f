//! Single-threaded execution contexts.
//!
//! Context-bound continuations and watchers hand their work to an
//! [`ExecutionContext`] instead of running it on the producer's thread.
//! [`EventLoop`] is the provided implementation: a job queue drained by
//! whichever thread owns the loop.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::pool::Job;

pub trait ExecutionContext: Send + Sync {
    /// Queues `job` to run on the context's thread. Jobs posted to a dead
    /// context are dropped unrun.
    fn post(&self, job: Job);

    fn is_alive(&self) -> bool;
}

struct LoopShared {
    queue: Mutex<VecDeque<Job>>,
    posted: Condvar,
    alive: AtomicBool,
}

/// A job queue processed on the thread that calls
/// [`process_events`](Self::process_events).
///
/// Dropping the loop (or calling [`shutdown`](Self::shutdown)) kills it:
/// queued jobs are dropped and later posts are refused.
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LoopShared {
                queue: Mutex::new(VecDeque::new()),
                posted: Condvar::new(),
                alive: AtomicBool::new(true),
            }),
        }
    }

    /// A posting handle that does not keep the loop alive.
    pub fn context(&self) -> Arc<dyn ExecutionContext> {
        Arc::new(LoopContext {
            shared: Arc::downgrade(&self.shared),
        })
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Runs queued jobs, including ones they post, until the queue is empty.
    pub fn process_events(&self) -> usize {
        let mut ran = 0;
        while let Some(job) = self.pop() {
            job();
            ran += 1;
        }
        ran
    }

    /// Waits up to `timeout` for at least one job, then drains the queue.
    pub fn wait_and_process(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        {
            let mut queue = self.shared.queue.lock();
            while queue.is_empty() && self.shared.alive.load(Ordering::Acquire) {
                if self.shared.posted.wait_until(&mut queue, deadline).timed_out() {
                    break;
                }
            }
        }
        self.process_events()
    }

    pub fn shutdown(&self) {
        if self.shared.alive.swap(false, Ordering::AcqRel) {
            let dropped = std::mem::take(&mut *self.shared.queue.lock());
            debug!(dropped = dropped.len(), "event loop shut down");
            self.shared.posted.notify_all();
            drop(dropped);
        }
    }

    fn pop(&self) -> Option<Job> {
        if !self.shared.alive.load(Ordering::Acquire) {
            return None;
        }
        self.shared.queue.lock().pop_front()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("alive", &self.shared.alive.load(Ordering::Relaxed))
            .field("pending", &self.pending())
            .finish()
    }
}

struct LoopContext {
    shared: Weak<LoopShared>,
}

impl ExecutionContext for LoopContext {
    fn post(&self, job: Job) {
        let Some(shared) = self.shared.upgrade() else {
            trace!("post to a destroyed event loop; dropping job");
            return;
        };
        if !shared.alive.load(Ordering::Acquire) {
            trace!("post to a stopped event loop; dropping job");
            return;
        }
        shared.queue.lock().push_back(job);
        shared.posted.notify_one();
    }

    fn is_alive(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.alive.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn jobs_run_on_the_processing_thread() {
        let event_loop = EventLoop::new();
        let ctx = event_loop.context();
        let ran_on = Arc::new(Mutex::new(None));
        let slot = ran_on.clone();
        thread::spawn(move || {
            ctx.post(Box::new(move || *slot.lock() = Some(thread::current().id())));
        })
        .join()
        .expect("The poster thread has panicked");
        assert_eq!(event_loop.process_events(), 1);
        assert_eq!(*ran_on.lock(), Some(thread::current().id()));
    }

    #[test]
    fn dead_loop_refuses_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ctx = {
            let event_loop = EventLoop::new();
            let ctx = event_loop.context();
            assert!(ctx.is_alive());
            let c = counter.clone();
            ctx.post(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
            ctx
        };
        assert!(!ctx.is_alive());
        let c = counter.clone();
        ctx.post(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        // both closures were dropped, only the test's handle remains
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn wait_and_process_times_out_empty() {
        let event_loop = EventLoop::new();
        assert_eq!(event_loop.wait_and_process(Duration::from_millis(10)), 0);
    }
}
