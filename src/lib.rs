//! Result propagation between a producing task and any number of waiters.
//!
//! A [`Producer`] reports into a shared state: lifecycle flags, an indexed
//! result store, progress, or an exception. [`Consumer`]s wait on it from
//! threads or `.await` it, chain continuations with [`Consumer::then`] and
//! friends, and steer it with cancel and suspend requests. Observers see
//! every committed change in order, with past events replayed on connect;
//! a [`Watcher`] queues them for delivery on one thread and throttles the
//! producer when it falls behind.
//!
//! ```
//! use promise_interface::{run, WorkerPool};
//!
//! let doubled = run(&WorkerPool::global(), || 21).then(|n| n * 2);
//! assert_eq!(doubled.result().unwrap(), 42);
//! ```

pub mod config;
pub mod consumer;
pub mod context;
pub mod continuation;
pub mod error;
pub mod event;
pub mod pool;
pub mod producer;
pub mod result_store;
mod shared;
pub mod state;
pub mod watcher;

pub use config::{PoolConfig, ProgressConfig, WatcherConfig};
pub use consumer::{Consumer, ResultIter};
pub use context::{EventLoop, ExecutionContext};
pub use continuation::Launch;
pub use error::{Error, Exception, PanicError};
pub use event::{CallbackObserver, Connection, Event, Observer, ObserverId};
pub use pool::{run, run_with_producer, Job, TaskId, ThreadPool, WorkerPool};
pub use producer::Producer;
pub use result_store::{Insertion, ResultStore};
pub use shared::StateHandle;
pub use state::{CancelMode, State};
pub use watcher::Watcher;

/// One-shot completion of a promise: resolve with a value or reject with an
/// exception, consuming the promise either way.
pub trait Promise<T> {
    type Waiter;

    fn new() -> (Self, Self::Waiter)
    where
        Self: Sized;

    fn resolve(self, value: T);

    fn reject(self, exception: Exception);
}
