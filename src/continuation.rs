//! "Run this when that finishes."
//!
//! Every continuation gets its own future, created `Pending`. A closure is
//! parked in the parent's continuation slot and fires exactly once when the
//! parent finishes (or right away if it already has). Where the user's
//! function then runs is chosen by [`Launch`] or by an execution context.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::debug;

use crate::consumer::Consumer;
use crate::context::ExecutionContext;
use crate::error::Exception;
use crate::pool::{ThreadPool, WorkerPool};
use crate::producer::Producer;
use crate::shared::Continuation;
use crate::state::State;

/// Where a continuation's function runs.
#[derive(Clone, Default)]
pub enum Launch {
    /// On the thread that finished the parent (or the caller of `then`, if
    /// the parent had already finished).
    #[default]
    Sync,
    /// On the process-wide [`WorkerPool`].
    Async,
    /// On the parent's pool if it ran on one, otherwise like `Sync`.
    Inherit,
    Pool(Arc<dyn ThreadPool>),
}

impl fmt::Debug for Launch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Launch::Sync => f.write_str("Sync"),
            Launch::Async => f.write_str("Async"),
            Launch::Inherit => f.write_str("Inherit"),
            Launch::Pool(_) => f.write_str("Pool(..)"),
        }
    }
}

enum Target {
    Launch(Launch),
    Context(Arc<dyn ExecutionContext>),
}

/// Runs the continuation body on the current thread and finishes the child.
fn execute<T, U, H>(parent: Consumer<T>, child: Producer<U>, handler: H)
where
    T: Send + 'static,
    U: Send + 'static,
    H: FnOnce(Consumer<T>, &Producer<U>),
{
    child.report_started();
    if child.is_canceled() {
        child.report_finished();
        return;
    }
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(parent, &child))) {
        child.report_exception(Exception::from_panic(payload));
    }
    child.report_finished();
}

fn dispatch<T, U, H>(target: Target, parent: Consumer<T>, child: Producer<U>, handler: H)
where
    T: Send + 'static,
    U: Send + 'static,
    H: FnOnce(Consumer<T>, &Producer<U>) + Send + 'static,
{
    let pool = match target {
        Target::Context(context) => {
            if context.is_alive() {
                context.post(Box::new(move || execute(parent, child, handler)));
            } else {
                debug!("execution context is gone; continuation dropped");
                child.report_canceled();
                child.report_finished();
            }
            return;
        }
        Target::Launch(Launch::Sync) => None,
        Target::Launch(Launch::Async) => Some(WorkerPool::global()),
        Target::Launch(Launch::Inherit) => parent.thread_pool(),
        Target::Launch(Launch::Pool(pool)) => Some(pool),
    };
    match pool {
        None => execute(parent, child, handler),
        Some(pool) => {
            child.set_thread_pool(Some(pool.clone()));
            let future = child.future();
            let task = pool.submit(Box::new(move || execute(parent, child, handler)));
            future.set_task(task);
        }
    }
}

impl<T: Send + 'static> Consumer<T> {
    /// Core of every continuation flavor.
    ///
    /// `handler` runs once the parent is finished and reports into the child.
    /// With `propagate_cancel`, canceling the parent cancels the child before
    /// the handler ever runs.
    fn chain<U, H>(&self, target: Target, propagate_cancel: bool, handler: H) -> Consumer<U>
    where
        U: Send + 'static,
        H: FnOnce(Consumer<T>, &Producer<U>) + Send + 'static,
    {
        let (child, future) = Producer::<U>::with_state(State::PENDING);
        let cancel_target = propagate_cancel.then(|| future.shared().weak_erased());
        let continuation: Continuation<T> = Box::new(move |parent: Consumer<T>| {
            if child.is_canceled() {
                child.report_finished();
                return;
            }
            dispatch(target, parent, child, handler);
        });
        self.shared().set_continuation(continuation, cancel_target);
        future
    }

    /// Runs `f` with the finished parent itself, so it can inspect results,
    /// progress or the stored exception. Skipped if the parent is canceled
    /// without an exception.
    pub fn then_future<U, F>(&self, f: F) -> Consumer<U>
    where
        U: Send + 'static,
        F: FnOnce(Consumer<T>) -> U + Send + 'static,
    {
        self.then_future_with(Launch::Sync, f)
    }

    pub fn then_future_with<U, F>(&self, launch: Launch, f: F) -> Consumer<U>
    where
        U: Send + 'static,
        F: FnOnce(Consumer<T>) -> U + Send + 'static,
    {
        self.chain(Target::Launch(launch), true, move |parent, child| {
            if parent.is_canceled() && !parent.has_exception() {
                child.report_canceled();
                return;
            }
            child.report_result(f(parent));
        })
    }
}

impl<T: Clone + Send + 'static> Consumer<T> {
    /// Runs `f` with the parent's first result once it finishes.
    ///
    /// A parent exception is passed on to the returned future without
    /// running `f`; a canceled parent, or one with no result, cancels it.
    ///
    /// ```
    /// use promise_interface::Consumer;
    /// let doubled = Consumer::ready(21).then(|v| v * 2);
    /// assert_eq!(doubled.result().unwrap(), 42);
    /// ```
    pub fn then<U, F>(&self, f: F) -> Consumer<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then_with(Launch::Sync, f)
    }

    pub fn then_with<U, F>(&self, launch: Launch, f: F) -> Consumer<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.chain(Target::Launch(launch), true, reporting(f))
    }

    /// Like [`then`](Self::then) but `f` runs on `context`. If the context is
    /// gone by the time the parent finishes, the returned future is canceled.
    pub fn then_on<U, F>(&self, context: Arc<dyn ExecutionContext>, f: F) -> Consumer<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.chain(Target::Context(context), true, reporting(f))
    }

    /// Like [`then`](Self::then), storing an `Err` as the new future's exception.
    pub fn try_then<U, E, F>(&self, f: F) -> Consumer<U>
    where
        U: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, E> + Send + 'static,
    {
        let handler = value_handler(move |value, child: &Producer<U>| match f(value) {
            Ok(value) => {
                child.report_result(value);
            }
            Err(e) => {
                child.report_exception(Exception::new(e));
            }
        });
        self.chain(Target::Launch(Launch::Sync), true, handler)
    }

    /// Handles a failed parent: `f` turns the exception into a value.
    /// Results of a successful parent pass through unchanged.
    pub fn on_failed<F>(&self, f: F) -> Consumer<T>
    where
        F: FnOnce(Exception) -> T + Send + 'static,
    {
        self.chain(Target::Launch(Launch::Sync), true, failure_handler(f))
    }

    pub fn on_failed_on<F>(&self, context: Arc<dyn ExecutionContext>, f: F) -> Consumer<T>
    where
        F: FnOnce(Exception) -> T + Send + 'static,
    {
        self.chain(Target::Context(context), true, failure_handler(f))
    }

    /// Handles a canceled parent: `f` supplies a replacement value.
    /// Exceptions and results of the parent pass through unchanged.
    pub fn on_canceled<F>(&self, f: F) -> Consumer<T>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.chain(Target::Launch(Launch::Sync), false, cancel_handler(f))
    }

    pub fn on_canceled_on<F>(&self, context: Arc<dyn ExecutionContext>, f: F) -> Consumer<T>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.chain(Target::Context(context), false, cancel_handler(f))
    }
}

fn reporting<T, U, F>(f: F) -> impl FnOnce(Consumer<T>, &Producer<U>) + Send + 'static
where
    T: Clone + Send + 'static,
    U: Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
{
    value_handler(move |value, child: &Producer<U>| {
        child.report_result(f(value));
    })
}

/// Feeds the parent's first result to `f`; exceptions and cancellation are
/// passed on without calling it.
fn value_handler<T, U, F>(f: F) -> impl FnOnce(Consumer<T>, &Producer<U>) + Send + 'static
where
    T: Clone + Send + 'static,
    U: Send + 'static,
    F: FnOnce(T, &Producer<U>) + Send + 'static,
{
    move |parent: Consumer<T>, child: &Producer<U>| {
        if let Some(e) = parent.exception() {
            child.report_exception(e);
            return;
        }
        if parent.is_canceled() {
            child.report_canceled();
            return;
        }
        match parent.result_at(0) {
            Ok(value) => f(value, child),
            Err(e) => {
                debug!(error = %e, "parent finished without a result; canceling continuation");
                child.report_canceled();
            }
        }
    }
}

fn forward<T: Clone + Send + 'static>(parent: &Consumer<T>, child: &Producer<T>) {
    match parent.results() {
        Ok(values) if !values.is_empty() => {
            child.report_results(values, None);
        }
        Ok(_) => {}
        Err(_) => child.report_canceled(),
    }
}

fn failure_handler<T, F>(f: F) -> impl FnOnce(Consumer<T>, &Producer<T>) + Send + 'static
where
    T: Clone + Send + 'static,
    F: FnOnce(Exception) -> T + Send + 'static,
{
    move |parent: Consumer<T>, child: &Producer<T>| {
        if let Some(e) = parent.exception() {
            child.report_result(f(e));
        } else if parent.is_canceled() {
            child.report_canceled();
        } else {
            forward(&parent, child);
        }
    }
}

fn cancel_handler<T, F>(f: F) -> impl FnOnce(Consumer<T>, &Producer<T>) + Send + 'static
where
    T: Clone + Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    move |parent: Consumer<T>, child: &Producer<T>| {
        if let Some(e) = parent.exception() {
            child.report_exception(e);
        } else if parent.is_canceled() {
            child.report_result(f());
        } else {
            forward(&parent, child);
        }
    }
}
