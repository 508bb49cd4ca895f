use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::{Error, Exception};
use crate::event::{Connection, Observer};
use crate::pool::{TaskId, ThreadPool};
use crate::producer::Producer;
use crate::shared::{Shared, StateHandle, TypedRef};
use crate::state::{CancelMode, State};

/// The waiting/reading side of a future.
///
/// Cloning is cheap: every clone points at the same shared state. A
/// `Consumer` can be waited on from a thread (`wait_for_finished`,
/// `results`) or awaited from async code; awaiting resolves once the future
/// is finished or canceled.
///
/// # Examples
///
/// ```
/// use promise_interface::{Promise, Producer};
/// use futures::executor::block_on;
/// use std::thread;
/// let (promise, consumer) = Producer::<String>::new();
/// let consumer2 = consumer.clone();
/// let task1 = thread::spawn(move || block_on(async {
///     println!("Received on task 1 {:?}", consumer.await);
/// }));
/// let task2 = thread::spawn(move || block_on(async {
///     println!("Received on task 2 {:?}", consumer2.await);
/// }));
/// promise.resolve("Hi".into());
/// task1.join().expect("The task1 thread has panicked.");
/// task2.join().expect("The task2 thread has panicked.");
/// ```
pub struct Consumer<T: Send + 'static> {
    shared: TypedRef<T>,
}

impl<T: Send + 'static> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Consumer<T> {
    pub(crate) fn from_shared(shared: Arc<Shared<T>>) -> Self {
        Self {
            shared: TypedRef::new(shared),
        }
    }

    /// An already finished future holding `value`.
    pub fn ready(value: T) -> Self {
        Self::ready_results(vec![value])
    }

    pub fn ready_results(values: Vec<T>) -> Self {
        let (producer, consumer) = Producer::new();
        producer.report_started();
        producer.report_results(values, None);
        producer.report_finished();
        consumer
    }

    /// An already finished future carrying `exception`.
    pub fn failed(exception: Exception) -> Self {
        let (producer, consumer) = Producer::new();
        producer.report_started();
        producer.report_exception(exception);
        producer.report_finished();
        consumer
    }

    /// An already canceled and finished future.
    pub fn canceled() -> Self {
        let (producer, consumer) = Producer::new();
        producer.report_canceled();
        producer.report_finished();
        consumer
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
        self.shared.arc()
    }

    pub(crate) fn set_task(&self, task: TaskId) {
        self.shared.set_task(task)
    }

    pub(crate) fn thread_pool(&self) -> Option<Arc<dyn ThreadPool>> {
        self.shared.thread_pool()
    }

    /// Untyped handle; keeps the state alive but not the results.
    pub fn state_handle(&self) -> StateHandle {
        self.shared.arc().handle()
    }

    pub fn state(&self) -> State {
        self.shared.load()
    }

    pub fn is_started(&self) -> bool {
        self.state().contains(State::STARTED)
    }

    pub fn is_running(&self) -> bool {
        self.state().contains(State::RUNNING)
    }

    pub fn is_finished(&self) -> bool {
        self.state().contains(State::FINISHED)
    }

    pub fn is_canceled(&self) -> bool {
        self.state().contains(State::CANCELED)
    }

    pub fn is_suspending(&self) -> bool {
        self.state().contains(State::SUSPENDING)
    }

    pub fn is_suspended(&self) -> bool {
        self.state().contains(State::SUSPENDED)
    }

    pub fn is_throttled(&self) -> bool {
        self.state().contains(State::THROTTLED)
    }

    pub fn is_pending(&self) -> bool {
        self.state().contains(State::PENDING)
    }

    pub fn has_exception(&self) -> bool {
        self.shared.exception().is_some()
    }

    pub fn exception(&self) -> Option<Exception> {
        self.shared.exception()
    }

    pub fn progress_minimum(&self) -> i32 {
        self.shared.progress_snapshot().0
    }

    pub fn progress_maximum(&self) -> i32 {
        self.shared.progress_snapshot().1
    }

    pub fn progress_value(&self) -> i32 {
        self.shared.progress_snapshot().2
    }

    pub fn progress_text(&self) -> String {
        self.shared.progress_snapshot().3
    }

    pub fn result_count(&self) -> usize {
        self.shared.result_count()
    }

    pub fn is_result_ready_at(&self, index: usize) -> bool {
        self.shared.is_result_ready_at(index)
    }

    /// Requests cancellation and returns at once; the producer notices at
    /// its next report or suspension point.
    pub fn cancel(&self) {
        self.shared.cancel(CancelMode::CancelOnly)
    }

    /// Cancels and marks the future finished right away.
    pub fn cancel_and_finish(&self) {
        self.shared.cancel(CancelMode::CancelAndFinish)
    }

    pub fn set_suspended(&self, suspend: bool) {
        self.shared.set_suspended(suspend)
    }

    pub fn suspend(&self) {
        self.set_suspended(true)
    }

    pub fn resume(&self) {
        self.set_suspended(false)
    }

    pub fn toggle_suspended(&self) {
        self.shared.toggle_suspended()
    }

    /// Blocks until the future is finished or canceled.
    ///
    /// If the producing task is still queued on its pool it is run on the
    /// calling thread first. Returns the stored exception, if any.
    pub fn wait_for_finished(&self) -> Result<(), Error> {
        self.shared.wait_for_finished()
    }

    /// Blocks until result `index` is ready or the future stops. Returns
    /// whether the result is there.
    pub fn wait_for_result(&self, index: usize) -> Result<bool, Error> {
        self.shared.wait_for_result(Some(index))
    }

    /// Blocks until at least one more result than now is ready, or the
    /// future stops.
    pub fn wait_for_next_result(&self) -> Result<bool, Error> {
        self.shared.wait_for_result(None)
    }

    /// Attaches `observer` for as long as the returned guard lives. Past
    /// events are replayed to it first.
    pub fn observe(&self, observer: Arc<dyn Observer>) -> Connection {
        Connection::new(self.state_handle(), observer)
    }

    /// Waits for completion and removes the first result, resetting the
    /// result storage. Meant for futures read exactly once.
    pub fn take_result(&self) -> Result<T, Error> {
        self.shared.take_result()
    }
}

impl<T: Clone + Send + 'static> Consumer<T> {
    /// Waits for result `index` and returns a copy.
    pub fn result_at(&self, index: usize) -> Result<T, Error> {
        self.shared.result_at(index)
    }

    /// The first result.
    pub fn result(&self) -> Result<T, Error> {
        self.result_at(0)
    }

    /// Waits for completion and returns every result in index order.
    pub fn results(&self) -> Result<Vec<T>, Error> {
        self.shared.results()
    }

    /// Blocking iterator over results, yielding each as soon as it is ready.
    pub fn iter(&self) -> ResultIter<T> {
        ResultIter {
            consumer: self.clone(),
            index: 0,
        }
    }
}

impl<T: Clone + Send + 'static> Future for Consumer<T> {
    type Output = Result<Vec<T>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.shared.poll_outcome(cx.waker()) {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Iterator returned by [`Consumer::iter`].
///
/// `next` blocks until the following index is ready; it ends when the
/// future stops without producing it. A stored exception ends iteration.
pub struct ResultIter<T: Send + 'static> {
    consumer: Consumer<T>,
    index: usize,
}

impl<T: Clone + Send + 'static> Iterator for ResultIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        match self.consumer.wait_for_result(self.index) {
            Ok(true) => {
                let value = self.consumer.result_at(self.index).ok()?;
                self.index += 1;
                Some(value)
            }
            _ => None,
        }
    }
}

impl<T: Clone + Send + 'static> IntoIterator for &Consumer<T> {
    type Item = T;
    type IntoIter = ResultIter<T>;

    fn into_iter(self) -> ResultIter<T> {
        self.iter()
    }
}
