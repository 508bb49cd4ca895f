use std::fmt;
use std::sync::Arc;

use crate::config::ProgressConfig;
use crate::consumer::Consumer;
use crate::error::Exception;
use crate::pool::ThreadPool;
use crate::shared::{Shared, TypedRef};
use crate::state::{CancelMode, State};
use crate::Promise;

/// The reporting side of a future.
///
/// A `Producer` is not `Clone`: one task owns it and reports through it.
/// Any number of [`Consumer`]s can be obtained with [`future`](Self::future).
/// Dropping a producer that never reported `Finished` cancels and finishes
/// the future so no consumer waits forever.
///
/// # Examples
///
/// ```
/// use promise_interface::Producer;
/// use std::thread;
/// let (producer, consumer) = Producer::<String>::new();
///
/// let task = thread::spawn(move || {
///     producer.report_started();
///     producer.report_result("Hi".to_owned());
///     producer.report_finished();
/// });
/// assert_eq!(consumer.results().unwrap(), vec!["Hi".to_owned()]);
/// task.join().expect("The task thread has panicked.");
/// ```
pub struct Producer<T: Send + 'static> {
    shared: TypedRef<T>,
}

impl<T: Send + 'static> Producer<T> {
    pub fn new() -> (Self, Consumer<T>) {
        Self::with_state(State::NO_STATE)
    }

    pub fn with_config(config: &ProgressConfig) -> (Self, Consumer<T>) {
        let (producer, consumer) = Self::new();
        producer.shared.set_progress_config(config);
        (producer, consumer)
    }

    pub(crate) fn with_state(initial: State) -> (Self, Consumer<T>) {
        let shared = Shared::new(initial);
        let consumer = Consumer::from_shared(shared.clone());
        (
            Self {
                shared: TypedRef::new(shared),
            },
            consumer,
        )
    }

    /// Another consumer handle for this future.
    pub fn future(&self) -> Consumer<T> {
        Consumer::from_shared(self.shared.arc().clone())
    }

    pub fn report_started(&self) {
        self.shared.report_started()
    }

    /// Appends a result. Returns `false` if the future is canceled or finished.
    pub fn report_result(&self, value: T) -> bool {
        self.shared.report_results(None, vec![value], 1)
    }

    /// Stores a result at `index`; `false` if the index is taken or the
    /// future is terminal.
    pub fn report_result_at(&self, value: T, index: usize) -> bool {
        self.shared.report_results(Some(index), vec![value], 1)
    }

    /// Builds the result only once it is known to be accepted.
    pub fn emplace_result<F>(&self, index: Option<usize>, make: F) -> bool
    where
        F: FnOnce() -> T,
    {
        self.shared.emplace_result(index, make)
    }

    /// Reports a batch; `begin: None` appends.
    pub fn report_results(&self, values: Vec<T>, begin: Option<usize>) -> bool {
        let slots = values.len();
        self.shared.report_results(begin, values, slots)
    }

    /// Reports the outcome of `slots` source items in filter mode, of which
    /// only `values` survived. An empty `values` marks them filtered out.
    pub fn report_filtered_results(&self, values: Vec<T>, begin: usize, slots: usize) -> bool {
        self.shared.report_results(Some(begin), values, slots)
    }

    pub fn set_filter_mode(&self, enable: bool) {
        self.shared.set_filter_mode(enable)
    }

    pub fn set_expected_result_count(&self, count: usize) {
        self.shared.set_expected_result_count(count)
    }

    pub fn set_progress_range(&self, minimum: i32, maximum: i32) {
        self.shared.set_progress_range(minimum, maximum)
    }

    /// Sets progress and its text. Values that do not increase, fall outside
    /// a configured range, or arrive after completion are ignored.
    pub fn report_progress(&self, value: i32, text: impl Into<String>) {
        self.shared
            .set_progress_value_and_text(value, Some(text.into()))
    }

    /// Like [`report_progress`](Self::report_progress) but keeps the text.
    pub fn set_progress_value(&self, value: i32) {
        self.shared.set_progress_value_and_text(value, None)
    }

    pub fn set_progress_text(&self, text: impl Into<String>) {
        self.shared.set_progress_text(text.into())
    }

    pub fn report_finished(&self) {
        self.shared.report_finished()
    }

    /// Convenience for a single-result future: report `value`, then finish.
    pub fn finish_with(&self, value: T) {
        self.report_result(value);
        self.report_finished();
    }

    pub fn report_canceled(&self) {
        self.shared.cancel(CancelMode::CancelOnly)
    }

    /// Stores `exception`, discarding any results reported so far.
    pub fn report_exception(&self, exception: Exception) -> bool {
        self.shared.report_exception(exception)
    }

    /// Safe point for suspension: blocks while a consumer has the future
    /// suspended.
    pub fn suspend_if_requested(&self) {
        self.shared.suspend_if_requested()
    }

    /// Blocks while a suspension is requested, without entering `Suspended`.
    pub fn wait_for_resume(&self) {
        self.shared.wait_for_resume()
    }

    /// Blocks while a watcher has the future throttled.
    pub fn wait_while_throttled(&self) {
        self.shared.wait_while_throttled()
    }

    pub fn state(&self) -> State {
        self.shared.load()
    }

    pub fn is_canceled(&self) -> bool {
        self.state().contains(State::CANCELED)
    }

    pub fn is_finished(&self) -> bool {
        self.state().contains(State::FINISHED)
    }

    pub fn is_suspending(&self) -> bool {
        self.state().contains(State::SUSPENDING)
    }

    pub fn is_throttled(&self) -> bool {
        self.state().contains(State::THROTTLED)
    }

    pub fn expected_result_count(&self) -> usize {
        self.shared.expected_result_count()
    }

    /// Pool the producing task runs on; parked producers give their slot back.
    pub fn set_thread_pool(&self, pool: Option<Arc<dyn ThreadPool>>) {
        self.shared.set_thread_pool(pool, None)
    }
}

impl<T: Send + 'static> Promise<T> for Producer<T> {
    type Waiter = Consumer<T>;

    fn new() -> (Self, Self::Waiter) {
        Producer::new()
    }

    fn resolve(self, value: T) {
        self.report_started();
        self.finish_with(value);
    }

    fn reject(self, exception: Exception) {
        self.report_started();
        self.report_exception(exception);
        self.report_finished();
    }
}

impl<T: Send + 'static> Drop for Producer<T> {
    /// If this is an unfinished producer, cancel and finish the future.
    fn drop(&mut self) {
        self.shared.abandon();
    }
}

impl<T: Send + 'static> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::Producer;
    use crate::{Error, Event, Exception, Observer, Promise};
    use futures::executor::block_on;
    use parking_lot::Mutex;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    impl Observer for Recorder {
        fn on_event(&self, event: &Event) {
            self.0.lock().push(event.clone());
        }
    }

    fn attach<T: Send + 'static>(consumer: &crate::Consumer<T>) -> (Arc<Recorder>, crate::Connection) {
        let recorder = Arc::new(Recorder::default());
        let connection = consumer.observe(recorder.clone());
        (recorder, connection)
    }

    #[test]
    fn test_promise_out_resolve() {
        let (op, op_a) = Producer::<String>::new();
        let task1 = thread::spawn(move || block_on(async { op_a.await.unwrap() }));
        let task2 = thread::spawn(move || op.resolve(String::from("🍓")));
        task2.join().expect("The task2 thread has panicked");
        let got = task1.join().expect("The task1 thread has panicked");
        assert_eq!(got, vec![String::from("🍓")]);
    }

    #[test]
    fn test_promise_out_unresolved() {
        let (op, op_a) = Producer::<String>::new();
        let task2 = thread::spawn(move || std::mem::drop(op));
        task2.join().expect("The task2 thread has panicked");
        let got = block_on(op_a.clone());
        assert!(matches!(got, Err(Error::ProducerDropped)));
        assert!(op_a.is_canceled() && op_a.is_finished());
    }

    #[test]
    fn test_promise_out_reject() {
        let (a, b) = Producer::<String>::new();
        thread::spawn(move || a.reject(Exception::msg("reject!!")))
            .join()
            .expect("The task thread has panicked");
        let err = block_on(b).expect_err("rejected");
        assert_eq!(err.to_string(), "reject!!");
    }

    #[test]
    fn reports_after_finish_are_rejected() {
        let (producer, consumer) = Producer::<i32>::new();
        let (events, _conn) = attach(&consumer);
        producer.report_started();
        assert!(producer.report_result(1));
        producer.report_finished();
        producer.report_finished();
        assert!(!producer.report_result(2));
        assert!(!producer.report_exception(Exception::msg("late")));
        producer.report_progress(10, "late");

        let events = events.0.lock();
        let finished = events.iter().filter(|e| **e == Event::Finished).count();
        assert_eq!(finished, 1);
        assert_eq!(consumer.results().unwrap(), vec![1]);
        assert_eq!(consumer.progress_value(), 1);
    }

    #[test]
    fn results_drive_progress_in_automatic_mode() {
        let (producer, consumer) = Producer::<i32>::new();
        let (events, _conn) = attach(&consumer);
        producer.report_started();
        producer.report_results(vec![1, 2, 3], None);
        let events = events.0.lock();
        assert_eq!(
            &events[events.len() - 2..],
            &[
                Event::Progress { value: 3, text: String::new() },
                Event::ResultsReady { begin: 0, end: 3 },
            ]
        );
        assert_eq!(consumer.progress_value(), 3);
    }

    #[test]
    fn progress_outside_range_or_backwards_is_ignored() {
        let (producer, consumer) = Producer::<()>::new();
        producer.report_started();
        producer.set_progress_range(0, 100);
        producer.report_progress(50, "half");
        producer.report_progress(40, "back");
        producer.report_progress(150, "over");
        assert_eq!(consumer.progress_value(), 50);
        assert_eq!(consumer.progress_text(), "half");
        producer.set_progress_value(100);
        assert_eq!(consumer.progress_value(), 100);
        assert_eq!(consumer.progress_text(), "half");
    }

    #[test]
    fn progress_events_are_rate_limited_except_first_and_last() {
        let (producer, consumer) = Producer::<()>::new();
        let (events, _conn) = attach(&consumer);
        producer.report_started();
        producer.set_progress_range(0, 1000);
        for value in 1..=1000 {
            producer.set_progress_value(value);
        }
        let progress: Vec<i32> = events
            .0
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Progress { value, .. } if *value > 0 => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(progress.first(), Some(&1));
        assert_eq!(progress.last(), Some(&1000));
        assert!(progress.len() < 1000);
    }

    #[test]
    fn exception_discards_partial_results() {
        let (producer, consumer) = Producer::<i32>::new();
        producer.report_started();
        producer.report_result(1);
        producer.report_result(2);
        assert!(producer.report_exception(Exception::msg("boom")));
        assert!(!producer.report_result(3));
        producer.report_finished();

        assert_eq!(consumer.result_count(), 0);
        assert!(matches!(consumer.results(), Err(Error::Exception(_))));
        assert!(matches!(consumer.take_result(), Err(Error::Exception(_))));
        assert!(matches!(consumer.result_at(0), Err(Error::Exception(_))));
        assert!(consumer.is_canceled());
    }

    #[test]
    fn emplace_skips_construction_when_rejected() {
        let (producer, consumer) = Producer::<String>::new();
        producer.report_started();
        assert!(producer.emplace_result(Some(0), || "a".to_owned()));
        assert!(!producer.emplace_result(Some(0), || unreachable!()));
        producer.report_finished();
        assert_eq!(consumer.result().unwrap(), "a");
    }

    #[test]
    fn rejected_progress_keeps_automatic_mode() {
        let (producer, consumer) = Producer::<i32>::new();
        producer.report_started();
        producer.report_progress(0, "nothing yet");
        producer.report_results(vec![1, 2], None);
        assert_eq!(consumer.progress_value(), 2);
        assert_eq!(consumer.progress_text(), "");
    }

    #[test]
    fn progress_range_after_finish_is_ignored() {
        let (producer, consumer) = Producer::<()>::new();
        let (events, _conn) = attach(&consumer);
        producer.report_started();
        producer.set_progress_range(0, 4);
        producer.report_finished();
        producer.set_progress_range(10, 20);

        let ranges = events
            .0
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::ProgressRange { .. }))
            .count();
        assert_eq!(ranges, 1);
        assert_eq!(consumer.progress_minimum(), 0);
        assert_eq!(consumer.progress_maximum(), 4);
    }

    #[test]
    fn wait_for_resume_blocks_without_entering_suspended() {
        let (producer, consumer) = Producer::<u8>::new();
        producer.report_started();
        consumer.suspend();

        let (tx, rx) = mpsc::channel();
        let task = thread::spawn(move || {
            producer.wait_for_resume();
            tx.send(producer.state()).ok();
        });
        assert!(rx.recv_timeout(Duration::from_millis(30)).is_err());
        assert!(consumer.is_suspending());
        assert!(!consumer.is_suspended());

        consumer.resume();
        let state = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("producer should wake on resume");
        assert!(!state.intersects(crate::State::SUSPENDING | crate::State::SUSPENDED));
        task.join().expect("The task thread has panicked");
    }
}
