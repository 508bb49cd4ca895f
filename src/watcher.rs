//! Queued, serialized event delivery with back-pressure.
//!
//! A [`Watcher`] is an [`Observer`] that never runs user code on the
//! producer's thread. Events are queued as they are committed and handed to
//! the handler one at a time, either when the owner calls
//! [`Watcher::process_events`] or, when built with an execution context, by a
//! drain job posted to that context.
//!
//! Every queued `ResultsReady` counts as pending until delivered. Past
//! `max_pending_results` the watched future is marked `Throttled`, so a
//! producer calling `wait_while_throttled` stops outrunning a slow handler;
//! the flag is cleared once the backlog drains back under the limit.
//! Detaching starts a new generation: deliveries of events queued before it
//! no longer count against the backlog.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::config::WatcherConfig;
use crate::consumer::Consumer;
use crate::context::ExecutionContext;
use crate::event::{Event, Observer, ObserverId};
use crate::shared::StateHandle;

type Handler = Box<dyn FnMut(&Event) + Send>;

#[derive(Default)]
struct Queue {
    /// Each event is tagged with the generation it was queued in.
    events: VecDeque<(u64, Event)>,
    pending_results: usize,
    generation: u64,
    state: Option<StateHandle>,
    id: Option<ObserverId>,
    /// We raised `Throttled` and owe the future a release.
    throttling: bool,
}

struct WatcherInner {
    this: Weak<WatcherInner>,
    queue: Mutex<Queue>,
    handler: Mutex<Handler>,
    config: WatcherConfig,
    context: Option<Arc<dyn ExecutionContext>>,
    drain_scheduled: AtomicBool,
}

impl WatcherInner {
    fn schedule_drain(&self) {
        let Some(context) = &self.context else {
            return;
        };
        if self.drain_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = self.this.clone();
        context.post(Box::new(move || {
            if let Some(watcher) = weak.upgrade() {
                watcher.drain_scheduled.store(false, Ordering::Release);
                watcher.process_events();
            }
        }));
    }

    fn process_events(&self) -> usize {
        let mut handler = self.handler.lock();
        let mut delivered = 0;
        loop {
            let Some((generation, event)) = self.queue.lock().events.pop_front() else {
                break;
            };
            (*handler)(&event);
            delivered += 1;
            if let Event::ResultsReady { .. } = event {
                self.result_delivered(generation);
            }
        }
        delivered
    }

    fn result_delivered(&self, generation: u64) {
        let state = {
            let mut queue = self.queue.lock();
            if queue.generation != generation {
                return;
            }
            let before = queue.pending_results;
            queue.pending_results = before.saturating_sub(1);
            if before > self.config.max_pending_results || !queue.throttling {
                return;
            }
            queue.throttling = false;
            queue.state.clone()
        };
        if let Some(state) = state {
            trace!("watcher backlog drained; releasing throttle");
            state.set_throttled(false);
        }
    }

    /// Drops the backlog and releases a throttle we still hold.
    fn reset(&self) {
        let (dropped, state) = {
            let mut queue = self.queue.lock();
            queue.generation = queue.generation.wrapping_add(1);
            queue.pending_results = 0;
            let dropped = std::mem::take(&mut queue.events).len();
            let state = if std::mem::take(&mut queue.throttling) {
                queue.state.clone()
            } else {
                None
            };
            (dropped, state)
        };
        trace!(dropped, "watcher backlog discarded");
        if let Some(state) = state {
            state.set_throttled(false);
        }
    }
}

impl Observer for WatcherInner {
    fn on_event(&self, event: &Event) {
        {
            let mut queue = self.queue.lock();
            if let Event::ResultsReady { .. } = event {
                let before = queue.pending_results;
                queue.pending_results += 1;
                if before >= self.config.max_pending_results && !queue.throttling {
                    if let Some(state) = &queue.state {
                        trace!(pending = before + 1, "watcher backlog full; throttling future");
                        state.mark_throttled();
                        queue.throttling = true;
                    }
                }
            }
            let generation = queue.generation;
            queue.events.push_back((generation, event.clone()));
        }
        self.schedule_drain();
    }

    fn on_disconnect(&self) {
        trace!("watcher disconnected");
        self.reset();
    }
}

/// Watches one future at a time and delivers its events to a handler.
///
/// # Examples
///
/// ```
/// use promise_interface::{Event, Producer, Watcher};
/// use std::sync::{Arc, Mutex};
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// let watcher = Watcher::new(move |event: &Event| sink.lock().unwrap().push(event.clone()));
///
/// let (producer, consumer) = Producer::<u32>::new();
/// watcher.set_future(&consumer);
/// producer.report_started();
/// producer.finish_with(7);
///
/// watcher.process_events();
/// assert_eq!(seen.lock().unwrap().last(), Some(&Event::Finished));
/// ```
pub struct Watcher {
    inner: Arc<WatcherInner>,
}

impl Watcher {
    /// A watcher delivered by explicit [`process_events`](Self::process_events) calls.
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(&Event) + Send + 'static,
    {
        Self::with_options(WatcherConfig::default(), None, handler)
    }

    /// A watcher whose events are delivered on `context`.
    pub fn on_context<F>(context: Arc<dyn ExecutionContext>, handler: F) -> Self
    where
        F: FnMut(&Event) + Send + 'static,
    {
        Self::with_options(WatcherConfig::default(), Some(context), handler)
    }

    pub fn with_options<F>(
        config: WatcherConfig,
        context: Option<Arc<dyn ExecutionContext>>,
        handler: F,
    ) -> Self
    where
        F: FnMut(&Event) + Send + 'static,
    {
        let inner = Arc::new_cyclic(|this| WatcherInner {
            this: this.clone(),
            queue: Mutex::new(Queue::default()),
            handler: Mutex::new(Box::new(handler)),
            config,
            context,
            drain_scheduled: AtomicBool::new(false),
        });
        Self { inner }
    }

    pub fn set_future<T: Send + 'static>(&self, future: &Consumer<T>) {
        self.watch(future.state_handle())
    }

    /// Starts watching `state`, replacing any previous future. Events that
    /// happened before are replayed first.
    pub fn watch(&self, state: StateHandle) {
        self.detach();
        self.inner.queue.lock().state = Some(state.clone());
        let observer: Arc<dyn Observer> = self.inner.clone();
        let id = state.connect_observer(&observer);
        self.inner.queue.lock().id = Some(id);
    }

    /// Stops watching; undelivered events are discarded.
    pub fn detach(&self) {
        let (state, id) = {
            let mut queue = self.inner.queue.lock();
            (queue.state.clone(), queue.id.take())
        };
        if let (Some(state), Some(id)) = (&state, id) {
            state.disconnect_observer(id);
        }
        self.inner.reset();
        self.inner.queue.lock().state = None;
    }

    /// Delivers every queued event to the handler, in order. Concurrent
    /// callers are serialized. Must not be called from inside the handler.
    pub fn process_events(&self) -> usize {
        self.inner.process_events()
    }

    /// Queued, undelivered events.
    pub fn pending_events(&self) -> usize {
        self.inner.queue.lock().events.len()
    }

    /// Queued `ResultsReady` events the handler has not finished with.
    pub fn pending_results(&self) -> usize {
        self.inner.queue.lock().pending_results
    }

    pub fn state(&self) -> Option<StateHandle> {
        self.inner.queue.lock().state.clone()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("pending_events", &self.pending_events())
            .field("pending_results", &self.pending_results())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventLoop, Producer};
    use std::sync::mpsc;
    use std::thread;

    fn recording() -> (Arc<Mutex<Vec<Event>>>, impl FnMut(&Event) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |event: &Event| sink.lock().push(event.clone()))
    }

    #[test]
    fn late_watcher_gets_a_replay() {
        let (producer, consumer) = Producer::<i32>::new();
        producer.report_started();
        producer.report_results(vec![1, 2], None);
        producer.report_finished();

        let (seen, handler) = recording();
        let watcher = Watcher::new(handler);
        watcher.set_future(&consumer);
        assert_eq!(watcher.process_events(), 5);
        assert_eq!(
            *seen.lock(),
            vec![
                Event::Started,
                Event::ProgressRange { minimum: 0, maximum: 0 },
                Event::Progress { value: 2, text: String::new() },
                Event::ResultsReady { begin: 0, end: 2 },
                Event::Finished,
            ]
        );
    }

    #[test]
    fn backlog_throttles_until_drained() {
        let (producer, consumer) = Producer::<i32>::new();
        let (_, handler) = recording();
        let config = WatcherConfig::default().with_max_pending_results(2);
        let watcher = Watcher::with_options(config, None, handler);
        watcher.set_future(&consumer);

        producer.report_started();
        producer.report_result(1);
        producer.report_result(2);
        assert!(!producer.is_throttled());
        producer.report_result(3);
        assert!(producer.is_throttled());
        assert_eq!(watcher.pending_results(), 3);

        watcher.process_events();
        assert!(!producer.is_throttled());
        assert_eq!(watcher.pending_results(), 0);
    }

    #[test]
    fn throttled_producer_waits_for_the_watcher() {
        let (producer, consumer) = Producer::<i32>::new();
        let (seen, handler) = recording();
        let config = WatcherConfig::default().with_max_pending_results(1);
        let watcher = Watcher::with_options(config, None, handler);
        watcher.set_future(&consumer);

        let task = thread::spawn(move || {
            producer.report_started();
            for i in 0..10 {
                producer.wait_while_throttled();
                producer.report_result(i);
            }
            producer.report_finished();
        });
        while !consumer.is_finished() {
            watcher.process_events();
            thread::yield_now();
        }
        task.join().expect("The task thread has panicked");
        watcher.process_events();
        let ready = seen
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::ResultsReady { .. }))
            .count();
        assert_eq!(ready, 10);
    }

    #[test]
    fn context_delivery_is_serialized_on_the_loop() {
        let event_loop = EventLoop::new();
        let (seen, handler) = recording();
        let watcher = Watcher::on_context(event_loop.context(), handler);
        let (producer, consumer) = Producer::<i32>::new();
        watcher.set_future(&consumer);

        let task = thread::spawn(move || {
            producer.report_started();
            producer.report_result(1);
            producer.report_finished();
        });
        task.join().expect("The task thread has panicked");
        assert!(seen.lock().is_empty());
        event_loop.process_events();
        assert_eq!(seen.lock().last(), Some(&Event::Finished));
        assert_eq!(watcher.pending_events(), 0);
    }

    #[test]
    fn detach_discards_queued_events_and_releases_throttle() {
        let (producer, consumer) = Producer::<i32>::new();
        let (seen, handler) = recording();
        let config = WatcherConfig::default().with_max_pending_results(1);
        let watcher = Watcher::with_options(config, None, handler);
        watcher.set_future(&consumer);
        producer.report_started();
        producer.report_results(vec![1], None);
        producer.report_results(vec![2], None);
        assert!(consumer.is_throttled());

        watcher.detach();
        assert!(!consumer.is_throttled());
        assert_eq!(watcher.process_events(), 0);
        assert!(seen.lock().is_empty());
        producer.report_finished();
        assert_eq!(watcher.pending_events(), 0);
    }

    #[test]
    fn delivery_finishing_after_detach_leaves_the_backlog_empty() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut blocked = false;
        let handler = move |event: &Event| {
            if matches!(event, Event::ResultsReady { .. }) && !blocked {
                blocked = true;
                entered_tx.send(()).ok();
                release_rx.recv().ok();
            }
        };
        let config = WatcherConfig::default().with_max_pending_results(1);
        let watcher = Watcher::with_options(config, None, handler);

        let (producer, consumer) = Producer::<i32>::new();
        watcher.set_future(&consumer);
        producer.report_started();
        producer.report_result(1);
        assert_eq!(watcher.pending_results(), 1);

        thread::scope(|scope| {
            let draining = scope.spawn(|| watcher.process_events());
            entered_rx.recv().expect("handler should receive the result");
            watcher.detach();
            release_tx.send(()).ok();
            draining.join().expect("The draining thread has panicked");
        });
        assert_eq!(watcher.pending_results(), 0);

        let (next_producer, next_consumer) = Producer::<i32>::new();
        watcher.set_future(&next_consumer);
        next_producer.report_started();
        next_producer.report_result(1);
        assert_eq!(watcher.pending_results(), 1);
        assert!(!next_consumer.is_throttled());
        next_producer.report_result(2);
        assert!(next_consumer.is_throttled());
        watcher.process_events();
        assert!(!next_consumer.is_throttled());
    }
}
