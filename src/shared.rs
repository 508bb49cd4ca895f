//! The state object every producer and consumer handle points at.
//!
//! One `Shared<T>` per future. All fields live behind a single mutex except
//! the flag word, which non-blocking queries read without locking. Observer
//! call-outs happen while the lock is held so that each observer sees events
//! in commit order; continuations and async wakers run after it is released.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::config::ProgressConfig;
use crate::consumer::Consumer;
use crate::error::{Error, Exception};
use crate::event::{Event, Observer, ObserverId};
use crate::pool::{ReleasedSlot, TaskId, ThreadPool};
use crate::result_store::ResultStore;
use crate::state::{AtomicState, CancelMode, State};

pub(crate) type Continuation<T> = Box<dyn FnOnce(Consumer<T>) + Send + 'static>;

/// Results and exception are mutually exclusive.
pub(crate) enum Payload<T> {
    Values(ResultStore<T>),
    Exception(Exception),
}

struct Progress {
    minimum: i32,
    maximum: i32,
    value: i32,
    text: String,
    /// A range or text was configured; results no longer drive progress.
    manual: bool,
    interval: Option<Duration>,
    last_emit: Option<Instant>,
}

impl Progress {
    fn new(config: &ProgressConfig) -> Self {
        Self {
            minimum: 0,
            maximum: 0,
            value: 0,
            text: String::new(),
            manual: false,
            interval: config.min_interval(),
            last_emit: None,
        }
    }

    fn has_range(&self) -> bool {
        self.minimum != 0 || self.maximum != 0
    }

    /// Rate limiter: the first emission and the one hitting `maximum` always pass.
    fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        let due = match (self.last_emit, self.interval) {
            (None, _) | (_, None) => true,
            _ if self.has_range() && self.value == self.maximum => true,
            (Some(last), Some(interval)) => now.duration_since(last) >= interval,
        };
        if due {
            self.last_emit = Some(now);
        }
        due
    }

    fn event(&self) -> Event {
        Event::Progress {
            value: self.value,
            text: self.text.clone(),
        }
    }
}

pub(crate) struct Inner<T: Send + 'static> {
    payload: Payload<T>,
    progress: Progress,
    expected_result_count: usize,
    continuation: Option<Continuation<T>>,
    continuation_target: Option<Weak<dyn ErasedState>>,
    observers: Vec<(ObserverId, Weak<dyn Observer>)>,
    pool: Option<Arc<dyn ThreadPool>>,
    task: Option<TaskId>,
    wakers: Vec<Waker>,
    producer_dropped: bool,
}

impl<T: Send + 'static> Inner<T> {
    fn new() -> Self {
        Self {
            payload: Payload::Values(ResultStore::new()),
            progress: Progress::new(&ProgressConfig::default()),
            expected_result_count: 0,
            continuation: None,
            continuation_target: None,
            observers: Vec::new(),
            pool: None,
            task: None,
            wakers: Vec::new(),
            producer_dropped: false,
        }
    }

    /// Delivers `event` to every live observer, pruning dead ones.
    fn send(&mut self, event: Event) {
        self.observers.retain(|(_, observer)| match observer.upgrade() {
            Some(observer) => {
                observer.on_event(&event);
                true
            }
            None => false,
        });
    }

    fn store(&self) -> Option<&ResultStore<T>> {
        match &self.payload {
            Payload::Values(store) => Some(store),
            Payload::Exception(_) => None,
        }
    }

    fn exception(&self) -> Option<&Exception> {
        match &self.payload {
            Payload::Exception(e) => Some(e),
            Payload::Values(_) => None,
        }
    }

    fn result_count(&self) -> usize {
        self.store().map_or(0, ResultStore::count)
    }

    fn is_ready_at(&self, index: usize) -> bool {
        self.store().is_some_and(|store| store.contains(index))
    }

    /// Error for a read that found nothing at `index`.
    fn missing(&self, state: State, index: usize) -> Error {
        if let Some(e) = self.exception() {
            Error::Exception(e.clone())
        } else if self.producer_dropped {
            Error::ProducerDropped
        } else if state.contains(State::CANCELED) {
            Error::Canceled
        } else {
            Error::NoResult(index)
        }
    }
}

/// The untyped part of a future, shared with watchers and continuation
/// parents that do not know `T`.
pub(crate) trait ErasedState: Send + Sync {
    fn state(&self) -> State;
    fn cancel(&self, mode: CancelMode);
    fn set_suspended(&self, suspend: bool);
    fn mark_throttled(&self);
    fn set_throttled(&self, enable: bool);
    fn connect_observer(&self, observer: &Arc<dyn Observer>) -> ObserverId;
    fn disconnect_observer(&self, id: ObserverId);
    fn wait_for_finished(&self) -> Result<(), Error>;
    fn result_count(&self) -> usize;
    fn progress(&self) -> (i32, i32, i32, String);
}

pub(crate) struct Shared<T: Send + 'static> {
    this: Weak<Shared<T>>,
    state: AtomicState,
    inner: Mutex<Inner<T>>,
    /// Waiters for results and for `Finished`/`Canceled`.
    finished: Condvar,
    /// Producers parked by suspension or throttling.
    resume: Condvar,
    /// Typed handles alive; at zero the result payload is dropped.
    typed_refs: AtomicUsize,
}

fn is_done(state: State) -> bool {
    state.intersects(State::FINISHED | State::CANCELED)
}

fn wake_all(wakers: Vec<Waker>) {
    for waker in wakers {
        waker.wake();
    }
}

fn propagate_cancel(target: Option<Weak<dyn ErasedState>>) {
    if let Some(target) = target.and_then(|t| t.upgrade()) {
        trace!("propagating cancellation to continuation");
        target.cancel(CancelMode::CancelOnly);
    }
}

impl<T: Send + 'static> Shared<T> {
    pub(crate) fn new(initial: State) -> Arc<Self> {
        Arc::new_cyclic(|this| Shared {
            this: this.clone(),
            state: AtomicState::new(initial),
            inner: Mutex::new(Inner::new()),
            finished: Condvar::new(),
            resume: Condvar::new(),
            typed_refs: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock()
    }

    pub(crate) fn load(&self) -> State {
        self.state.load()
    }

    pub(crate) fn handle(self: &Arc<Self>) -> StateHandle {
        let this: Arc<dyn ErasedState> = self.clone();
        StateHandle(this)
    }

    pub(crate) fn weak_erased(&self) -> Weak<dyn ErasedState> {
        let weak: Weak<dyn ErasedState> = self.this.clone();
        weak
    }

    pub(crate) fn set_progress_config(&self, config: &ProgressConfig) {
        self.lock().progress.interval = config.min_interval();
    }

    pub(crate) fn report_started(&self) {
        let mut inner = self.lock();
        let state = self.load();
        if state.intersects(State::STARTED | State::CANCELED | State::FINISHED) {
            return;
        }
        self.state
            .switch_from_to(State::PENDING, State::STARTED | State::RUNNING);
        trace!(state = ?self.load(), "future started");
        inner.send(Event::Started);
    }

    pub(crate) fn report_results(&self, begin: Option<usize>, values: Vec<T>, slots: usize) -> bool {
        let mut inner = self.lock();
        if is_done(self.load()) {
            debug!("result report rejected: future already canceled or finished");
            return false;
        }
        let insertion = match &mut inner.payload {
            Payload::Values(store) => store.add_results(begin, values, slots),
            Payload::Exception(_) => None,
        };
        match insertion {
            Some(insertion) => {
                self.results_ready(&mut inner, insertion.ready);
                true
            }
            None => {
                debug!(?begin, "result report rejected: index already taken");
                false
            }
        }
    }

    pub(crate) fn emplace_result<F>(&self, index: Option<usize>, make: F) -> bool
    where
        F: FnOnce() -> T,
    {
        let mut inner = self.lock();
        if is_done(self.load()) {
            return false;
        }
        let insertion = match &mut inner.payload {
            Payload::Values(store) => store.emplace_result(index, make),
            Payload::Exception(_) => None,
        };
        match insertion {
            Some(insertion) => {
                self.results_ready(&mut inner, insertion.ready);
                true
            }
            None => false,
        }
    }

    fn results_ready(&self, inner: &mut Inner<T>, ready: Vec<std::ops::Range<usize>>) {
        // filter-mode ranges are cumulative prefixes, others are disjoint
        let cumulative = inner.store().is_some_and(ResultStore::filter_mode);
        for range in ready.into_iter().filter(|r| !r.is_empty()) {
            self.finished.notify_all();
            if !inner.progress.manual {
                let value = if cumulative {
                    i32::try_from(range.end).unwrap_or(i32::MAX)
                } else {
                    let added = i32::try_from(range.len()).unwrap_or(i32::MAX);
                    inner.progress.value.saturating_add(added)
                };
                inner.progress.value = inner.progress.value.max(value);
                if inner.progress.should_emit() {
                    let progress = inner.progress.event();
                    inner.send(progress);
                }
            }
            inner.send(Event::ResultsReady {
                begin: range.start,
                end: range.end,
            });
        }
    }

    pub(crate) fn set_filter_mode(&self, enable: bool) {
        if let Payload::Values(store) = &mut self.lock().payload {
            store.set_filter_mode(enable);
        }
    }

    pub(crate) fn set_expected_result_count(&self, count: usize) {
        self.lock().expected_result_count = count;
    }

    pub(crate) fn expected_result_count(&self) -> usize {
        self.lock().expected_result_count
    }

    pub(crate) fn set_progress_range(&self, minimum: i32, maximum: i32) {
        let mut inner = self.lock();
        if is_done(self.load()) {
            return;
        }
        let progress = &mut inner.progress;
        progress.manual = true;
        progress.minimum = minimum;
        progress.maximum = maximum.max(minimum);
        progress.value = minimum;
        let event = Event::ProgressRange {
            minimum: progress.minimum,
            maximum: progress.maximum,
        };
        inner.send(event);
    }

    /// `text: None` keeps the current text.
    pub(crate) fn set_progress_value_and_text(&self, value: i32, text: Option<String>) {
        let mut inner = self.lock();
        if is_done(self.load()) {
            return;
        }
        let progress = &mut inner.progress;
        if progress.has_range() && (value < progress.minimum || value > progress.maximum) {
            return;
        }
        if progress.value >= value {
            return;
        }
        progress.manual = true;
        progress.value = value;
        if let Some(text) = text {
            progress.text = text;
        }
        if progress.should_emit() {
            let event = progress.event();
            inner.send(event);
        }
    }

    pub(crate) fn set_progress_text(&self, text: String) {
        let mut inner = self.lock();
        if is_done(self.load()) {
            return;
        }
        inner.progress.manual = true;
        inner.progress.text = text;
        let event = inner.progress.event();
        inner.send(event);
    }

    pub(crate) fn progress_snapshot(&self) -> (i32, i32, i32, String) {
        let inner = self.lock();
        let p = &inner.progress;
        (p.minimum, p.maximum, p.value, p.text.clone())
    }

    pub(crate) fn report_finished(&self) {
        let (continuation, wakers) = {
            let mut inner = self.lock();
            if self.load().contains(State::FINISHED) {
                return;
            }
            self.state.switch_from_to(
                State::RUNNING | State::PENDING,
                State::FINISHED,
            );
            trace!(state = ?self.load(), "future finished");
            self.finished.notify_all();
            inner.send(Event::Finished);
            (inner.continuation.take(), std::mem::take(&mut inner.wakers))
        };
        wake_all(wakers);
        self.run_continuation(continuation);
    }

    pub(crate) fn report_exception(&self, exception: Exception) -> bool {
        let wakers = {
            let mut inner = self.lock();
            if is_done(self.load()) {
                debug!("exception report rejected: future already canceled or finished");
                return false;
            }
            debug!(%exception, "future failed");
            inner.payload = Payload::Exception(exception);
            self.state.switch_on(State::CANCELED);
            self.finished.notify_all();
            self.resume.notify_all();
            inner.send(Event::Canceled);
            std::mem::take(&mut inner.wakers)
        };
        wake_all(wakers);
        true
    }

    pub(crate) fn cancel(&self, mode: CancelMode) {
        let (target, continuation, wakers) = {
            let mut inner = self.lock();
            let old = self.load();
            match mode {
                CancelMode::CancelOnly => {
                    if old.contains(State::CANCELED) {
                        return;
                    }
                    self.state
                        .switch_from_to(State::SUSPENDING | State::SUSPENDED, State::CANCELED);
                }
                CancelMode::CancelAndFinish => {
                    if old.contains(State::CANCELED | State::FINISHED) {
                        return;
                    }
                    self.state.switch_from_to(
                        State::SUSPENDING | State::SUSPENDED | State::RUNNING | State::PENDING,
                        State::CANCELED | State::FINISHED,
                    );
                }
            }
            trace!(state = ?self.load(), ?mode, "future canceled");
            self.finished.notify_all();
            self.resume.notify_all();
            if !old.contains(State::CANCELED) {
                inner.send(Event::Canceled);
            }
            let mut continuation = None;
            if mode == CancelMode::CancelAndFinish && !old.contains(State::FINISHED) {
                inner.send(Event::Finished);
                continuation = inner.continuation.take();
            }
            let target = if old.contains(State::FINISHED) || inner.exception().is_some() {
                None
            } else {
                inner.continuation_target.clone()
            };
            (target, continuation, std::mem::take(&mut inner.wakers))
        };
        wake_all(wakers);
        propagate_cancel(target);
        self.run_continuation(continuation);
    }

    pub(crate) fn set_suspended(&self, suspend: bool) {
        let mut inner = self.lock();
        let state = self.load();
        if is_done(state) {
            return;
        }
        let suspended = state.intersects(State::SUSPENDING | State::SUSPENDED);
        if suspend && !suspended {
            self.state.switch_on(State::SUSPENDING);
            trace!("suspension requested");
            inner.send(Event::Suspending);
        } else if !suspend && suspended {
            self.state
                .switch_off(State::SUSPENDING | State::SUSPENDED);
            trace!("future resumed");
            self.resume.notify_all();
            inner.send(Event::Resumed);
        }
    }

    pub(crate) fn toggle_suspended(&self) {
        let suspended = self
            .load()
            .intersects(State::SUSPENDING | State::SUSPENDED);
        self.set_suspended(!suspended);
    }

    /// Parks the calling producer thread if a suspension was requested.
    pub(crate) fn suspend_if_requested(&self) {
        let can_suspend = |s: State| s.contains(State::RUNNING) && s.contains(State::SUSPENDING);
        if !can_suspend(self.load()) {
            return;
        }
        let mut inner = self.lock();
        if !can_suspend(self.load()) {
            return;
        }
        self.state
            .switch_from_to(State::SUSPENDING, State::SUSPENDED);
        trace!("future suspended");
        inner.send(Event::Suspended);

        let _slot = ReleasedSlot::new(inner.pool.clone());
        while self.load().contains(State::SUSPENDED) && !self.load().contains(State::CANCELED) {
            self.resume.wait(&mut inner);
        }
    }

    pub(crate) fn wait_for_resume(&self) {
        let must_wait = |s: State| {
            s.intersects(State::SUSPENDING | State::SUSPENDED) && !s.contains(State::CANCELED)
        };
        if !must_wait(self.load()) {
            return;
        }
        let mut inner = self.lock();
        if !must_wait(self.load()) {
            return;
        }
        let _slot = ReleasedSlot::new(inner.pool.clone());
        while must_wait(self.load()) {
            self.resume.wait(&mut inner);
        }
    }

    pub(crate) fn wait_while_throttled(&self) {
        let must_wait = |s: State| s.contains(State::THROTTLED) && !is_done(s);
        if !must_wait(self.load()) {
            return;
        }
        let mut inner = self.lock();
        let _slot = ReleasedSlot::new(inner.pool.clone());
        while must_wait(self.load()) {
            self.resume.wait(&mut inner);
        }
    }

    pub(crate) fn mark_throttled(&self) {
        self.state.switch_on(State::THROTTLED);
    }

    pub(crate) fn set_throttled(&self, enable: bool) {
        let _inner = self.lock();
        if enable {
            self.state.switch_on(State::THROTTLED);
        } else {
            self.state.switch_off(State::THROTTLED);
            if !self
                .load()
                .intersects(State::SUSPENDING | State::SUSPENDED | State::CANCELED)
            {
                self.resume.notify_all();
            }
        }
    }

    /// Replays the history an observer missed, then adds it to the live list.
    pub(crate) fn connect_observer(&self, observer: &Arc<dyn Observer>) -> ObserverId {
        let mut inner = self.lock();
        let state = self.load();
        if state.contains(State::STARTED) {
            observer.on_event(&Event::Started);
            observer.on_event(&Event::ProgressRange {
                minimum: inner.progress.minimum,
                maximum: inner.progress.maximum,
            });
            observer.on_event(&inner.progress.event());
        }
        if let Some(store) = inner.store() {
            for range in store.ready_ranges() {
                observer.on_event(&Event::ResultsReady {
                    begin: range.start,
                    end: range.end,
                });
            }
        }
        if state.contains(State::SUSPENDED) {
            observer.on_event(&Event::Suspended);
        } else if state.contains(State::SUSPENDING) {
            observer.on_event(&Event::Suspending);
        }
        if state.contains(State::CANCELED) {
            observer.on_event(&Event::Canceled);
        }
        if state.contains(State::FINISHED) {
            observer.on_event(&Event::Finished);
        }
        let id = ObserverId::next();
        inner.observers.push((id, Arc::downgrade(observer)));
        trace!(%id, "observer connected");
        id
    }

    pub(crate) fn disconnect_observer(&self, id: ObserverId) {
        let removed = {
            let mut inner = self.lock();
            let position = inner.observers.iter().position(|(i, _)| *i == id);
            position.map(|p| inner.observers.remove(p).1)
        };
        if let Some(observer) = removed.and_then(|weak| weak.upgrade()) {
            trace!(%id, "observer disconnected");
            observer.on_disconnect();
        }
    }

    pub(crate) fn set_thread_pool(&self, pool: Option<Arc<dyn ThreadPool>>, task: Option<TaskId>) {
        let mut inner = self.lock();
        inner.pool = pool;
        inner.task = task;
    }

    pub(crate) fn set_task(&self, task: TaskId) {
        self.lock().task = Some(task);
    }

    pub(crate) fn thread_pool(&self) -> Option<Arc<dyn ThreadPool>> {
        self.lock().pool.clone()
    }

    /// Lets the pool run our task on this thread instead of blocking on it.
    fn try_run_inline(&self) {
        let (pool, task) = {
            let inner = self.lock();
            (inner.pool.clone(), inner.task)
        };
        if let (Some(pool), Some(task)) = (pool, task) {
            if pool.try_run_inline(task) {
                trace!(?task, "ran pending task inline");
            }
        }
    }

    fn stored_exception(&self) -> Result<(), Error> {
        match self.lock().exception() {
            Some(e) => Err(Error::Exception(e.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn wait_for_finished(&self) -> Result<(), Error> {
        if !is_done(self.load()) {
            self.try_run_inline();
            let mut inner = self.lock();
            while !is_done(self.load()) {
                self.finished.wait(&mut inner);
            }
        }
        self.stored_exception()
    }

    /// Waits until `index` is ready, or, for `None`, until one more result
    /// than now is ready. Returns early once the future stops.
    pub(crate) fn wait_for_result(&self, index: Option<usize>) -> Result<bool, Error> {
        self.stored_exception()?;
        let target = {
            let inner = self.lock();
            index.unwrap_or_else(|| inner.result_count())
        };
        let ready = |inner: &Inner<T>| match index {
            Some(i) => inner.is_ready_at(i),
            None => inner.result_count() > target,
        };
        if !ready(&*self.lock()) && !is_done(self.load()) {
            self.try_run_inline();
        }
        let mut inner = self.lock();
        while !ready(&*inner) && !is_done(self.load()) {
            self.finished.wait(&mut inner);
        }
        if let Some(e) = inner.exception() {
            return Err(Error::Exception(e.clone()));
        }
        Ok(ready(&*inner))
    }

    pub(crate) fn result_count(&self) -> usize {
        self.lock().result_count()
    }

    pub(crate) fn is_result_ready_at(&self, index: usize) -> bool {
        self.lock().is_ready_at(index)
    }

    pub(crate) fn exception(&self) -> Option<Exception> {
        self.lock().exception().cloned()
    }

    /// Marks a producer that went away unfinished and winds the state down.
    pub(crate) fn abandon(&self) {
        if self.load().contains(State::FINISHED) {
            return;
        }
        debug!("producer dropped before finishing; canceling future");
        if !self.load().contains(State::CANCELED) {
            self.lock().producer_dropped = true;
        }
        self.cancel(CancelMode::CancelAndFinish);
    }

    /// Installs the continuation, or runs it now if we already finished.
    pub(crate) fn set_continuation(
        &self,
        continuation: Continuation<T>,
        target: Option<Weak<dyn ErasedState>>,
    ) {
        let (replaced, canceled_target) = {
            let mut inner = self.lock();
            let state = self.load();
            if state.contains(State::FINISHED) {
                drop(inner);
                self.run_continuation(Some(continuation));
                return;
            }
            let replaced = inner.continuation.replace(continuation);
            if replaced.is_some() {
                warn!("future already had a continuation; replacing it");
            }
            inner.continuation_target = target.clone();
            let canceled = state.contains(State::CANCELED) && inner.exception().is_none();
            (replaced, canceled.then_some(target).flatten())
        };
        drop(replaced);
        propagate_cancel(canceled_target);
    }

    fn run_continuation(&self, continuation: Option<Continuation<T>>) {
        let (Some(continuation), Some(this)) = (continuation, self.this.upgrade()) else {
            return;
        };
        trace!("running continuation");
        continuation(Consumer::from_shared(this));
    }

    /// Drops the typed payload once no typed handle is left.
    fn release_payload(&self) {
        let (released, continuation) = {
            let mut inner = self.lock();
            let released = match &mut inner.payload {
                Payload::Values(store) => store.take_all(),
                Payload::Exception(_) => Vec::new(),
            };
            (released, inner.continuation.take())
        };
        drop(continuation);
        drop(released);
    }
}

impl<T: Clone + Send + 'static> Shared<T> {
    pub(crate) fn result_at(&self, index: usize) -> Result<T, Error> {
        self.wait_for_result(Some(index))?;
        let inner = self.lock();
        let found = inner.store().and_then(|store| store.result_at(index)).cloned();
        found.ok_or_else(|| inner.missing(self.load(), index))
    }

    pub(crate) fn results(&self) -> Result<Vec<T>, Error> {
        self.wait_for_finished()?;
        self.collect_results()
    }

    fn collect_results(&self) -> Result<Vec<T>, Error> {
        let inner = self.lock();
        match &inner.payload {
            Payload::Exception(e) => Err(Error::Exception(e.clone())),
            Payload::Values(store) => Ok(store.iter().map(|(_, v)| v.clone()).collect()),
        }
    }

    /// Polls for completion, registering `waker` if still running.
    pub(crate) fn poll_outcome(&self, waker: &Waker) -> Option<Result<Vec<T>, Error>> {
        let mut inner = self.lock();
        let state = self.load();
        if !is_done(state) {
            if !inner.wakers.iter().any(|w| w.will_wake(waker)) {
                inner.wakers.push(waker.clone());
            }
            return None;
        }
        Some(match &inner.payload {
            Payload::Exception(e) => Err(Error::Exception(e.clone())),
            Payload::Values(store) if store.count() == 0 && state.contains(State::CANCELED) => {
                Err(inner.missing(state, 0))
            }
            Payload::Values(store) => Ok(store.iter().map(|(_, v)| v.clone()).collect()),
        })
    }
}

impl<T: Send + 'static> Shared<T> {
    /// Destructive read: waits, takes the first result and resets storage.
    pub(crate) fn take_result(&self) -> Result<T, Error> {
        self.wait_for_finished()?;
        let mut inner = self.lock();
        let state = self.load();
        let taken = match &mut inner.payload {
            Payload::Exception(e) => return Err(Error::Exception(e.clone())),
            Payload::Values(store) => store.take_all().into_iter().next(),
        };
        taken.ok_or_else(|| inner.missing(state, 0))
    }
}

impl<T: Send + 'static> ErasedState for Shared<T> {
    fn state(&self) -> State {
        self.load()
    }

    fn cancel(&self, mode: CancelMode) {
        Shared::cancel(self, mode)
    }

    fn set_suspended(&self, suspend: bool) {
        Shared::set_suspended(self, suspend)
    }

    fn mark_throttled(&self) {
        Shared::mark_throttled(self)
    }

    fn set_throttled(&self, enable: bool) {
        Shared::set_throttled(self, enable)
    }

    fn connect_observer(&self, observer: &Arc<dyn Observer>) -> ObserverId {
        Shared::connect_observer(self, observer)
    }

    fn disconnect_observer(&self, id: ObserverId) {
        Shared::disconnect_observer(self, id)
    }

    fn wait_for_finished(&self) -> Result<(), Error> {
        Shared::wait_for_finished(self)
    }

    fn result_count(&self) -> usize {
        Shared::result_count(self)
    }

    fn progress(&self) -> (i32, i32, i32, String) {
        self.progress_snapshot()
    }
}

/// A strong, typed handle. Counts toward `typed_refs`.
pub(crate) struct TypedRef<T: Send + 'static>(Arc<Shared<T>>);

impl<T: Send + 'static> TypedRef<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
        shared.typed_refs.fetch_add(1, Ordering::AcqRel);
        Self(shared)
    }

    pub(crate) fn arc(&self) -> &Arc<Shared<T>> {
        &self.0
    }
}

impl<T: Send + 'static> Clone for TypedRef<T> {
    fn clone(&self) -> Self {
        Self::new(self.0.clone())
    }
}

impl<T: Send + 'static> Drop for TypedRef<T> {
    fn drop(&mut self) {
        if self.0.typed_refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.release_payload();
        }
    }
}

impl<T: Send + 'static> std::ops::Deref for TypedRef<T> {
    type Target = Shared<T>;

    fn deref(&self) -> &Shared<T> {
        &self.0
    }
}

/// Type-erased handle to a future's state.
///
/// Keeps the state (flags, progress, observers) alive but not the typed
/// results: those are dropped when the last `Producer`/`Consumer` goes away.
#[derive(Clone)]
pub struct StateHandle(Arc<dyn ErasedState>);

impl StateHandle {
    pub fn state(&self) -> State {
        self.0.state()
    }

    pub fn is_finished(&self) -> bool {
        self.state().contains(State::FINISHED)
    }

    pub fn is_canceled(&self) -> bool {
        self.state().contains(State::CANCELED)
    }

    pub fn is_throttled(&self) -> bool {
        self.state().contains(State::THROTTLED)
    }

    pub fn cancel(&self) {
        self.0.cancel(CancelMode::CancelOnly)
    }

    pub fn cancel_with(&self, mode: CancelMode) {
        self.0.cancel(mode)
    }

    pub fn set_suspended(&self, suspend: bool) {
        self.0.set_suspended(suspend)
    }

    /// Sets `Throttled` without taking the state lock; safe to call from
    /// inside [`Observer::on_event`].
    pub fn mark_throttled(&self) {
        self.0.mark_throttled()
    }

    /// Sets or clears `Throttled`; clearing wakes throttled producers.
    ///
    /// Takes the state lock: never call from inside an observer call-out.
    pub fn set_throttled(&self, enable: bool) {
        self.0.set_throttled(enable)
    }

    /// Registers `observer` (held weakly) after replaying past events to it.
    pub fn connect_observer(&self, observer: &Arc<dyn Observer>) -> ObserverId {
        self.0.connect_observer(observer)
    }

    pub fn disconnect_observer(&self, id: ObserverId) {
        self.0.disconnect_observer(id)
    }

    pub fn wait_for_finished(&self) -> Result<(), Error> {
        self.0.wait_for_finished()
    }

    pub fn result_count(&self) -> usize {
        self.0.result_count()
    }

    /// `(minimum, maximum, value, text)`.
    pub fn progress(&self) -> (i32, i32, i32, String) {
        self.0.progress()
    }

    pub fn ptr_eq(&self, other: &StateHandle) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateHandle").field(&self.state()).finish()
    }
}
