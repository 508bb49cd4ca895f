//! Discrete notifications describing every state transition of a future.
//!
//! ```text
//!   Producer ── report_*() ──► Shared (under lock) ──► Observer::on_event(&Event)
//!                                                          │
//!                                   ┌──────────────────────┴──────────────┐
//!                                   ▼                                     ▼
//!                              Watcher                             CallbackObserver
//!                     (queued, serialized, throttling)          (inline, no queue)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::shared::StateHandle;

/// One state transition, as seen by observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Started,
    Finished,
    Canceled,
    Suspending,
    Suspended,
    Resumed,
    ProgressRange { minimum: i32, maximum: i32 },
    Progress { value: i32, text: String },
    /// Results `[begin, end)` can now be read.
    ResultsReady { begin: usize, end: usize },
}

/// Identifies one registration of an observer on one future.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ObserverId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// Receives the replayed-then-live event stream of a future.
///
/// Call-outs are made while the future's state lock is held. Implementations
/// must not call back into the future, except through
/// [`StateHandle::mark_throttled`], which is lock-free.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &Event);

    /// Called once after the observer has been removed from the future.
    fn on_disconnect(&self) {}
}

type Callback = Box<dyn Fn(&Event) + Send + Sync>;

/// The simplest observer: runs a callback inline for every event, on
/// whichever thread produced it.
pub struct CallbackObserver {
    callback: Callback,
}

impl CallbackObserver {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl fmt::Debug for CallbackObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackObserver").finish_non_exhaustive()
    }
}

impl Observer for CallbackObserver {
    fn on_event(&self, event: &Event) {
        (self.callback)(event)
    }
}

/// Keeps an observer attached (and alive) for as long as the guard lives.
pub struct Connection {
    state: StateHandle,
    id: ObserverId,
    _observer: Arc<dyn Observer>,
}

impl Connection {
    pub(crate) fn new(state: StateHandle, observer: Arc<dyn Observer>) -> Self {
        let id = state.connect_observer(&observer);
        Self {
            state,
            id,
            _observer: observer,
        }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.state.disconnect_observer(self.id);
    }
}
