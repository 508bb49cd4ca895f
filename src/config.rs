//! Tunables for progress rate limiting, watcher back-pressure and the
//! reference worker pool.
//!
//! None of these numbers are protocol guarantees. The mechanisms they drive
//! (dropping excess progress events except the first and last, raising
//! `Throttled` on a backlog of undelivered results) stay the same whatever
//! values are chosen.

use std::time::Duration;

/// Progress event rate limiting for a single future.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressConfig {
    /// Upper bound on emitted `Progress` events per second.
    ///
    /// `0` disables rate limiting.
    pub max_emits_per_second: u32,
}

impl ProgressConfig {
    pub const DEFAULT_MAX_EMITS_PER_SECOND: u32 = 25;

    pub fn with_max_emits_per_second(mut self, emits: u32) -> Self {
        self.max_emits_per_second = emits;
        self
    }

    /// Minimum spacing between two emitted progress events, if limited.
    pub fn min_interval(&self) -> Option<Duration> {
        match self.max_emits_per_second {
            0 => None,
            n => Some(Duration::from_millis(1000 / u64::from(n))),
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            max_emits_per_second: Self::DEFAULT_MAX_EMITS_PER_SECOND,
        }
    }
}

/// Back-pressure settings for a [`Watcher`](crate::Watcher).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Number of queued `ResultsReady` events after which the watched future
    /// is marked `Throttled`.
    pub max_pending_results: usize,
}

impl WatcherConfig {
    pub fn with_max_pending_results(mut self, limit: usize) -> Self {
        self.max_pending_results = limit.max(1);
        self
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_pending_results: (threads * 2).max(4),
        }
    }
}

/// Settings for the reference [`WorkerPool`](crate::WorkerPool).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker slots; also the number of spawned threads.
    pub threads: usize,
    /// Prefix for worker thread names.
    pub name_prefix: String,
}

impl PoolConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            threads,
            name_prefix: "promise-worker".to_owned(),
        }
    }
}
