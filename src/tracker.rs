//! Self-refreshing quota value for a single key.
//!
//! Reads are lock-free: the value lives in an atomic and staleness is a single comparison. Only the
//! decision to start a fetch and the application of its result take the tracker's lock, and the
//! fetch itself runs as a task on the limiter's runtime, so callers never wait on I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::bucket::WindowBucket;
use crate::config::Shared;
use crate::error::{AcquireError, FetchError};

/// `last_fetch_start_tick` before the first fetch.
const NEVER: u64 = u64::MAX;

pub(crate) struct QuotaTracker {
    key: Arc<str>,
    value: AtomicU64,
    last_fetch_start_tick: AtomicU64,
    fetch_in_progress: Mutex<bool>,
    owner: Weak<WindowBucket>,
    shared: Arc<Shared>,
}

impl QuotaTracker {
    /// Create a tracker holding `failsafe_quota`.
    ///
    /// No fetch is started here; the owning bucket calls [`QuotaTracker::start_initial_fetch`]
    /// once it is fully constructed so the completion can always reach it.
    pub(crate) fn new(
        key: Arc<str>,
        failsafe_quota: f64,
        owner: Weak<WindowBucket>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            key,
            value: AtomicU64::new(failsafe_quota.to_bits()),
            last_fetch_start_tick: AtomicU64::new(NEVER),
            fetch_in_progress: Mutex::new(false),
            owner,
            shared,
        }
    }

    pub(crate) fn start_initial_fetch(&self, now: u64) -> Result<(), AcquireError> {
        self.try_start_fetch(now)
    }

    /// Current quota, starting a background refresh first if the value is stale.
    ///
    /// Never waits for the refresh; the returned value is whatever was known on entry.
    pub(crate) fn get(&self, now: u64) -> Result<f64, AcquireError> {
        if self.is_stale(now) {
            self.try_start_fetch(now)?;
        }
        Ok(self.value())
    }

    pub(crate) fn value(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Acquire))
    }

    pub(crate) fn fetch_in_progress(&self) -> bool {
        *self.lock_state()
    }

    fn is_stale(&self, now: u64) -> bool {
        let last = self.last_fetch_start_tick.load(Ordering::Acquire);
        last == NEVER || now >= last.saturating_add(self.shared.settings.refresh_interval_ticks)
    }

    fn lock_state(&self) -> MutexGuard<'_, bool> {
        self.fetch_in_progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_start_fetch(&self, now: u64) -> Result<(), AcquireError> {
        {
            let mut in_progress = self.lock_state();
            if *in_progress || !self.is_stale(now) {
                // Another caller started or finished a refresh while this one waited.
                return Ok(());
            }
            self.last_fetch_start_tick.store(now, Ordering::Release);
            *in_progress = true;
        }

        // The source runs with no lock held; it may call back into the limiter.
        let fetch = match self.shared.source.fetch(&self.key) {
            Ok(fetch) => fetch,
            Err(source) => {
                *self.lock_state() = false;
                return Err(AcquireError::FetchInitiation { key: self.key.to_string(), source });
            }
        };

        tracing::trace!(key = %self.key, tick = now, "quota fetch started");
        let mut pending = PendingFetch {
            key: self.key.clone(),
            owner: self.owner.clone(),
            shared: self.shared.clone(),
            settled: false,
        };
        self.shared.runtime.spawn(async move {
            let outcome = fetch.await;
            pending.settle(outcome);
        });
        Ok(())
    }

    /// Apply a finished fetch. Runs on whichever runtime worker resolved it.
    fn on_fetch_complete(&self, bucket: &WindowBucket, outcome: Result<Option<f64>, FetchError>) {
        let applied = match &outcome {
            Ok(Some(quota)) if !quota.is_nan() => Some(*quota),
            _ => None,
        };
        {
            let mut in_progress = self.lock_state();
            *in_progress = false;
            if let Some(quota) = applied {
                self.value.store(quota.to_bits(), Ordering::Release);
            }
        }

        match (applied, outcome) {
            (Some(quota), _) => {
                tracing::debug!(key = %self.key, quota, "quota updated");
                bucket.quota_updated();
            }
            (None, Err(error)) => (self.shared.recorder)(&*self.key, &error),
            (None, Ok(_)) => {
                tracing::debug!(key = %self.key, "quota unknown; keeping last value");
            }
        }
    }

    fn abandon_fetch(&self) {
        *self.lock_state() = false;
    }
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("key", &self.key)
            .field("value", &self.value())
            .field("last_fetch_start_tick", &self.last_fetch_start_tick.load(Ordering::Relaxed))
            .finish()
    }
}

/// Completion side of a spawned fetch.
///
/// Holds only a weak reference to the bucket, so an evicted bucket is not kept alive by its
/// in-flight fetch and the late result is dropped. If the task is dropped before the fetch
/// resolves (runtime shutdown, a panicking fetch future) the in-flight flag is cleared so the key
/// can be fetched again.
struct PendingFetch {
    key: Arc<str>,
    owner: Weak<WindowBucket>,
    shared: Arc<Shared>,
    settled: bool,
}

impl PendingFetch {
    fn settle(&mut self, outcome: Result<Option<f64>, FetchError>) {
        self.settled = true;
        match self.owner.upgrade() {
            Some(bucket) => bucket.tracker().on_fetch_complete(&bucket, outcome),
            None => {
                if let Err(error) = &outcome {
                    (self.shared.recorder)(&*self.key, error);
                }
                tracing::debug!(key = %self.key, "bucket evicted before quota fetch completed; result discarded");
            }
        }
    }
}

impl Drop for PendingFetch {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(bucket) = self.owner.upgrade() {
            bucket.tracker().abandon_fetch();
        }
        tracing::warn!(key = %self.key, "quota fetch dropped before completing");
    }
}
