//! Per-key permit bucket over fixed burst windows.
//!
//! Time from the bucket's origin is cut into consecutive burst windows. When a request arrives past
//! the end of the current window the bucket rolls to the window containing `now` and refills the
//! permit count from the current quota. Within a window, permits are taken with one atomic
//! decrement, so the hot path never locks.
//!
//! The counter may go negative under contention; a request is granted only if its own decrement
//! left the count at zero or above, so concurrent callers can never take more permits than the
//! window was given.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::allotment;
use crate::cache::KeyedCache;
use crate::config::Shared;
use crate::error::AcquireError;
use crate::tracker::QuotaTracker;

/// Index and allotment of the window the bucket last rolled into.
#[derive(Debug, Clone, Copy)]
struct Window {
    index: u64,
    permits: i64,
}

pub(crate) struct WindowBucket {
    key: Arc<str>,
    origin_tick: u64,
    tracker: QuotaTracker,
    available_permits: AtomicI64,
    window_end_tick: AtomicU64,
    retention_ticks: AtomicU64,
    last_access_tick: AtomicU64,
    window: Mutex<Window>,
    shared: Arc<Shared>,
    cache: Weak<KeyedCache>,
}

impl WindowBucket {
    /// Create the bucket for `key` with its origin at `now`.
    ///
    /// The first window is allotted from the failsafe quota. No fetch is started; the cache calls
    /// [`WindowBucket::start`] once the bucket is published and no map lock is held.
    pub(crate) fn new(key: &str, now: u64, shared: Arc<Shared>, cache: Weak<KeyedCache>) -> Arc<Self> {
        let key: Arc<str> = Arc::from(key);
        let settings = shared.settings;
        let quota = settings.failsafe_quota;
        let permits = allotment::permits_for_window(quota, 0, &settings);

        let bucket = Arc::new_cyclic(|owner| WindowBucket {
            key: key.clone(),
            origin_tick: now,
            tracker: QuotaTracker::new(key.clone(), quota, owner.clone(), shared.clone()),
            available_permits: AtomicI64::new(permits),
            window_end_tick: AtomicU64::new(now.saturating_add(settings.burst_window_ticks)),
            retention_ticks: AtomicU64::new(allotment::retention_ticks(quota, &settings)),
            last_access_tick: AtomicU64::new(now),
            window: Mutex::new(Window { index: 0, permits }),
            shared,
            cache,
        });
        tracing::debug!(key = %bucket.key, origin = now, permits, "bucket created");
        bucket
    }

    /// Start the first quota fetch.
    pub(crate) fn start(&self, now: u64) -> Result<(), AcquireError> {
        self.tracker.start_initial_fetch(now)
    }

    /// Try to take one permit from the window containing `now`.
    pub(crate) fn acquire_permit(&self, now: u64) -> Result<bool, AcquireError> {
        if now >= self.window_end_tick.load(Ordering::Acquire) {
            // Refresh before taking the window lock: the source runs with no bucket lock held.
            self.tracker.get(now)?;
            self.roll_window(now);
        }
        Ok(self.available_permits.fetch_sub(1, Ordering::AcqRel) > 0)
    }

    fn roll_window(&self, now: u64) {
        let mut window = self.lock_window();
        if now < self.window_end_tick.load(Ordering::Acquire) {
            return;
        }

        let quota = self.tracker.value();
        let settings = &self.shared.settings;
        let index = now.saturating_sub(self.origin_tick) / settings.burst_window_ticks;
        let permits = allotment::permits_for_window(quota, index, settings);
        // Permits first: a caller that observes the new end must also observe the refill.
        self.available_permits.store(permits, Ordering::Release);
        *window = Window { index, permits };
        let end = self
            .origin_tick
            .saturating_add(index.saturating_add(1).saturating_mul(settings.burst_window_ticks));
        self.window_end_tick.store(end, Ordering::Release);

        tracing::trace!(key = %self.key, index, permits, quota, "window rolled");
    }

    /// Bring the current window and retention in line with the tracker's quota.
    ///
    /// Only the difference between the new and old allotment of the current window is added, so
    /// permits already taken in this window stay taken. The quota is read under the window lock,
    /// so notifications that arrive out of order still leave the window at the latest value.
    pub(crate) fn quota_updated(&self) {
        let settings = &self.shared.settings;
        let (quota, index, delta, retention) = {
            let mut window = self.lock_window();
            let quota = self.tracker.value();
            let retention = allotment::retention_ticks(quota, settings);
            self.retention_ticks.store(retention, Ordering::Release);
            let permits = allotment::permits_for_window(quota, window.index, settings);
            let delta = permits.saturating_sub(window.permits);
            if delta != 0 {
                let _ = self.available_permits.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |available| Some(available.saturating_add(delta)),
                );
            }
            window.permits = permits;
            (quota, window.index, delta, retention)
        };
        tracing::debug!(key = %self.key, quota, index, delta, retention_ticks = retention, "quota applied");

        if let Some(cache) = self.cache.upgrade() {
            cache.force_refresh_expiry(&self.key, self.shared.now_ticks());
        }
    }

    /// Record an access at `now` unless the bucket has already expired.
    ///
    /// The check and the update are one atomic step, so an expired bucket is never revived.
    /// Never moves the access time backwards.
    pub(crate) fn touch_if_live(&self, now: u64) -> bool {
        let retention = self.retention_ticks.load(Ordering::Acquire);
        self.last_access_tick
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                (now.saturating_sub(last) <= retention).then_some(last.max(now))
            })
            .is_ok()
    }

    /// Idle for strictly longer than the current retention.
    pub(crate) fn is_expired(&self, now: u64) -> bool {
        let idle = now.saturating_sub(self.last_access_tick.load(Ordering::Acquire));
        idle > self.retention_ticks.load(Ordering::Acquire)
    }

    pub(crate) fn tracker(&self) -> &QuotaTracker {
        &self.tracker
    }

    pub(crate) fn snapshot(&self) -> BucketSnapshot {
        let window = *self.lock_window();
        BucketSnapshot {
            quota: self.tracker.value(),
            fetch_in_progress: self.tracker.fetch_in_progress(),
            origin_tick: self.origin_tick,
            window_index: window.index,
            window_permits: window.permits,
            available_permits: self.available_permits.load(Ordering::Acquire),
            window_end_tick: self.window_end_tick.load(Ordering::Acquire),
            retention_ticks: self.retention_ticks.load(Ordering::Acquire),
            last_access_tick: self.last_access_tick.load(Ordering::Acquire),
        }
    }

    fn lock_window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for WindowBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowBucket")
            .field("key", &self.key)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Point-in-time view of one key's bucket, for diagnostics and tests.
///
/// Fields are read individually, so a snapshot taken under concurrent traffic may mix values from
/// adjacent instants.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub struct BucketSnapshot {
    /// Current quota (failsafe until the first fetch applies).
    pub quota: f64,
    /// A fetch for this key is outstanding.
    pub fetch_in_progress: bool,
    /// Tick the bucket was created at; window 0 starts here.
    pub origin_tick: u64,
    /// Window the bucket last rolled into.
    pub window_index: u64,
    /// Permits allotted to that window, including mid-window quota adjustments.
    pub window_permits: i64,
    /// Permits left; negative after contended denials.
    pub available_permits: i64,
    /// First tick past the current window.
    pub window_end_tick: u64,
    /// Idle ticks after which the bucket may be evicted.
    pub retention_ticks: u64,
    /// Tick of the last access or quota update.
    pub last_access_tick: u64,
}
