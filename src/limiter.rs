//! Public limiter facade and its builder.
//!
//! ```
//! use quotagate::{source_fn, FetchError, Limiter};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let limiter = Limiter::builder()
//!     .failsafe_quota(5.0)
//!     .burst_window(Duration::from_millis(100))
//!     .quota_source(source_fn(|_key: String| async { Ok::<_, FetchError>(Some(50.0)) }))
//!     .build()?;
//!
//! if limiter.acquire_permit("tenant-a")? {
//!     // admitted
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::bucket::BucketSnapshot;
use crate::cache::KeyedCache;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{LimiterSettings, Shared};
use crate::error::{AcquireError, BuildError, FetchError};
use crate::source::{log_fetch_errors, FetchErrorRecorder, QuotaSource};

/// Per-key admission control.
///
/// Cheap to clone; clones share buckets, the quota source and the clock.
#[derive(Clone)]
pub struct Limiter {
    cache: Arc<KeyedCache>,
    shared: Arc<Shared>,
}

impl Limiter {
    /// Start configuring a limiter.
    pub fn builder() -> LimiterBuilder {
        LimiterBuilder::new()
    }

    /// Try to take one permit for `key` right now.
    ///
    /// Never waits on the quota source. `Ok(false)` means the key's current burst window is
    /// exhausted; `Err` only when the source failed to start a fetch that this call triggered.
    pub fn acquire_permit(&self, key: &str) -> Result<bool, AcquireError> {
        let now = self.shared.now_ticks();
        let bucket = self.cache.get_or_create(key, now)?;
        let granted = bucket.acquire_permit(now)?;
        if !granted {
            tracing::trace!(key, "permit denied");
        }
        Ok(granted)
    }

    /// Evict every bucket that has been idle longer than its retention.
    pub fn sweep(&self) -> usize {
        self.cache.sweep(self.shared.now_ticks())
    }

    /// Number of keys currently holding a bucket, expired-but-unswept ones included.
    pub fn tracked_keys(&self) -> usize {
        self.cache.len()
    }

    /// Inspect `key`'s bucket without counting as an access.
    pub fn snapshot(&self, key: &str) -> Option<BucketSnapshot> {
        self.cache.peek(key).map(|bucket| bucket.snapshot())
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("settings", &self.shared.settings)
            .field("tracked_keys", &self.tracked_keys())
            .finish()
    }
}

/// Builder for [`Limiter`].
///
/// `failsafe_quota` and `quota_source` are required; everything else has a default.
pub struct LimiterBuilder {
    settings: LimiterSettings,
    clock: Arc<dyn Clock>,
    source: Option<Arc<dyn QuotaSource>>,
    recorder: FetchErrorRecorder,
    runtime: Option<Handle>,
    sweep_interval: Option<Duration>,
}

impl LimiterBuilder {
    /// Create a builder with default settings, a monotonic clock and a logging error recorder.
    pub fn new() -> Self {
        Self {
            settings: LimiterSettings::default(),
            clock: Arc::new(MonotonicClock::default()),
            source: None,
            recorder: log_fetch_errors(),
            runtime: None,
            sweep_interval: None,
        }
    }

    /// Replace all plain settings at once, e.g. with values loaded from configuration.
    pub fn settings(mut self, settings: LimiterSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Length of one fair-distribution window.
    pub fn burst_window(mut self, window: Duration) -> Self {
        self.settings.burst_window = window;
        self
    }

    /// Time unit quotas are expressed in.
    pub fn quota_window(mut self, window: Duration) -> Self {
        self.settings.quota_window = window;
        self
    }

    /// Ceiling on how long an idle bucket is kept.
    pub fn max_retention(mut self, retention: Duration) -> Self {
        self.settings.max_retention = retention;
        self
    }

    /// How long a fetched quota stays fresh before the next rollover refetches it.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.settings.refresh_interval = interval;
        self
    }

    /// Quota used for a key until its first fetch yields a value. Required.
    pub fn failsafe_quota(mut self, quota: f64) -> Self {
        self.settings.failsafe_quota = Some(quota);
        self
    }

    /// Provide a custom clock implementation.
    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Where quotas come from. Required.
    pub fn quota_source<S>(mut self, source: S) -> Self
    where
        S: QuotaSource,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Sink for failed fetches. Defaults to a `warn` log line.
    pub fn fetch_error_recorder<F>(mut self, recorder: F) -> Self
    where
        F: Fn(&str, &FetchError) + Send + Sync + 'static,
    {
        self.recorder = Arc::new(recorder);
        self
    }

    /// Runtime that drives quota fetches. Defaults to the runtime current at `build()`.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Also evict idle buckets in the background every `interval`.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Build the limiter, validating inputs.
    pub fn build(self) -> Result<Limiter, BuildError> {
        let source = self.source.ok_or(BuildError::Missing { field: "quota_source" })?;
        let settings = self.settings.to_ticks(self.clock.tick_duration())?;
        if let Some(interval) = self.sweep_interval {
            if interval.is_zero() {
                return Err(BuildError::ZeroDuration { field: "sweep_interval", value: interval });
            }
        }
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| BuildError::NoRuntime)?,
        };

        let shared = Arc::new(Shared {
            settings,
            clock: self.clock,
            source,
            recorder: self.recorder,
            runtime,
        });
        let cache = KeyedCache::new(shared.clone());
        if let Some(interval) = self.sweep_interval {
            cache.spawn_sweeper(interval);
        }
        tracing::debug!(?settings, sweep_interval = ?self.sweep_interval, "limiter built");
        Ok(Limiter { cache, shared })
    }
}

impl Default for LimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LimiterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterBuilder")
            .field("settings", &self.settings)
            .field("clock", &self.clock)
            .field("has_source", &self.source.is_some())
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::source::{source_fn, QuotaFuture};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SECOND: u64 = 1_000_000_000;

    fn pending_source() -> impl QuotaSource {
        |_key: &str| -> Result<QuotaFuture, FetchError> {
            Ok(futures::future::pending::<Result<Option<f64>, FetchError>>().boxed())
        }
    }

    #[tokio::test]
    async fn failsafe_quota_governs_until_first_fetch() {
        let clock = ManualClock::new();
        let limiter = Limiter::builder()
            .clock(clock.clone())
            .failsafe_quota(2.0)
            .quota_source(pending_source())
            .build()
            .expect("valid limiter");

        assert!(limiter.acquire_permit("a").unwrap());
        assert!(limiter.acquire_permit("a").unwrap());
        assert!(!limiter.acquire_permit("a").unwrap());

        clock.advance(SECOND);
        assert!(limiter.acquire_permit("a").unwrap());
        let snap = limiter.snapshot("a").expect("tracked");
        assert_eq!(snap.window_index, 1);
        assert_eq!(snap.quota, 2.0);
        assert!(snap.fetch_in_progress);
    }

    #[tokio::test]
    async fn snapshot_does_not_touch() {
        let clock = ManualClock::new();
        let limiter = Limiter::builder()
            .clock(clock.clone())
            .failsafe_quota(1.0)
            .quota_source(pending_source())
            .build()
            .unwrap();

        limiter.acquire_permit("a").unwrap();
        clock.advance(SECOND / 2);
        let snap = limiter.snapshot("a").unwrap();
        assert_eq!(snap.last_access_tick, 0);
        assert!(limiter.snapshot("missing").is_none());
    }

    #[tokio::test]
    async fn one_fetch_per_new_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let limiter = Limiter::builder()
            .clock(ManualClock::new())
            .failsafe_quota(1.0)
            .quota_source(source_fn(move |_key| {
                counted.fetch_add(1, Ordering::SeqCst);
                futures::future::pending::<Result<Option<f64>, FetchError>>()
            }))
            .build()
            .unwrap();

        for _ in 0..5 {
            let _ = limiter.acquire_permit("a").unwrap();
            let _ = limiter.acquire_permit("b").unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[tokio::test]
    async fn build_validates_options() {
        let err = Limiter::builder().failsafe_quota(1.0).build().unwrap_err();
        assert_eq!(err, BuildError::Missing { field: "quota_source" });

        let err = Limiter::builder().quota_source(pending_source()).build().unwrap_err();
        assert_eq!(err, BuildError::Missing { field: "failsafe_quota" });

        let err = Limiter::builder()
            .failsafe_quota(1.0)
            .quota_source(pending_source())
            .sweep_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::ZeroDuration { field: "sweep_interval", .. }));
    }

    #[test]
    fn build_outside_runtime_needs_a_handle() {
        let err = Limiter::builder()
            .failsafe_quota(1.0)
            .quota_source(pending_source())
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::NoRuntime);

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let limiter = Limiter::builder()
            .failsafe_quota(1.0)
            .quota_source(pending_source())
            .runtime(rt.handle().clone())
            .build()
            .expect("explicit runtime");
        assert!(limiter.acquire_permit("k").unwrap());
    }
}
