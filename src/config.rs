//! Limiter settings and their conversion into the clock's tick domain.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::BuildError;
use crate::source::{FetchErrorRecorder, QuotaSource};

/// Default burst window.
pub const DEFAULT_BURST_WINDOW: Duration = Duration::from_secs(1);
/// Default quota window ("per second" quotas).
pub const DEFAULT_QUOTA_WINDOW: Duration = Duration::from_secs(1);
/// Default ceiling on how long an idle bucket is retained.
pub const DEFAULT_MAX_RETENTION: Duration = Duration::from_secs(60);
/// Default interval after which a key's quota is considered stale.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Plain-data limiter settings.
///
/// Everything except the failsafe quota has a default, so a settings bundle can be loaded from a
/// config file (with the `serde` feature) and handed to
/// [`LimiterBuilder::settings`](crate::LimiterBuilder::settings).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LimiterSettings {
    /// Length of one fair-distribution window.
    pub burst_window: Duration,
    /// Time unit quotas are denominated in.
    pub quota_window: Duration,
    /// Upper bound on how long an idle bucket is kept.
    pub max_retention: Duration,
    /// How long a fetched quota stays fresh.
    pub refresh_interval: Duration,
    /// Quota used until the first fetch completes.
    pub failsafe_quota: Option<f64>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            burst_window: DEFAULT_BURST_WINDOW,
            quota_window: DEFAULT_QUOTA_WINDOW,
            max_retention: DEFAULT_MAX_RETENTION,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            failsafe_quota: None,
        }
    }
}

impl LimiterSettings {
    /// Validate and convert to ticks of a clock whose tick lasts `tick`.
    pub(crate) fn to_ticks(&self, tick: Duration) -> Result<TickSettings, BuildError> {
        if tick.is_zero() {
            return Err(BuildError::ZeroTick);
        }
        let failsafe_quota =
            self.failsafe_quota.ok_or(BuildError::Missing { field: "failsafe_quota" })?;
        if !failsafe_quota.is_finite() {
            return Err(BuildError::InvalidFailsafeQuota(failsafe_quota));
        }
        if self.max_retention < self.burst_window {
            return Err(BuildError::RetentionBelowBurstWindow {
                max_retention: self.max_retention,
                burst_window: self.burst_window,
            });
        }

        Ok(TickSettings {
            burst_window_ticks: to_ticks("burst_window", self.burst_window, tick)?,
            quota_window_ticks: to_ticks("quota_window", self.quota_window, tick)?,
            max_retention_ticks: to_ticks("max_retention", self.max_retention, tick)?,
            refresh_interval_ticks: to_ticks("refresh_interval", self.refresh_interval, tick)?,
            failsafe_quota,
        })
    }
}

fn to_ticks(field: &'static str, value: Duration, tick: Duration) -> Result<u64, BuildError> {
    if value.is_zero() {
        return Err(BuildError::ZeroDuration { field, value });
    }
    let ticks = value.as_nanos() / tick.as_nanos();
    if ticks == 0 {
        return Err(BuildError::BelowTick { field, value, tick });
    }
    u64::try_from(ticks).map_err(|_| BuildError::TickOverflow { field, value })
}

/// Settings expressed in clock ticks; fixed for the limiter's lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TickSettings {
    pub(crate) burst_window_ticks: u64,
    pub(crate) quota_window_ticks: u64,
    pub(crate) max_retention_ticks: u64,
    pub(crate) refresh_interval_ticks: u64,
    pub(crate) failsafe_quota: f64,
}

/// Immutable collaborators shared by the cache, every bucket and every tracker.
pub(crate) struct Shared {
    pub(crate) settings: TickSettings,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) source: Arc<dyn QuotaSource>,
    pub(crate) recorder: FetchErrorRecorder,
    pub(crate) runtime: tokio::runtime::Handle,
}

impl Shared {
    pub(crate) fn now_ticks(&self) -> u64 {
        self.clock.now_ticks()
    }
}

#[cfg(test)]
impl Shared {
    /// Nanosecond-tick collaborators with default windows and a source that never resolves.
    pub(crate) fn for_tests(failsafe_quota: f64) -> Arc<Self> {
        use futures::FutureExt;

        let settings = LimiterSettings { failsafe_quota: Some(failsafe_quota), ..LimiterSettings::default() }
            .to_ticks(Duration::from_nanos(1))
            .expect("valid settings");
        Arc::new(Self {
            settings,
            clock: Arc::new(crate::clock::ManualClock::new()),
            source: Arc::new(|_key: &str| -> Result<crate::source::QuotaFuture, crate::error::FetchError> {
                Ok(futures::future::pending().boxed())
            }),
            recorder: crate::source::log_fetch_errors(),
            runtime: tokio::runtime::Handle::current(),
        })
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("settings", &self.settings)
            .field("clock", &self.clock)
            .field("source", &"<quota source>")
            .field("recorder", &"<recorder>")
            .finish()
    }
}
