//! Error types for limiter construction and permit acquisition.
use std::time::Duration;

/// Error produced by a quota source, either while starting a fetch or from the fetch itself.
pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

/// Configuration faults reported by [`LimiterBuilder::build`](crate::LimiterBuilder::build).
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum BuildError {
    /// A required option was never set.
    #[error("missing required option `{field}`")]
    Missing {
        /// Builder option name.
        field: &'static str,
    },
    /// A duration option must be non-zero.
    #[error("`{field}` must be > 0 (got {value:?})")]
    ZeroDuration {
        /// Builder option name.
        field: &'static str,
        /// Value provided by caller.
        value: Duration,
    },
    /// A duration is shorter than one tick of the configured clock.
    #[error("`{field}` ({value:?}) is shorter than one clock tick ({tick:?})")]
    BelowTick {
        /// Builder option name.
        field: &'static str,
        /// Value provided by caller.
        value: Duration,
        /// Tick length reported by the clock.
        tick: Duration,
    },
    /// A duration does not fit in the 64-bit tick domain.
    #[error("`{field}` ({value:?}) overflows the tick domain")]
    TickOverflow {
        /// Builder option name.
        field: &'static str,
        /// Value provided by caller.
        value: Duration,
    },
    /// The clock reported a zero tick length.
    #[error("clock tick duration must be > 0")]
    ZeroTick,
    /// Retention ceiling must cover at least one burst window.
    #[error("max_retention ({max_retention:?}) must be >= burst_window ({burst_window:?})")]
    RetentionBelowBurstWindow {
        /// Configured retention ceiling.
        max_retention: Duration,
        /// Configured burst window.
        burst_window: Duration,
    },
    /// Failsafe quota must be a finite number.
    #[error("failsafe_quota must be finite (got {0})")]
    InvalidFailsafeQuota(f64),
    /// No runtime handle was given and none was current at build time.
    #[error("no tokio runtime available to run quota fetches; call `runtime()` or build inside a runtime")]
    NoRuntime,
}

/// Failures surfaced by [`Limiter::acquire_permit`](crate::Limiter::acquire_permit).
///
/// Steady-state fetch problems (unknown values, failed fetches) never show up here; they are
/// absorbed by the tracker and reported to the fetch-error recorder instead.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum AcquireError {
    /// The quota source refused to start a fetch.
    #[error("failed to start quota fetch for '{key}': {source}")]
    FetchInitiation {
        /// Key whose quota was being fetched.
        key: String,
        /// Error returned by the quota source.
        #[source]
        source: FetchError,
    },
}

impl AcquireError {
    /// Key involved in the failure.
    pub fn key(&self) -> &str {
        match self {
            Self::FetchInitiation { key, .. } => key,
        }
    }
}

/// Errors returned by [`PermitService`](crate::middleware::PermitService).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum PermitError<E> {
    /// No permit was available for the request's key.
    #[error("permit denied for key '{key}'")]
    Denied {
        /// Key extracted from the request.
        key: String,
    },
    /// The limiter could not evaluate the request.
    #[error(transparent)]
    Acquire(AcquireError),
    /// The wrapped service failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> PermitError<E> {
    /// Check if the request was rejected for lack of permits.
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }

    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
