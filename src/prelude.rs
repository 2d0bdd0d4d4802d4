//! Convenient re-exports for common quotagate types.
pub use crate::{
    clock::{Clock, ManualClock, MonotonicClock},
    config::LimiterSettings,
    error::{AcquireError, BuildError, FetchError, PermitError},
    middleware::{PermitLayer, PermitService},
    source::{source_fn, FetchErrorRecorder, QuotaFuture, QuotaSource},
    BucketSnapshot, Limiter, LimiterBuilder,
};
