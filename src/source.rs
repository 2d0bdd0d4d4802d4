//! Quota sources and fetch-error recorders.
//!
//! A [`QuotaSource`] is the only way quota values enter the limiter. Starting a fetch is
//! synchronous and may fail (that failure reaches the caller of `acquire_permit`); the fetch
//! itself is a future resolved on the limiter's runtime, yielding:
//! - `Ok(Some(q))`: the key's quota, in permits per quota window,
//! - `Ok(None)`: "unknown"; the last known value is kept,
//! - `Err(e)`: a failed fetch, handed to the [`FetchErrorRecorder`].

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::FetchError;

/// Future returned by a quota fetch.
pub type QuotaFuture = BoxFuture<'static, Result<Option<f64>, FetchError>>;

/// Terminal sink for failed fetches. Must not panic.
pub type FetchErrorRecorder = Arc<dyn Fn(&str, &FetchError) + Send + Sync>;

/// Fetches the current quota for a key.
pub trait QuotaSource: Send + Sync + 'static {
    /// Start fetching the quota for `key`.
    ///
    /// Returning `Err` means the fetch could not even be started; the limiter rolls back its
    /// in-flight bookkeeping and surfaces the error to the current caller.
    fn fetch(&self, key: &str) -> Result<QuotaFuture, FetchError>;
}

impl<F> QuotaSource for F
where
    F: Fn(&str) -> Result<QuotaFuture, FetchError> + Send + Sync + 'static,
{
    fn fetch(&self, key: &str) -> Result<QuotaFuture, FetchError> {
        self(key)
    }
}

/// Adapt an async function that can only fail asynchronously.
///
/// ```
/// use quotagate::source::{source_fn, QuotaSource};
/// use quotagate::FetchError;
///
/// let source = source_fn(|key: String| async move {
///     Ok::<_, FetchError>(if key.starts_with("premium-") { Some(100.0) } else { Some(10.0) })
/// });
/// assert!(source.fetch("premium-7").is_ok());
/// ```
pub fn source_fn<F, Fut>(f: F) -> impl QuotaSource
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<f64>, FetchError>> + Send + 'static,
{
    move |key: &str| -> Result<QuotaFuture, FetchError> { Ok(f(key.to_owned()).boxed()) }
}

/// Recorder used when none is configured: logs the failure at `warn`.
pub fn log_fetch_errors() -> FetchErrorRecorder {
    Arc::new(|key: &str, error: &FetchError| {
        tracing::warn!(target: "quotagate::source", key = %key, error = %error, "quota fetch failed");
    })
}
