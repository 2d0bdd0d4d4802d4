//! Tower middleware that admits requests through a [`Limiter`].
//!
//! ```
//! use quotagate::middleware::PermitLayer;
//! use quotagate::{source_fn, FetchError, Limiter};
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = Limiter::builder()
//!     .failsafe_quota(1.0)
//!     .quota_source(source_fn(|_key: String| async { Ok::<_, FetchError>(None) }))
//!     .build()
//!     .unwrap();
//!
//! let svc = PermitLayer::new(limiter, |req: &(String, u32)| req.0.clone())
//!     .layer(service_fn(|req: (String, u32)| async move { Ok::<_, std::io::Error>(req.1 * 2) }));
//!
//! let doubled = svc.oneshot(("tenant-a".to_string(), 21)).await.unwrap();
//! assert_eq!(doubled, 42);
//! # }
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{self, BoxFuture, FutureExt, TryFutureExt};
use tower_layer::Layer;
use tower_service::Service;

use crate::error::PermitError;
use crate::limiter::Limiter;

/// A layer that takes one permit per request, keyed by `extract_key`.
pub struct PermitLayer<K> {
    limiter: Limiter,
    extract_key: Arc<K>,
}

impl<K> PermitLayer<K> {
    /// Create a new permit layer.
    pub fn new(limiter: Limiter, extract_key: K) -> Self {
        Self { limiter, extract_key: Arc::new(extract_key) }
    }
}

impl<K> Clone for PermitLayer<K> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), extract_key: self.extract_key.clone() }
    }
}

impl<K> std::fmt::Debug for PermitLayer<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermitLayer").field("limiter", &self.limiter).finish()
    }
}

impl<S, K> Layer<S> for PermitLayer<K> {
    type Service = PermitService<S, K>;

    fn layer(&self, service: S) -> Self::Service {
        PermitService {
            inner: service,
            limiter: self.limiter.clone(),
            extract_key: self.extract_key.clone(),
        }
    }
}

/// Middleware service that rejects requests whose key has no permit left.
pub struct PermitService<S, K> {
    inner: S,
    limiter: Limiter,
    extract_key: Arc<K>,
}

impl<S: Clone, K> Clone for PermitService<S, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extract_key: self.extract_key.clone(),
        }
    }
}

impl<S: std::fmt::Debug, K> std::fmt::Debug for PermitService<S, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermitService")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl<S, K, Req> Service<Req> for PermitService<S, K>
where
    S: Service<Req>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    K: Fn(&Req) -> String + Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = PermitError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(PermitError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.extract_key)(&req);
        match self.limiter.acquire_permit(&key) {
            Ok(true) => self.inner.call(req).map_err(PermitError::Inner).boxed(),
            Ok(false) => {
                tracing::debug!(key = %key, "request rejected: no permit");
                future::ready(Err(PermitError::Denied { key })).boxed()
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "request rejected: limiter failure");
                future::ready(Err(PermitError::Acquire(e))).boxed()
            }
        }
    }
}
