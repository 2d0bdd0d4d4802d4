#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotagate
//!
//! Per-key admission control with fair burst windows and asynchronously refreshed quotas.
//!
//! Every key (a tenant, an API token, a client address) gets a quota in permits per quota window,
//! fetched from a [`QuotaSource`] in the background. Time is cut into short burst windows and the
//! quota is spread across them so fractional quotas are honoured exactly over time. Deciding a
//! request never waits on the source: until a key's first fetch completes, a failsafe quota
//! applies.
//!
//! ## Features
//!
//! - **Non-blocking decisions**: one atomic decrement on the hot path
//! - **Fair distribution** of fractional quotas with no rounding drift
//! - **Single-flight refresh** per key, with mid-window quota changes applied as a delta
//! - **Idle eviction** that scales with each key's quota
//! - **Tower middleware** via [`middleware::PermitLayer`]
//!
//! ## Quick Start
//!
//! ```rust
//! use quotagate::{source_fn, FetchError, Limiter};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = Limiter::builder()
//!         .failsafe_quota(10.0)
//!         .refresh_interval(Duration::from_secs(30))
//!         .quota_source(source_fn(|tenant: String| async move {
//!             // Look the tenant's plan up here.
//!             Ok::<_, FetchError>(Some(if tenant == "enterprise" { 1000.0 } else { 10.0 }))
//!         }))
//!         .build()
//!         .expect("valid limiter");
//!
//!     match limiter.acquire_permit("enterprise") {
//!         Ok(true) => { /* serve */ }
//!         Ok(false) => { /* reject: over quota */ }
//!         Err(e) => eprintln!("limiter unavailable: {e}"),
//!     }
//! }
//! ```

mod allotment;
mod bucket;
mod cache;
pub mod clock;
pub mod config;
pub mod error;
mod limiter;
pub mod middleware;
pub mod prelude;
pub mod source;
mod tracker;

// Re-exports
pub use bucket::BucketSnapshot;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::LimiterSettings;
pub use error::{AcquireError, BuildError, FetchError, PermitError};
pub use limiter::{Limiter, LimiterBuilder};
pub use source::{source_fn, FetchErrorRecorder, QuotaFuture, QuotaSource};
