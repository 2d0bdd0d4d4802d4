//! Clock abstractions that define the tick domain all window math is expressed in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic tick source so timing can be faked in tests.
///
/// Ticks must never decrease. [`Clock::tick_duration`] tells the limiter how much wall-clock time
/// one tick represents; it is read once when the limiter is built.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current tick.
    fn now_ticks(&self) -> u64;

    /// Wall-clock length of a single tick.
    fn tick_duration(&self) -> Duration;
}

/// Monotonic clock backed by `Instant::now()` with nanosecond ticks.
///
/// Notes: resets when the process restarts, so ticks are only comparable within one process.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_ticks(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn tick_duration(&self) -> Duration {
        Duration::from_nanos(1)
    }
}

/// Clock that only moves when told to.
///
/// Clones share the same counter, so a test can keep one handle and give another to the limiter.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
    tick: Duration,
}

impl ManualClock {
    /// Start at tick 0 with 1 tick = 1 ns.
    pub fn new() -> Self {
        Self::with_tick_duration(Duration::from_nanos(1))
    }

    /// Start at tick 0 with a custom tick length.
    pub fn with_tick_duration(tick: Duration) -> Self {
        Self { now: Arc::new(AtomicU64::new(0)), tick }
    }

    /// Move forward by `ticks`.
    pub fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }

    /// Jump to an absolute tick. Moving backwards is ignored.
    pub fn set(&self, tick: u64) {
        self.now.fetch_max(tick, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ticks(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn tick_duration(&self) -> Duration {
        self.tick
    }
}
