//! Fair distribution of a fractional quota over fixed-length burst windows.
//!
//! A quota of `q` permits per quota window is first rescaled to `p` permits per burst window, then
//! spread with a cumulative difference: window number `n` receives `floor(p * n) - floor(p * (n - 1))`
//! permits. Summed over consecutive windows this telescopes to
//! `floor(p * n_last) - floor(p * (n_first - 1))`, so no permit is lost or duplicated to rounding
//! even when most windows get zero permits.
//!
//! Window numbers start at `ceil(avg_ticks_per_permit / burst_window_ticks)`, the first number whose
//! cumulative count reaches one permit, so the first window a new bucket serves always has a
//! non-zero allotment, even for quotas below one permit per window.

use crate::config::TickSettings;

/// Average ticks between permits, `ceil(quota_window_ticks / quota)`.
///
/// `None` when the quota grants nothing (zero, negative, or NaN).
pub(crate) fn avg_ticks_per_permit(quota: f64, quota_window_ticks: u64) -> Option<u64> {
    if quota.is_nan() || quota <= 0.0 {
        return None;
    }
    // Float-to-int `as` saturates, which is what tiny quotas need.
    Some((quota_window_ticks as f64 / quota).ceil() as u64)
}

/// Window number of the first window a bucket serves.
pub(crate) fn first_window_number(avg_ticks_per_permit: u64, burst_window_ticks: u64) -> u64 {
    // ceil(avg / burst); avg is at least 1 for any granting quota.
    1 + avg_ticks_per_permit.saturating_sub(1) / burst_window_ticks
}

/// Permits allotted to the window at `index` (counted from the bucket's origin).
pub(crate) fn permits_for_window(quota: f64, index: u64, settings: &TickSettings) -> i64 {
    let Some(avg) = avg_ticks_per_permit(quota, settings.quota_window_ticks) else {
        return 0;
    };
    let per_window =
        quota * (settings.burst_window_ticks as f64 / settings.quota_window_ticks as f64);
    if per_window >= i64::MAX as f64 {
        return i64::MAX;
    }
    let number = first_window_number(avg, settings.burst_window_ticks).saturating_add(index);
    let cumulative = |n: u64| (per_window * n as f64).floor();
    (cumulative(number) - cumulative(number - 1)) as i64
}

/// Idle ticks a bucket with this quota may be retained.
///
/// Always within `[burst_window_ticks, max_retention_ticks]`; exactly the ceiling when the quota
/// grants nothing.
pub(crate) fn retention_ticks(quota: f64, settings: &TickSettings) -> u64 {
    match avg_ticks_per_permit(quota, settings.quota_window_ticks) {
        Some(avg) => avg.clamp(settings.burst_window_ticks, settings.max_retention_ticks),
        None => settings.max_retention_ticks,
    }
}
