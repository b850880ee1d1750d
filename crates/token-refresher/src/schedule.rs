//! Refresh time calculation
//!
//! Decides when the next refresh should happen from a token's absolute expiry
//! and the configured refresh percentage. Pure functions: `now` is always
//! passed in so the arithmetic can be tested without a clock.

use std::time::{Duration, SystemTime};

/// Retry delay used when the computed refresh point is unusable.
pub const FAST_RETRY: Duration = Duration::from_secs(60);

/// Tokens expiring within this window are treated as already expired.
pub const EXPIRY_SKEW: Duration = Duration::from_secs(10);

/// Absolute time at which a token expiring at `expires_at` should be refreshed.
///
/// `percentage` is the share of the remaining lifetime to skip: the refresh
/// lands at `now + remaining * (100 - percentage) / 100`, so 10 refreshes at
/// 90% of the remaining lifetime and 80 refreshes after the first 20%. Values
/// above 100 are clamped.
///
/// Falls back to `now + FAST_RETRY` when the token is expired or expires
/// within `EXPIRY_SKEW`, or when the candidate is not strictly between `now`
/// and `expires_at` (percentage 0 lands exactly on the expiry, percentage 100
/// lands on `now`). Percentage 100 therefore waits `FAST_RETRY` instead of
/// refreshing immediately, so the result is always strictly after `now`.
pub fn next_refresh(now: SystemTime, expires_at: SystemTime, percentage: u8) -> SystemTime {
    let fallback = now + FAST_RETRY;

    let remaining = match expires_at.duration_since(now) {
        Ok(remaining) if remaining > EXPIRY_SKEW => remaining,
        _ => return fallback,
    };

    let keep = u32::from(100 - percentage.min(100));
    let Some(offset) = remaining.checked_mul(keep).map(|d| d / 100) else {
        return fallback;
    };

    let candidate = now + offset;
    if candidate > now && candidate < expires_at {
        candidate
    } else {
        fallback
    }
}

/// Delay from `now` until `next_refresh(now, expires_at, percentage)`.
///
/// Always positive: the fallback branch is one minute out and the normal
/// branch is strictly after `now`.
pub fn refresh_delay(now: SystemTime, expires_at: SystemTime, percentage: u8) -> Duration {
    next_refresh(now, expires_at, percentage)
        .duration_since(now)
        .unwrap_or(FAST_RETRY)
}

/// Seconds since the Unix epoch, saturating to 0 for pre-epoch times.
pub fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
