//! Refresh telemetry sink
//!
//! Every refresh attempt is reported to a `RefreshObserver`. Observers are
//! best-effort: they cannot fail and the refresh loop never waits on them.
//!
//! `MetricsObserver` records through the `metrics` facade:
//!
//! - `token_refresh_total` (counter): label `is_success`
//! - `token_expiry_timestamp_seconds` (gauge): expiry of the held token

use std::time::{Duration, SystemTime};

use credential::CredentialError;

use crate::schedule::unix_seconds;

pub const TOKEN_REFRESH_TOTAL: &str = "token_refresh_total";
pub const TOKEN_EXPIRY_TIMESTAMP: &str = "token_expiry_timestamp_seconds";

/// Outcome of a single refresh attempt.
#[derive(Debug, Clone, Copy)]
pub struct RefreshReport<'a> {
    pub audience: &'a str,
    /// Error returned by the credential client, `None` on success
    pub error: Option<&'a CredentialError>,
    /// Expiry of the newly fetched token (success only)
    pub expires_on: Option<SystemTime>,
    /// Next scheduled attempt, `None` if the loop is stopping
    pub next_refresh: Option<SystemTime>,
    pub refresh_duration: Duration,
}

impl RefreshReport<'_> {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Receives a report for every refresh attempt, including the initial one.
pub trait RefreshObserver: Send + Sync {
    fn on_refresh(&self, report: &RefreshReport<'_>);
}

/// Observer that discards all reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RefreshObserver for NoopObserver {
    fn on_refresh(&self, _report: &RefreshReport<'_>) {}
}

/// Observer that records refresh counters and expiry gauges.
///
/// Without an installed recorder the calls are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl RefreshObserver for MetricsObserver {
    fn on_refresh(&self, report: &RefreshReport<'_>) {
        record_refresh(report.is_success());
        if let Some(expires_on) = report.expires_on {
            record_token_expiry(expires_on);
        }
    }
}

/// Record a refresh attempt with its outcome.
pub fn record_refresh(success: bool) {
    let label = if success { "true" } else { "false" };
    metrics::counter!(TOKEN_REFRESH_TOTAL, "is_success" => label).increment(1);
}

/// Record the expiry of the token currently held.
pub fn record_token_expiry(expires_on: SystemTime) {
    metrics::gauge!(TOKEN_EXPIRY_TIMESTAMP).set(unix_seconds(expires_on) as f64);
}
