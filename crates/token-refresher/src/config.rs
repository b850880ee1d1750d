//! Refresh policy configuration
//!
//! Deserialized from the `[refresh]` table of the service config. Every field
//! has a default so an empty table (or no table at all) is valid.

use serde::Deserialize;
use std::time::Duration;

/// Knobs for the background refresh schedule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshConfig {
    /// Share of a token's remaining lifetime to skip before refreshing (0-100).
    /// Higher values refresh earlier.
    #[serde(default = "default_refresh_percentage")]
    pub refresh_percentage: u8,
    /// Keep retrying after a failed background refresh. When false the
    /// refresh loop stops after the first failure and the last token is
    /// served until the process restarts.
    #[serde(default = "default_retry_on_failure")]
    pub retry_on_failure: bool,
    /// Delay before retrying a failed refresh.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

fn default_refresh_percentage() -> u8 {
    10
}

fn default_retry_on_failure() -> bool {
    true
}

fn default_retry_interval_secs() -> u64 {
    300
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            refresh_percentage: default_refresh_percentage(),
            retry_on_failure: default_retry_on_failure(),
            retry_interval_secs: default_retry_interval_secs(),
        }
    }
}

impl RefreshConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn validate(&self) -> common::Result<()> {
        if self.refresh_percentage > 100 {
            return Err(common::Error::Config(format!(
                "refresh_percentage must be between 0 and 100, got {}",
                self.refresh_percentage
            )));
        }
        if self.retry_interval_secs == 0 {
            return Err(common::Error::Config(
                "retry_interval_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
