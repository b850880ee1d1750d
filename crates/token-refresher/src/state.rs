//! Published token snapshots
//!
//! A `TokenState` is immutable once built. The refresh loop publishes a new
//! `Arc<TokenState>` after every attempt, so a reader always sees a token and
//! an error that belong to the same refresh cycle.

use common::Secret;
use credential::{AccessToken, CredentialError};
use std::time::{Duration, SystemTime};

/// Snapshot of the provider's token after the most recent refresh attempt.
///
/// `token` is the last successfully fetched value and survives failed
/// attempts. `last_error` is set exactly when the most recent attempt failed.
#[derive(Debug, Clone)]
pub struct TokenState {
    token: Secret<String>,
    expires_on: SystemTime,
    last_error: Option<CredentialError>,
    refresh_duration: Duration,
    next_refresh: Option<SystemTime>,
    updated_at: SystemTime,
}

impl TokenState {
    /// Snapshot for a successful fetch at `now`.
    pub(crate) fn fetched(token: AccessToken, now: SystemTime, refresh_duration: Duration) -> Self {
        Self {
            token: token.token,
            expires_on: token.expires_on,
            last_error: None,
            refresh_duration,
            next_refresh: Some(now + refresh_duration),
            updated_at: now,
        }
    }

    /// Snapshot for a failed fetch at `now`, keeping the previous token.
    ///
    /// `next_refresh` is `None` when no further attempt is scheduled.
    pub(crate) fn failed(
        &self,
        error: CredentialError,
        now: SystemTime,
        refresh_duration: Duration,
        retrying: bool,
    ) -> Self {
        Self {
            token: self.token.clone(),
            expires_on: self.expires_on,
            last_error: Some(error),
            refresh_duration,
            next_refresh: retrying.then(|| now + refresh_duration),
            updated_at: now,
        }
    }

    /// The most recently fetched bearer token.
    pub fn token(&self) -> &str {
        self.token.expose()
    }

    /// Error from the most recent attempt, if it failed.
    pub fn last_error(&self) -> Option<&CredentialError> {
        self.last_error.as_ref()
    }

    pub fn expires_on(&self) -> SystemTime {
        self.expires_on
    }

    /// Delay that was scheduled after the most recent attempt.
    pub fn refresh_duration(&self) -> Duration {
        self.refresh_duration
    }

    /// When the next background attempt will run, or `None` once the loop
    /// has stopped.
    pub fn next_refresh(&self) -> Option<SystemTime> {
        self.next_refresh
    }

    /// When this snapshot was published.
    pub fn updated_at(&self) -> SystemTime {
        self.updated_at
    }

    /// Whether the held token is past its expiry at `now`.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_on
    }
}
