//! Background refresh for a single bearer token
//!
//! Keeps one access token fresh for a process that repeatedly calls a token
//! authority, so request paths never wait on a credential fetch. Callers read
//! the current token through `TokenProvider::get_access_token`; a background
//! task re-fetches it before it expires.
//!
//! Token lifecycle:
//! 1. `TokenProvider::builder()...build()` fetches the first token (failure
//!    fails construction)
//! 2. The refresh time is computed from the token's expiry and the configured
//!    refresh percentage (`schedule::next_refresh`)
//! 3. The background task sleeps until then and fetches again
//! 4. Success publishes the new token; failure keeps the old token, records the
//!    error and retries after `retry_interval_secs` (or stops, if configured)
//! 5. `shutdown()` or dropping the provider cancels the task

pub mod config;
pub mod error;
pub mod observer;
mod provider;
mod refresh;
pub mod schedule;
pub mod scheduler;
mod state;

pub use config::RefreshConfig;
pub use error::{Error, Result};
pub use observer::{MetricsObserver, NoopObserver, RefreshObserver, RefreshReport};
pub use provider::{TokenProvider, TokenProviderBuilder};
pub use schedule::{next_refresh, refresh_delay};
pub use state::TokenState;
