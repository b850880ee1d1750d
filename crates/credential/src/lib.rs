//! Credential client abstraction
//!
//! Defines the `CredentialClient` trait that decouples token scheduling from
//! the way a token is actually obtained. The refresher only ever asks a client
//! for "a token for these scopes" and receives the token with its absolute
//! expiry. Acquisition protocols (client secret, managed identity, certificate)
//! live behind this trait.
//!
//! Two clients ship with the crate:
//! - `StaticCredential` hands out a fixed token (development and tests)
//! - `FileCredential` re-reads a projected token file on every request

pub mod file;
pub mod static_token;

pub use file::FileCredential;
pub use static_token::StaticCredential;

use common::Secret;
use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;

/// A bearer token together with the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: Secret<String>,
    pub expires_on: SystemTime,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: SystemTime) -> Self {
        Self {
            token: Secret::new(token.into()),
            expires_on,
        }
    }
}

/// Parameters for a token request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRequestOptions {
    pub scopes: Vec<String>,
}

impl TokenRequestOptions {
    /// Request a token for a single audience.
    pub fn for_audience(audience: impl Into<String>) -> Self {
        Self {
            scopes: vec![audience.into()],
        }
    }
}

/// Errors from credential clients.
///
/// Payloads are plain strings so the error can be cloned into shared token
/// snapshots and handed to many readers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("credential unavailable: {0}")]
    Unavailable(String),

    #[error("token request failed: {0}")]
    Request(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, CredentialError>;

/// Source of access tokens for a set of scopes.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn CredentialClient>`).
pub trait CredentialClient: Send + Sync {
    /// Identifier for logging (e.g. "static", "file")
    fn id(&self) -> &str;

    /// Fetch a fresh token for `options.scopes`.
    ///
    /// Implementations must not cache on behalf of the caller; every call is
    /// expected to produce the freshest token the source can offer.
    fn get_token<'a>(
        &'a self,
        options: &'a TokenRequestOptions,
    ) -> Pin<Box<dyn Future<Output = Result<AccessToken>> + Send + 'a>>;
}

/// Reject requests without scopes; every client needs an audience to ask for.
pub(crate) fn ensure_scopes(options: &TokenRequestOptions) -> Result<()> {
    if options.scopes.iter().all(|s| s.trim().is_empty()) {
        return Err(CredentialError::Request(
            "at least one non-empty scope is required".into(),
        ));
    }
    Ok(())
}
