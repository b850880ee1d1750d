//! Error types for token provider construction

use credential::CredentialError;

/// Errors returned while constructing a `TokenProvider`.
///
/// Failures of background refreshes are never returned from a call; they are
/// recorded in the published `TokenState` instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to create credential client: {0}")]
    CredentialCreation(CredentialError),

    #[error("failed to get access token: {0}")]
    InitialFetch(CredentialError),
}

impl From<common::Error> for Error {
    fn from(err: common::Error) -> Self {
        match err {
            common::Error::Config(msg) => Error::Configuration(msg),
            other => Error::Configuration(other.to_string()),
        }
    }
}

/// Result alias for provider construction.
pub type Result<T> = std::result::Result<T, Error>;
