//! File-backed credential for projected tokens
//!
//! Workload identity setups (Kubernetes service account projection, federated
//! token files) rotate a token file on disk. This client re-reads the file on
//! every request so the refresher always picks up the latest rotation. The
//! file carries no expiry of its own; each read is stamped as valid for the
//! configured `lifetime`.

use crate::{AccessToken, CredentialClient, CredentialError, TokenRequestOptions, ensure_scopes};
use common::Secret;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, SystemTime};
use tracing::debug;

pub struct FileCredential {
    path: PathBuf,
    lifetime: Duration,
}

impl FileCredential {
    /// Create a client for the token file at `path`.
    ///
    /// Fails with `Unavailable` if the file does not exist yet, so a missing
    /// mount is reported at startup rather than on the first refresh.
    pub fn new(path: impl Into<PathBuf>, lifetime: Duration) -> crate::Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(CredentialError::Unavailable(format!(
                "token file {} does not exist",
                path.display()
            )));
        }
        Ok(Self { path, lifetime })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialClient for FileCredential {
    fn id(&self) -> &str {
        "file"
    }

    fn get_token<'a>(
        &'a self,
        options: &'a TokenRequestOptions,
    ) -> Pin<Box<dyn Future<Output = crate::Result<AccessToken>> + Send + 'a>> {
        Box::pin(async move {
            ensure_scopes(options)?;

            let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
                CredentialError::Request(format!(
                    "reading token file {}: {e}",
                    self.path.display()
                ))
            })?;
            let token = contents.trim();
            if token.is_empty() {
                return Err(CredentialError::InvalidToken(format!(
                    "token file {} is empty",
                    self.path.display()
                )));
            }

            debug!(path = %self.path.display(), "read token file");
            Ok(AccessToken {
                token: Secret::new(token.to_owned()),
                expires_on: SystemTime::now() + self.lifetime,
            })
        })
    }
}
