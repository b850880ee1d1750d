//! Static credential: hands out one fixed token with a rolling expiry.
//!
//! Each request returns the same token string, stamped as valid for
//! `lifetime` from the time of the request. Useful for local development
//! against services that accept a long-lived token, and for tests.

use crate::{AccessToken, CredentialClient, TokenRequestOptions, ensure_scopes};
use common::Secret;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

pub struct StaticCredential {
    token: Secret<String>,
    lifetime: Duration,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            token: Secret::new(token.into()),
            lifetime,
        }
    }
}

impl CredentialClient for StaticCredential {
    fn id(&self) -> &str {
        "static"
    }

    fn get_token<'a>(
        &'a self,
        options: &'a TokenRequestOptions,
    ) -> Pin<Box<dyn Future<Output = crate::Result<AccessToken>> + Send + 'a>> {
        Box::pin(async move {
            ensure_scopes(options)?;
            Ok(AccessToken {
                token: self.token.clone(),
                expires_on: SystemTime::now() + self.lifetime,
            })
        })
    }
}
