//! Static session-token credentials.

use async_trait::async_trait;

use convomirror_core::error::{Result, SyncError};
use convomirror_core::remote::CredentialProvider;
use convomirror_core::types::Identity;

/// Credential provider backed by a fixed session token from configuration.
///
/// Constructed once per process and shared by reference; there is no
/// ambient global token. `refresh` is a no-op here — a token that stops
/// working surfaces as an authorization error and the cycle retries later,
/// by which time the operator may have rotated the configured token.
pub struct StaticCredentials {
    token: String,
    identity: Identity,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>, identity: Identity) -> Self {
        Self {
            token: token.into(),
            identity,
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn ensure_ready(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            return Err(SyncError::Config(
                "no session token configured".to_string(),
            ));
        }
        Ok(())
    }

    async fn auth_headers(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![(
            "authorization".to_string(),
            format!("Bearer {}", self.token),
        )])
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn identity(&self) -> Result<Identity> {
        Ok(self.identity.clone())
    }
}
