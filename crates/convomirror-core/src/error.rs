//! Error taxonomy for the sync engine.
//!
//! Every fallible operation in this crate returns [`Result`]. The variants
//! map onto how the cycle orchestrator reacts to a failure: configuration
//! errors abort before any I/O, storage errors abort the whole cycle,
//! remote and authorization errors are transient and retried on a later
//! cycle.

use thiserror::Error;

/// Error types for synchronization operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid configuration (no mirror root selected, bad
    /// settings). Raised before any network or state I/O is attempted.
    #[error("configuration error: {0}")]
    Config(String),

    /// Local storage failure (permission revoked, disk full, handle
    /// invalidated). Fatal for the current cycle.
    #[error("local storage error: {0}")]
    Storage(String),

    /// Transient remote failure (network error, timeout, 5xx).
    #[error("remote request failed: {0}")]
    Remote(String),

    /// Non-success HTTP status from the remote API.
    #[error("remote returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Authorization failure that survived a credential refresh. Treated
    /// as transient at the cycle level; credentials may recover later.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// The operation was stopped by a cooperative cancellation request.
    #[error("sync cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether this error came back as an HTTP 401.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SyncError::Http { status: 401, .. })
    }

    /// Storage errors are systemic for a cycle; everything else is local
    /// to the entity or page that produced it.
    pub fn is_storage(&self) -> bool {
        matches!(self, SyncError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Storage(format!("state document parse failed: {e}"))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}
