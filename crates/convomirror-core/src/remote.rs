//! Collaborator traits for the remote service.
//!
//! The engine consumes the remote API and the credential source through
//! these traits only; `convomirror-api` provides the HTTP implementations
//! and tests provide scriptable doubles.

use async_trait::async_trait;

use crate::attachments::AttachmentKind;
use crate::error::Result;
use crate::types::{Conversation, ConversationPage, Identity, ProjectPage};

/// Resolved attachment bytes, or a redirect to fetch them from.
#[derive(Debug, Clone)]
pub enum AttachmentPayload {
    Bytes {
        bytes: Vec<u8>,
        mime: Option<String>,
        /// Filename hint, typically recovered from a Content-Disposition
        /// header.
        file_name: Option<String>,
    },
    /// Short-lived direct download URL; fetch it with
    /// [`RemoteApi::download_url`].
    Redirect(String),
}

/// Typed surface of the remote conversation service.
///
/// Listing pages are assumed to be ordered reverse-chronologically by
/// update time; the scanner's early-exit rule depends on it.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Page through the personal/workspace listing.
    async fn list_personal(&self, offset: usize, limit: usize) -> Result<ConversationPage>;

    /// Page through one project's listing.
    async fn list_project(
        &self,
        project_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<ConversationPage>;

    /// Page through the project directory via an opaque cursor.
    async fn list_projects(&self, cursor: Option<&str>) -> Result<ProjectPage>;

    /// Fetch one full conversation body. Non-2xx responses are errors; the
    /// implementation performs one credential refresh and retry on 401.
    async fn fetch_conversation(
        &self,
        id: &str,
        project_id: Option<&str>,
    ) -> Result<Conversation>;

    /// Exchange an attachment reference for its bytes or a download URL.
    async fn resolve_attachment(&self, kind: &AttachmentKind) -> Result<AttachmentPayload>;

    /// Fetch a direct (possibly short-lived) URL. Always yields bytes.
    async fn download_url(&self, url: &str) -> Result<AttachmentPayload>;
}

/// Credential source, constructed once per process and passed by reference
/// to every component that needs it. There is no ambient global token.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Resolve a session, refreshing if necessary. Must succeed before the
    /// first sync cycle touches the network.
    async fn ensure_ready(&self) -> Result<()>;

    /// Current authorization headers.
    async fn auth_headers(&self) -> Result<Vec<(String, String)>>;

    /// Force a session refresh (after a 401).
    async fn refresh(&self) -> Result<()>;

    /// The identity the mirror belongs to.
    async fn identity(&self) -> Result<Identity>;
}
