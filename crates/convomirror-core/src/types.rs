//! Data model for the remote conversation collection.
//!
//! The remote API returns dynamically shaped JSON; known shapes are modeled
//! as typed structs and tagged unions, with an opaque fallback variant for
//! content blocks this version does not understand. Unknown blocks are
//! carried through serialization untouched so a mirror never loses data it
//! cannot interpret.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The principal that owns a local mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable account identifier assigned by the remote service.
    pub account_id: String,
    /// Human-readable label (typically the account email). Used as the
    /// mirror's top-level folder name.
    pub label: String,
}

/// A named partition of the remote collection, scanned and watermarked
/// independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeId {
    /// The default/personal scope, keyed by workspace identity.
    Workspace(String),
    /// A project scope, keyed by project identifier.
    Project(String),
}

impl ScopeId {
    /// Stable key under which this scope is tracked in the state document.
    pub fn state_key(&self) -> String {
        match self {
            ScopeId::Workspace(id) => format!("workspace:{id}"),
            ScopeId::Project(id) => format!("project:{id}"),
        }
    }
}

/// Minimal project descriptor as it appears in listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStub {
    pub id: String,
    pub name: String,
}

/// One item of a conversation listing page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Remote mutation watermark; drives staleness comparison.
    pub updated_at: DateTime<Utc>,
    /// Present when the conversation belongs to a project, regardless of
    /// which listing endpoint surfaced it.
    #[serde(default)]
    pub project: Option<ProjectStub>,
}

/// One page of a conversation listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationPage {
    pub items: Vec<ConversationSummary>,
    /// Total item count for the scope, when the listing reports one.
    #[serde(default)]
    pub total: Option<u64>,
}

/// One page of the project directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectPage {
    pub items: Vec<ProjectStub>,
    /// Opaque cursor for the next page; `None` means the directory is
    /// exhausted.
    #[serde(default)]
    pub cursor: Option<String>,
}

/// A fully fetched conversation body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub project: Option<ProjectStub>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// A single message node within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Author role as reported by the remote service ("human",
    /// "assistant", ...). Kept as a string; the engine never branches on it.
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// Plain-text rendering, present on older message shapes.
    #[serde(default)]
    pub text: Option<String>,
    /// Attachment-list entries declared on the message itself.
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
    /// Content-reference-by-file entries (uploads referenced by id).
    #[serde(default)]
    pub files: Vec<FileRef>,
}

/// Known content block shapes, plus an opaque fallback.
///
/// The fallback must stay the last variant: serde tries the tagged variants
/// first and only then captures the raw value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        content: Vec<ContentBlock>,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        /// Pointer into the asset store for inline multimodal parts.
        #[serde(default)]
        asset_pointer: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
    },
    #[serde(untagged)]
    Unknown(Value),
}

/// Attachment-list entry as declared in message metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    /// Inline CDN URL, when the service embeds one directly.
    #[serde(default)]
    pub url: Option<String>,
}

/// Content-reference-by-file entry (an uploaded file referenced by id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}
