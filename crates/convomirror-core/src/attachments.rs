//! Attachment reference extraction and resolution.
//!
//! A fetched conversation can point at binary attachments in four shapes:
//! attachment-list entries on a message, content-reference file entries,
//! inline asset pointers inside multimodal content, and textual tokens or
//! sandbox-path links embedded in plain text. Extraction flattens all four
//! into one deduplicated list; resolution turns a reference into bytes via
//! the remote collaborator.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Result, SyncError};
use crate::remote::{AttachmentPayload, RemoteApi};
use crate::types::{ContentBlock, Conversation};

/// URL prefixes of the trusted asset host; references under these are
/// fetched directly, everything else goes through an exchange call.
pub const TRUSTED_ASSET_PREFIXES: &[&str] = &[
    "https://assets.convomirror.dev/",
    "https://cdn.convomirror.dev/",
];

/// Inline `{{file:ID}}` placeholder token.
fn file_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{file:([A-Za-z0-9_-]+)\}\}").expect("file token regex"))
}

/// Free-standing sandboxed-execution-path link.
fn sandbox_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"sandbox:/[^\s)\]"'`]+"#).expect("sandbox link regex"))
}

/// How an attachment's bytes can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentKind {
    /// Inline URL on the trusted asset host; fetched directly.
    Cdn(String),
    /// Sandboxed execution-environment path; needs a metadata exchange
    /// scoped to the conversation and message it appeared in.
    Sandbox {
        path: String,
        conversation_id: String,
        message_id: String,
    },
    /// Opaque backend file id; needs a download-URL exchange.
    FileId(String),
}

/// One deduplicated attachment reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    /// Dedup key: the resolved file id, falling back to the raw pointer
    /// string when no id is extractable.
    pub key: String,
    pub kind: AttachmentKind,
    pub name_hint: Option<String>,
    pub mime_hint: Option<String>,
}

fn is_trusted_asset_url(url: &str) -> bool {
    TRUSTED_ASSET_PREFIXES.iter().any(|p| url.starts_with(p))
}

/// File id embedded in an asset pointer like `asset://file-abc` or a
/// bare URL path; the last path segment is the id.
fn file_id_from_pointer(pointer: &str) -> Option<String> {
    let tail = pointer.rsplit('/').next()?;
    let tail = tail.trim();
    if tail.is_empty() {
        None
    } else {
        Some(tail.to_string())
    }
}

/// Extract every attachment reference from a conversation body.
///
/// One iterative pass over all messages and their content trees; nested
/// tool-result content is walked with an explicit stack and duplicates are
/// dropped via a seen-set keyed like [`AttachmentRef::key`].
pub fn extract_references(conversation: &Conversation) -> Vec<AttachmentRef> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<AttachmentRef> = Vec::new();

    let mut push = |out: &mut Vec<AttachmentRef>, reference: AttachmentRef| {
        if seen.insert(reference.key.clone()) {
            out.push(reference);
        }
    };

    for message in &conversation.messages {
        // Shape 1: attachment-list entries declared on the message.
        for meta in &message.attachments {
            let kind = if let Some(url) = meta.url.as_deref().filter(|u| is_trusted_asset_url(u)) {
                AttachmentKind::Cdn(url.to_string())
            } else if let Some(id) = meta.id.as_deref() {
                AttachmentKind::FileId(id.to_string())
            } else {
                continue;
            };
            let key = meta
                .id
                .clone()
                .or_else(|| meta.url.clone())
                .unwrap_or_default();
            push(
                &mut out,
                AttachmentRef {
                    key,
                    kind,
                    name_hint: meta.file_name.clone(),
                    mime_hint: meta.file_type.clone(),
                },
            );
        }

        // Shape 2: content-reference-by-file entries.
        for file in &message.files {
            push(
                &mut out,
                AttachmentRef {
                    key: file.id.clone(),
                    kind: AttachmentKind::FileId(file.id.clone()),
                    name_hint: file.file_name.clone(),
                    mime_hint: file.mime_type.clone(),
                },
            );
        }

        // Shapes 3 and 4: walk the content tree iteratively.
        let mut stack: Vec<&ContentBlock> = message.content.iter().rev().collect();
        let mut texts: Vec<&str> = message.text.as_deref().into_iter().collect();
        while let Some(block) = stack.pop() {
            match block {
                ContentBlock::Text { text } => texts.push(text),
                ContentBlock::ToolUse { .. } => {}
                ContentBlock::ToolResult { content, .. } => {
                    stack.extend(content.iter().rev());
                }
                ContentBlock::Image {
                    asset_pointer: Some(pointer),
                    mime_type,
                } => {
                    let (key, kind) = if is_trusted_asset_url(pointer) {
                        (pointer.clone(), AttachmentKind::Cdn(pointer.clone()))
                    } else if let Some(id) = file_id_from_pointer(pointer) {
                        (id.clone(), AttachmentKind::FileId(id))
                    } else {
                        continue;
                    };
                    push(
                        &mut out,
                        AttachmentRef {
                            key,
                            kind,
                            name_hint: None,
                            mime_hint: mime_type.clone(),
                        },
                    );
                }
                ContentBlock::Image { .. } | ContentBlock::Unknown(_) => {}
            }
        }

        for text in texts {
            for cap in file_token_re().captures_iter(text) {
                let id = cap[1].to_string();
                push(
                    &mut out,
                    AttachmentRef {
                        key: id.clone(),
                        kind: AttachmentKind::FileId(id),
                        name_hint: None,
                        mime_hint: None,
                    },
                );
            }
            for m in sandbox_link_re().find_iter(text) {
                let path = m.as_str().to_string();
                push(
                    &mut out,
                    AttachmentRef {
                        key: path.clone(),
                        kind: AttachmentKind::Sandbox {
                            path,
                            conversation_id: conversation.id.clone(),
                            message_id: message.id.clone(),
                        },
                        name_hint: None,
                        mime_hint: None,
                    },
                );
            }
        }
    }

    out
}

/// Resolved attachment bytes with whatever the transport learned about
/// mime type and filename along the way.
#[derive(Debug)]
pub struct ResolvedAttachment {
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
    pub file_name: Option<String>,
}

/// Turn a reference into bytes.
///
/// CDN references are fetched directly; the other shapes go through the
/// exchange call, which may answer with the bytes themselves or with a
/// short-lived redirect URL that is then fetched.
pub async fn resolve(api: &dyn RemoteApi, reference: &AttachmentRef) -> Result<ResolvedAttachment> {
    let payload = match &reference.kind {
        AttachmentKind::Cdn(url) => api.download_url(url).await?,
        other => api.resolve_attachment(other).await?,
    };
    let payload = match payload {
        AttachmentPayload::Redirect(url) => api.download_url(&url).await?,
        bytes => bytes,
    };
    match payload {
        AttachmentPayload::Bytes {
            bytes,
            mime,
            file_name,
        } => Ok(ResolvedAttachment {
            bytes,
            mime,
            file_name,
        }),
        AttachmentPayload::Redirect(_) => Err(SyncError::Remote(format!(
            "attachment {} resolved to a second redirect",
            reference.key
        ))),
    }
}

const MAX_FILE_NAME_LEN: usize = 120;

/// Replace filesystem-illegal characters and bound the length.
pub fn sanitize_file_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = name.trim_matches([' ', '.']);
    name = if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    };
    if name.chars().count() > MAX_FILE_NAME_LEN {
        name = name.chars().take(MAX_FILE_NAME_LEN).collect();
    }
    name
}

/// Whether the name already ends in a recognizable extension
/// (1 to 5 alphanumeric characters after a dot).
fn has_known_extension(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// Extension for the common mime types the service serves.
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    Some(match essence {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/svg+xml" => ".svg",
        "application/pdf" => ".pdf",
        "application/json" => ".json",
        "application/zip" => ".zip",
        "text/plain" => ".txt",
        "text/csv" => ".csv",
        "text/markdown" => ".md",
        "text/html" => ".html",
        _ => return None,
    })
}

/// Infer the saved filename for an attachment.
///
/// Preference order: explicit metadata name, then a transport-provided
/// name (Content-Disposition), then the file id. Candidates are sanitized;
/// a mime-derived extension is appended only when the chosen name does not
/// already carry a recognizable one.
pub fn infer_file_name(
    explicit: Option<&str>,
    transport: Option<&str>,
    fallback_id: &str,
    mime: Option<&str>,
) -> String {
    let candidate = explicit
        .filter(|s| !s.trim().is_empty())
        .or(transport.filter(|s| !s.trim().is_empty()))
        .unwrap_or(fallback_id);
    let mut name = sanitize_file_name(candidate);
    if !has_known_extension(&name) {
        if let Some(ext) = mime.and_then(extension_for_mime) {
            name.push_str(ext);
        }
    }
    name
}
