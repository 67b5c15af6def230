//! Idempotent persistence of fetched conversations and their attachments.
//!
//! The on-disk layout per conversation is
//! `<identity>/<workspace>/<category>/<conversation-id>/` holding
//! `conversation.json`, `metadata.json` and an `attachments/` folder.
//! Attachment presence is re-derived from filename existence checks each
//! pass, never from the state document, so repeated cycles skip downloads
//! whose files are already in place.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::attachments::{
    extract_references, infer_file_name, resolve, sanitize_file_name, AttachmentKind,
    AttachmentRef,
};
use crate::error::{Result, SyncError};
use crate::remote::RemoteApi;
use crate::scheduler::CancelFlag;
use crate::store::LocalStore;
use crate::types::Conversation;

pub const CONVERSATION_FILE: &str = "conversation.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const ATTACHMENTS_DIR: &str = "attachments";

/// What happened to one attachment during a persist pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    Saved,
    AlreadySaved,
    Failed,
}

/// Manifest entry recorded in `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentOutcome {
    pub key: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    pub status: AttachmentStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// Derived summary written alongside the raw body. Always regenerated in
/// full; it is cheap and must reflect the latest attachment set.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    pub message_count: usize,
    pub attachments: Vec<AttachmentOutcome>,
}

/// Attachment tallies for one persisted conversation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Persists one fetched conversation into the local store.
pub struct Writer<'a> {
    store: &'a dyn LocalStore,
    api: &'a dyn RemoteApi,
    cancel: &'a CancelFlag,
}

impl<'a> Writer<'a> {
    pub fn new(store: &'a dyn LocalStore, api: &'a dyn RemoteApi, cancel: &'a CancelFlag) -> Self {
        Self { store, api, cancel }
    }

    /// Write body, metadata and attachments. On success the caller — and
    /// only the caller — advances the conversation's watermark; nothing
    /// here touches the state document.
    pub async fn persist(
        &self,
        identity_label: &str,
        workspace_label: &str,
        category: &str,
        conversation: &Conversation,
    ) -> Result<PersistReport> {
        let dir: PathBuf = [
            sanitize_file_name(identity_label),
            sanitize_file_name(workspace_label),
            sanitize_file_name(category),
            sanitize_file_name(&conversation.id),
        ]
        .iter()
        .collect();
        self.store.ensure_dir(&dir).await?;

        let body = serde_json::to_vec_pretty(conversation)?;
        self.store.write_file(&dir, CONVERSATION_FILE, &body).await?;

        let references = extract_references(conversation);
        let attachments_dir = dir.join(ATTACHMENTS_DIR);
        if !references.is_empty() {
            self.store.ensure_dir(&attachments_dir).await?;
        }

        let mut report = PersistReport::default();
        let mut outcomes = Vec::with_capacity(references.len());
        let mut used_names: HashSet<String> = HashSet::new();
        for reference in &references {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let outcome = self
                .save_attachment(&attachments_dir, reference, &mut used_names)
                .await?;
            match outcome.status {
                AttachmentStatus::Saved => report.downloaded += 1,
                AttachmentStatus::AlreadySaved => report.skipped += 1,
                AttachmentStatus::Failed => report.failed += 1,
            }
            outcomes.push(outcome);
        }

        let metadata = ConversationMetadata {
            id: conversation.id.clone(),
            title: conversation.title.clone(),
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
            saved_at: Utc::now(),
            message_count: conversation.messages.len(),
            attachments: outcomes,
        };
        self.store
            .write_file(&dir, METADATA_FILE, &serde_json::to_vec_pretty(&metadata)?)
            .await?;

        debug!(
            id = %conversation.id,
            downloaded = report.downloaded,
            skipped = report.skipped,
            failed = report.failed,
            "persisted conversation"
        );
        Ok(report)
    }

    async fn save_attachment(
        &self,
        attachments_dir: &std::path::Path,
        reference: &AttachmentRef,
        used_names: &mut HashSet<String>,
    ) -> Result<AttachmentOutcome> {
        // Fast path: a file under the predicted name (derived without any
        // network call) means a previous cycle already saved this.
        let predicted = infer_file_name(
            reference.name_hint.as_deref(),
            None,
            &fallback_stem(reference),
            reference.mime_hint.as_deref(),
        );
        let candidate = next_free_variant(&predicted, used_names);
        if self.store.file_exists(attachments_dir, &candidate).await? {
            used_names.insert(candidate.clone());
            return Ok(AttachmentOutcome {
                key: reference.key.clone(),
                file_name: Some(candidate),
                mime: reference.mime_hint.clone(),
                status: AttachmentStatus::AlreadySaved,
                error: None,
            });
        }

        let resolved = match resolve(self.api, reference).await {
            Ok(resolved) => resolved,
            Err(e) if e.is_storage() => return Err(e),
            Err(e) => {
                // Local to this attachment: the conversation and its other
                // attachments still get persisted.
                warn!(key = %reference.key, "attachment resolution failed: {e}");
                return Ok(AttachmentOutcome {
                    key: reference.key.clone(),
                    file_name: None,
                    mime: reference.mime_hint.clone(),
                    status: AttachmentStatus::Failed,
                    error: Some(e.to_string()),
                });
            }
        };

        let mime = resolved.mime.clone().or_else(|| reference.mime_hint.clone());
        let actual = infer_file_name(
            reference.name_hint.as_deref(),
            resolved.file_name.as_deref(),
            &fallback_stem(reference),
            mime.as_deref(),
        );
        let name = next_free_variant(&actual, used_names);
        // Prediction and resolution can disagree; re-check under the
        // resolved name so we never write the same bytes twice.
        if name != candidate && self.store.file_exists(attachments_dir, &name).await? {
            used_names.insert(name.clone());
            return Ok(AttachmentOutcome {
                key: reference.key.clone(),
                file_name: Some(name),
                mime,
                status: AttachmentStatus::AlreadySaved,
                error: None,
            });
        }

        self.store
            .write_file(attachments_dir, &name, &resolved.bytes)
            .await?;
        used_names.insert(name.clone());
        Ok(AttachmentOutcome {
            key: reference.key.clone(),
            file_name: Some(name),
            mime,
            status: AttachmentStatus::Saved,
            error: None,
        })
    }
}

/// Base stem used when a reference carries no usable name.
fn fallback_stem(reference: &AttachmentRef) -> String {
    let raw = match &reference.kind {
        AttachmentKind::FileId(id) => id.as_str(),
        AttachmentKind::Cdn(url) => url.rsplit('/').next().unwrap_or(url.as_str()),
        AttachmentKind::Sandbox { path, .. } => path.rsplit('/').next().unwrap_or(path.as_str()),
    };
    raw.to_string()
}

/// First numeric-prefix variant of `name` not yet claimed this pass.
/// Processing order is stable across cycles, so the same attachment keeps
/// landing on the same variant.
fn next_free_variant(name: &str, used_names: &HashSet<String>) -> String {
    if !used_names.contains(name) {
        return name.to_string();
    }
    let mut n = 1usize;
    loop {
        let candidate = format!("{n}_{name}");
        if !used_names.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::{conversation, MockRemote};
    use crate::types::{AttachmentMeta, FileRef, Message};
    use std::path::Path;
    use std::sync::atomic::Ordering;

    fn message_with_files(files: Vec<FileRef>) -> Message {
        Message {
            id: "m1".to_string(),
            sender: "human".to_string(),
            created_at: None,
            content: Vec::new(),
            text: None,
            attachments: Vec::new(),
            files,
        }
    }

    fn conv_dir() -> &'static Path {
        Path::new("alice@example.com/workspace/chats/conv-1")
    }

    async fn read_metadata(store: &MemoryStore) -> ConversationMetadata {
        let bytes = store
            .read_file(conv_dir(), METADATA_FILE)
            .await
            .expect("read")
            .expect("metadata written");
        serde_json::from_slice(&bytes).expect("metadata parses")
    }

    #[tokio::test]
    async fn persists_body_metadata_and_attachments() {
        let remote = MockRemote::new();
        remote.add_attachment_bytes("file-a", b"PDFDATA", "application/pdf", None);
        let store = MemoryStore::new();
        let cancel = CancelFlag::new();

        let mut conv = conversation("conv-1", 100);
        conv.messages.push(message_with_files(vec![FileRef {
            id: "file-a".to_string(),
            file_name: Some("report.pdf".to_string()),
            mime_type: Some("application/pdf".to_string()),
        }]));

        let writer = Writer::new(&store, &remote, &cancel);
        let report = writer
            .persist("alice@example.com", "workspace", "chats", &conv)
            .await
            .expect("persist");

        assert_eq!(report.downloaded, 1);
        assert!(store
            .file_exists(conv_dir(), CONVERSATION_FILE)
            .await
            .expect("exists"));
        assert!(store
            .file_exists(&conv_dir().join(ATTACHMENTS_DIR), "report.pdf")
            .await
            .expect("exists"));

        let metadata = read_metadata(&store).await;
        assert_eq!(metadata.attachments.len(), 1);
        assert_eq!(metadata.attachments[0].status, AttachmentStatus::Saved);
        assert_eq!(metadata.message_count, 1);
    }

    #[tokio::test]
    async fn second_persist_downloads_nothing() {
        let remote = MockRemote::new();
        remote.add_attachment_bytes("file-a", b"DATA", "text/plain", None);
        let store = MemoryStore::new();
        let cancel = CancelFlag::new();

        let mut conv = conversation("conv-1", 100);
        conv.messages.push(message_with_files(vec![FileRef {
            id: "file-a".to_string(),
            file_name: Some("notes.txt".to_string()),
            mime_type: Some("text/plain".to_string()),
        }]));

        let writer = Writer::new(&store, &remote, &cancel);
        writer
            .persist("alice@example.com", "workspace", "chats", &conv)
            .await
            .expect("first persist");
        let before = remote.resolve_calls.load(Ordering::SeqCst)
            + remote.download_calls.load(Ordering::SeqCst);

        let report = writer
            .persist("alice@example.com", "workspace", "chats", &conv)
            .await
            .expect("second persist");

        let after = remote.resolve_calls.load(Ordering::SeqCst)
            + remote.download_calls.load(Ordering::SeqCst);
        assert_eq!(before, after, "no attachment traffic on the second pass");
        assert_eq!(report.downloaded, 0);
        assert_eq!(report.skipped, 1);

        let metadata = read_metadata(&store).await;
        assert_eq!(
            metadata.attachments[0].status,
            AttachmentStatus::AlreadySaved
        );
    }

    #[tokio::test]
    async fn colliding_names_get_numeric_prefixes() {
        let remote = MockRemote::new();
        remote.add_attachment_bytes("file-a", b"ONE", "text/csv", None);
        remote.add_attachment_bytes("file-b", b"TWO", "text/csv", None);
        let store = MemoryStore::new();
        let cancel = CancelFlag::new();

        let mut conv = conversation("conv-1", 100);
        conv.messages.push(message_with_files(vec![
            FileRef {
                id: "file-a".to_string(),
                file_name: Some("data.csv".to_string()),
                mime_type: Some("text/csv".to_string()),
            },
            FileRef {
                id: "file-b".to_string(),
                file_name: Some("data.csv".to_string()),
                mime_type: Some("text/csv".to_string()),
            },
        ]));

        let writer = Writer::new(&store, &remote, &cancel);
        let report = writer
            .persist("alice@example.com", "workspace", "chats", &conv)
            .await
            .expect("persist");
        assert_eq!(report.downloaded, 2);

        let attachments_dir = conv_dir().join(ATTACHMENTS_DIR);
        assert_eq!(
            store.read_file(&attachments_dir, "data.csv").await.expect("read"),
            Some(b"ONE".to_vec())
        );
        assert_eq!(
            store
                .read_file(&attachments_dir, "1_data.csv")
                .await
                .expect("read"),
            Some(b"TWO".to_vec())
        );

        // Stable ordering keeps the variants idempotent on later passes.
        let report = writer
            .persist("alice@example.com", "workspace", "chats", &conv)
            .await
            .expect("second persist");
        assert_eq!(report.downloaded, 0);
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn attachment_failure_does_not_sink_the_entity() {
        let remote = MockRemote::new();
        remote.add_attachment_bytes("file-ok", b"FINE", "text/plain", None);
        // file-missing has no payload scripted: resolution 404s.
        let store = MemoryStore::new();
        let cancel = CancelFlag::new();

        let mut conv = conversation("conv-1", 100);
        conv.messages.push(message_with_files(vec![
            FileRef {
                id: "file-missing".to_string(),
                file_name: Some("gone.txt".to_string()),
                mime_type: None,
            },
            FileRef {
                id: "file-ok".to_string(),
                file_name: Some("fine.txt".to_string()),
                mime_type: Some("text/plain".to_string()),
            },
        ]));

        let writer = Writer::new(&store, &remote, &cancel);
        let report = writer
            .persist("alice@example.com", "workspace", "chats", &conv)
            .await
            .expect("persist succeeds despite the bad attachment");

        assert_eq!(report.failed, 1);
        assert_eq!(report.downloaded, 1);

        let metadata = read_metadata(&store).await;
        assert_eq!(metadata.attachments[0].status, AttachmentStatus::Failed);
        assert!(metadata.attachments[0].error.is_some());
        assert_eq!(metadata.attachments[1].status, AttachmentStatus::Saved);
    }

    #[tokio::test]
    async fn redirect_payloads_are_followed_once() {
        let remote = MockRemote::new();
        remote.add_attachment_redirect("file-a", "https://signed.example/file-a");
        remote.add_attachment_bytes(
            "https://signed.example/file-a",
            b"BYTES",
            "image/png",
            Some("chart.png"),
        );
        let store = MemoryStore::new();
        let cancel = CancelFlag::new();

        let mut conv = conversation("conv-1", 100);
        conv.messages.push(message_with_files(vec![FileRef {
            id: "file-a".to_string(),
            file_name: None,
            mime_type: None,
        }]));

        let writer = Writer::new(&store, &remote, &cancel);
        writer
            .persist("alice@example.com", "workspace", "chats", &conv)
            .await
            .expect("persist");

        assert_eq!(remote.download_calls.load(Ordering::SeqCst), 1);
        assert!(store
            .file_exists(&conv_dir().join(ATTACHMENTS_DIR), "chart.png")
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn resolved_name_recheck_avoids_duplicate_write() {
        let remote = MockRemote::new();
        remote.add_attachment_bytes("file-a", b"BYTES", "image/png", Some("chart.png"));
        let store = MemoryStore::new();
        let cancel = CancelFlag::new();

        // A previous cycle (or another instance) already saved the file
        // under its resolved name; the predicted name differs.
        let attachments_dir = conv_dir().join(ATTACHMENTS_DIR);
        store.ensure_dir(&attachments_dir).await.expect("ensure");
        store
            .write_file(&attachments_dir, "chart.png", b"BYTES")
            .await
            .expect("seed");

        let mut conv = conversation("conv-1", 100);
        conv.messages.push(message_with_files(vec![FileRef {
            id: "file-a".to_string(),
            file_name: None,
            mime_type: None,
        }]));

        let writer = Writer::new(&store, &remote, &cancel);
        let report = writer
            .persist("alice@example.com", "workspace", "chats", &conv)
            .await
            .expect("persist");

        assert_eq!(report.downloaded, 0);
        assert_eq!(report.skipped, 1);
        let metadata = read_metadata(&store).await;
        assert_eq!(
            metadata.attachments[0].file_name.as_deref(),
            Some("chart.png")
        );
    }
}
