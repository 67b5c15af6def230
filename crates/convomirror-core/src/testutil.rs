//! Scriptable remote-API double with call counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::attachments::AttachmentKind;
use crate::error::{Result, SyncError};
use crate::remote::{AttachmentPayload, CredentialProvider, RemoteApi};
use crate::types::{
    Conversation, ConversationPage, ConversationSummary, Identity, ProjectPage, ProjectStub,
};

pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("timestamp")
}

pub(crate) fn summary(
    id: &str,
    updated_at: i64,
    project: Option<(&str, &str)>,
) -> ConversationSummary {
    ConversationSummary {
        id: id.to_string(),
        title: format!("title of {id}"),
        updated_at: ts(updated_at),
        project: project.map(|(pid, name)| ProjectStub {
            id: pid.to_string(),
            name: name.to_string(),
        }),
    }
}

pub(crate) fn conversation(id: &str, updated_at: i64) -> Conversation {
    Conversation {
        id: id.to_string(),
        title: format!("title of {id}"),
        created_at: ts(updated_at - 1000),
        updated_at: ts(updated_at),
        project: None,
        messages: Vec::new(),
    }
}

/// In-memory remote service. Every listing, fetch and attachment exchange
/// is counted so tests can assert how much work a cycle performed.
#[derive(Default)]
pub(crate) struct MockRemote {
    pub personal: Mutex<Vec<ConversationSummary>>,
    pub personal_total: Mutex<Option<u64>>,
    /// Project directory, one inner vec per cursor page.
    pub directory_pages: Mutex<Vec<Vec<ProjectStub>>>,
    pub project_listings: Mutex<HashMap<String, Vec<ConversationSummary>>>,
    pub conversations: Mutex<HashMap<String, Conversation>>,
    /// Failures a conversation fetch must see before it succeeds;
    /// `usize::MAX` means it never succeeds.
    pub fetch_failures: Mutex<HashMap<String, usize>>,
    /// Offsets whose personal listing call fails (page-level fault).
    pub failing_personal_offsets: Mutex<Vec<usize>>,
    /// Attachment payloads by reference key (file id, url, sandbox path).
    pub attachment_payloads: Mutex<HashMap<String, AttachmentPayload>>,
    /// Artificial latency injected into every conversation fetch.
    pub fetch_delay: Mutex<Option<std::time::Duration>>,

    pub personal_list_calls: AtomicUsize,
    pub project_list_calls: AtomicUsize,
    pub directory_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub resolve_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_personal(&self, items: Vec<ConversationSummary>) {
        *self.personal.lock().expect("mock lock") = items;
    }

    pub fn add_project(&self, id: &str, name: &str, items: Vec<ConversationSummary>) {
        let stub = ProjectStub {
            id: id.to_string(),
            name: name.to_string(),
        };
        let mut pages = self.directory_pages.lock().expect("mock lock");
        if pages.is_empty() {
            pages.push(Vec::new());
        }
        pages[0].push(stub);
        self.project_listings
            .lock()
            .expect("mock lock")
            .insert(id.to_string(), items);
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        self.conversations
            .lock()
            .expect("mock lock")
            .insert(conversation.id.clone(), conversation);
    }

    pub fn fail_fetch(&self, id: &str, times: usize) {
        self.fetch_failures
            .lock()
            .expect("mock lock")
            .insert(id.to_string(), times);
    }

    pub fn add_attachment_bytes(&self, key: &str, bytes: &[u8], mime: &str, name: Option<&str>) {
        self.attachment_payloads.lock().expect("mock lock").insert(
            key.to_string(),
            AttachmentPayload::Bytes {
                bytes: bytes.to_vec(),
                mime: Some(mime.to_string()),
                file_name: name.map(str::to_string),
            },
        );
    }

    pub fn add_attachment_redirect(&self, key: &str, url: &str) {
        self.attachment_payloads
            .lock()
            .expect("mock lock")
            .insert(key.to_string(), AttachmentPayload::Redirect(url.to_string()));
    }

    fn slice(items: &[ConversationSummary], offset: usize, limit: usize) -> Vec<ConversationSummary> {
        items.iter().skip(offset).take(limit).cloned().collect()
    }

    fn payload_for(&self, key: &str) -> Result<AttachmentPayload> {
        self.attachment_payloads
            .lock()
            .expect("mock lock")
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::Http {
                status: 404,
                message: format!("no attachment {key}"),
            })
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn list_personal(&self, offset: usize, limit: usize) -> Result<ConversationPage> {
        self.personal_list_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_personal_offsets
            .lock()
            .expect("mock lock")
            .contains(&offset)
        {
            return Err(SyncError::Remote(format!(
                "listing failed at offset {offset}"
            )));
        }
        let items = Self::slice(&self.personal.lock().expect("mock lock"), offset, limit);
        Ok(ConversationPage {
            items,
            total: *self.personal_total.lock().expect("mock lock"),
        })
    }

    async fn list_project(
        &self,
        project_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<ConversationPage> {
        self.project_list_calls.fetch_add(1, Ordering::SeqCst);
        let listings = self.project_listings.lock().expect("mock lock");
        let items = listings
            .get(project_id)
            .map(|all| Self::slice(all, offset, limit))
            .unwrap_or_default();
        Ok(ConversationPage { items, total: None })
    }

    async fn list_projects(&self, cursor: Option<&str>) -> Result<ProjectPage> {
        self.directory_calls.fetch_add(1, Ordering::SeqCst);
        let pages = self.directory_pages.lock().expect("mock lock");
        let index: usize = cursor.map(|c| c.parse().expect("cursor")).unwrap_or(0);
        let items = pages.get(index).cloned().unwrap_or_default();
        let cursor = if index + 1 < pages.len() {
            Some((index + 1).to_string())
        } else {
            None
        };
        Ok(ProjectPage { items, cursor })
    }

    async fn fetch_conversation(
        &self,
        id: &str,
        _project_id: Option<&str>,
    ) -> Result<Conversation> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().expect("mock lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut failures = self.fetch_failures.lock().expect("mock lock");
            if let Some(remaining) = failures.get_mut(id) {
                if *remaining == usize::MAX {
                    return Err(SyncError::Remote(format!("fetch of {id} always fails")));
                }
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SyncError::Remote(format!("transient failure fetching {id}")));
                }
            }
        }
        self.conversations
            .lock()
            .expect("mock lock")
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::Http {
                status: 404,
                message: format!("no conversation {id}"),
            })
    }

    async fn resolve_attachment(&self, kind: &AttachmentKind) -> Result<AttachmentPayload> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let key = match kind {
            AttachmentKind::Cdn(url) => url.as_str(),
            AttachmentKind::Sandbox { path, .. } => path.as_str(),
            AttachmentKind::FileId(id) => id.as_str(),
        };
        self.payload_for(key)
    }

    async fn download_url(&self, url: &str) -> Result<AttachmentPayload> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        self.payload_for(url)
    }
}

/// Credential double: a fixed identity, always ready.
pub(crate) struct MockCredentials {
    pub identity: Identity,
}

impl MockCredentials {
    pub fn new() -> Self {
        Self {
            identity: Identity {
                account_id: "acct-1".to_string(),
                label: "alice@example.com".to_string(),
            },
        }
    }
}

#[async_trait]
impl CredentialProvider for MockCredentials {
    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn auth_headers(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![("authorization".to_string(), "Bearer test".to_string())])
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn identity(&self) -> Result<Identity> {
        Ok(self.identity.clone())
    }
}
