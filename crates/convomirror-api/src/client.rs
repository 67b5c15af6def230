//! reqwest-backed implementation of the remote API collaborator.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use convomirror_core::attachments::AttachmentKind;
use convomirror_core::error::{Result, SyncError};
use convomirror_core::remote::{AttachmentPayload, CredentialProvider, RemoteApi};
use convomirror_core::types::{Conversation, ConversationPage, ProjectPage};

/// JSON shape of a download-URL exchange response.
#[derive(Debug, Deserialize)]
struct DownloadLink {
    url: String,
}

/// HTTP client for the conversation service.
pub struct HttpRemoteApi {
    http: Client,
    base_url: String,
    workspace_id: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl std::fmt::Debug for HttpRemoteApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteApi")
            .field("base_url", &self.base_url)
            .field("workspace_id", &self.workspace_id)
            .finish_non_exhaustive()
    }
}

impl HttpRemoteApi {
    pub fn new(
        base_url: impl Into<String>,
        workspace_id: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(SyncError::Config("remote base URL is empty".to_string()));
        }
        let http = Client::builder()
            .build()
            .map_err(|e| SyncError::Remote(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            workspace_id: workspace_id.into(),
            credentials,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn send_once<F>(&self, build: &F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut request = build(&self.http);
        for (name, value) in self.credentials.auth_headers().await? {
            request = request.header(name.as_str(), value.as_str());
        }
        request
            .send()
            .await
            .map_err(|e| SyncError::Remote(e.to_string()))
    }

    /// Send with credentials; on 401, refresh the session and retry once.
    async fn send_authed<F>(&self, build: &F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self.send_once(build).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return ok_status(response).await;
        }
        warn!("remote rejected credentials, refreshing session");
        self.credentials.refresh().await?;
        let retry = self.send_once(build).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            return Err(SyncError::Auth(
                "session still rejected after refresh".to_string(),
            ));
        }
        ok_status(retry).await
    }

    async fn get_json<T, F>(&self, build: F) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self.send_authed(&build).await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Remote(format!("malformed response: {e}")))
    }

    /// Read an exchange response that is either the binary stream itself
    /// or a JSON body carrying a short-lived download URL.
    async fn payload_from_exchange(&self, response: Response) -> Result<AttachmentPayload> {
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);
        if is_json {
            let link: DownloadLink = response
                .json()
                .await
                .map_err(|e| SyncError::Remote(format!("malformed download link: {e}")))?;
            return Ok(AttachmentPayload::Redirect(link.url));
        }
        payload_from_binary(response).await
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn list_personal(&self, offset: usize, limit: usize) -> Result<ConversationPage> {
        let url = self.endpoint(&format!(
            "/v1/workspaces/{}/conversations",
            self.workspace_id
        ));
        debug!(offset, limit, "listing personal conversations");
        self.get_json(|http: &Client| {
            http.get(&url).query(&[
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
                ("order", "updated_desc".to_string()),
            ])
        })
        .await
    }

    async fn list_project(
        &self,
        project_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<ConversationPage> {
        let url = self.endpoint(&format!(
            "/v1/workspaces/{}/projects/{project_id}/conversations",
            self.workspace_id
        ));
        debug!(project_id, offset, limit, "listing project conversations");
        self.get_json(|http: &Client| {
            http.get(&url).query(&[
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ])
        })
        .await
    }

    async fn list_projects(&self, cursor: Option<&str>) -> Result<ProjectPage> {
        let url = self.endpoint(&format!("/v1/workspaces/{}/projects", self.workspace_id));
        let cursor = cursor.map(str::to_string);
        self.get_json(|http: &Client| {
            let mut request = http.get(&url);
            if let Some(cursor) = &cursor {
                request = request.query(&[("cursor", cursor)]);
            }
            request
        })
        .await
    }

    async fn fetch_conversation(
        &self,
        id: &str,
        project_id: Option<&str>,
    ) -> Result<Conversation> {
        let url = self.endpoint(&format!(
            "/v1/workspaces/{}/conversations/{id}",
            self.workspace_id
        ));
        let project_id = project_id.map(str::to_string);
        self.get_json(|http: &Client| {
            let mut request = http.get(&url).query(&[("include_messages", "true")]);
            if let Some(project_id) = &project_id {
                request = request.query(&[("project", project_id)]);
            }
            request
        })
        .await
    }

    async fn resolve_attachment(&self, kind: &AttachmentKind) -> Result<AttachmentPayload> {
        match kind {
            AttachmentKind::Cdn(url) => self.download_url(url).await,
            AttachmentKind::FileId(id) => {
                let url = self.endpoint(&format!(
                    "/v1/workspaces/{}/files/{id}/download",
                    self.workspace_id
                ));
                let response = self.send_authed(&|http: &Client| http.get(&url)).await?;
                self.payload_from_exchange(response).await
            }
            AttachmentKind::Sandbox {
                path,
                conversation_id,
                message_id,
            } => {
                let url = self.endpoint(&format!(
                    "/v1/workspaces/{}/conversations/{conversation_id}/messages/{message_id}/sandbox_files",
                    self.workspace_id
                ));
                let body = serde_json::json!({ "path": path });
                let response = self
                    .send_authed(&|http: &Client| http.post(&url).json(&body))
                    .await?;
                self.payload_from_exchange(response).await
            }
        }
    }

    async fn download_url(&self, url: &str) -> Result<AttachmentPayload> {
        // Direct URLs carry their own authorization; no session headers.
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::Remote(e.to_string()))?;
        let response = ok_status(response).await?;
        payload_from_binary(response).await
    }
}

async fn ok_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    let message: String = message.chars().take(200).collect();
    Err(SyncError::Http {
        status: status.as_u16(),
        message,
    })
}

async fn payload_from_binary(response: Response) -> Result<AttachmentPayload> {
    let mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let file_name = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(disposition_filename);
    let bytes = response
        .bytes()
        .await
        .map_err(|e| SyncError::Remote(e.to_string()))?
        .to_vec();
    Ok(AttachmentPayload::Bytes {
        bytes,
        mime,
        file_name,
    })
}

/// Pull the filename out of a `Content-Disposition` header value.
fn disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename=") {
            let name = rest.trim_matches('"').trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}
