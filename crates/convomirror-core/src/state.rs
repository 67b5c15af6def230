//! Durable sync bookkeeping, one JSON document per identity.
//!
//! The document is the only piece of state shared between client
//! instances, so every read-modify-write of it must happen inside the
//! named critical section (see [`crate::locks::NamedLocks`]). The
//! convenience mutators here re-read the latest document themselves
//! instead of trusting a cached copy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::store::LocalStore;
use crate::types::ScopeId;

/// File name of the state document inside the identity folder.
pub const STATE_FILE: &str = "autosave_state.json";

/// Per-conversation bookkeeping record.
///
/// A record exists if and only if the conversation has been durably
/// persisted at least once; `updated_at` never exceeds the watermark of
/// the data actually on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Remote mutation watermark confirmed as persisted.
    pub updated_at: DateTime<Utc>,
    /// When the local write happened.
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

/// Per-scope bookkeeping record. Scopes accumulate; stale ones are
/// harmless and never deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeState {
    #[serde(default)]
    pub name: String,
    /// When this scope was last fully paginated.
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    /// Newest remote update time observed in this scope's listing,
    /// tracked per scope so project scopes watermark independently of the
    /// personal one.
    #[serde(default)]
    pub watermark: Option<DateTime<Utc>>,
}

/// The state document. Older-shaped documents deserialize with missing
/// substructures backfilled empty rather than failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub account_label: Option<String>,
    #[serde(default)]
    pub scopes: HashMap<String, ScopeState>,
    #[serde(default)]
    pub conversations: HashMap<String, EntityRecord>,
}

impl SyncState {
    /// Whether a remote watermark makes the conversation stale: no local
    /// record, or the remote watermark is strictly newer.
    pub fn is_stale(&self, id: &str, remote_updated_at: DateTime<Utc>) -> bool {
        match self.conversations.get(id) {
            Some(record) => remote_updated_at > record.updated_at,
            None => true,
        }
    }
}

/// Loads and saves the state document for one identity.
pub struct StateStore {
    store: Arc<dyn LocalStore>,
    dir: PathBuf,
}

impl StateStore {
    pub fn new(store: Arc<dyn LocalStore>, identity_label: &str) -> Self {
        Self {
            store,
            dir: PathBuf::from(identity_label),
        }
    }

    /// Read the current document. A missing file is normal and yields a
    /// fresh empty state; any other read or parse failure surfaces.
    pub async fn load(&self) -> Result<SyncState> {
        match self.store.read_file(&self.dir, STATE_FILE).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => {
                debug!("no state document yet, starting fresh");
                Ok(SyncState::default())
            }
        }
    }

    /// Overwrite the persisted document. Callers must hold the state
    /// critical section.
    pub async fn save(&self, state: &SyncState) -> Result<()> {
        self.store.ensure_dir(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(state)?;
        self.store.write_file(&self.dir, STATE_FILE, &bytes).await
    }

    /// Record a conversation as durably persisted at `updated_at`.
    /// Re-reads the latest document; callers must hold the critical
    /// section.
    pub async fn update_entity(
        &self,
        id: &str,
        updated_at: DateTime<Utc>,
        saved_at: DateTime<Utc>,
        workspace_id: Option<&str>,
        project_id: Option<&str>,
    ) -> Result<()> {
        let mut state = self.load().await?;
        state.conversations.insert(
            id.to_string(),
            EntityRecord {
                updated_at,
                saved_at,
                workspace_id: workspace_id.map(str::to_string),
                project_id: project_id.map(str::to_string),
            },
        );
        self.save(&state).await
    }

    /// Stamp a scope's last full pagination time, creating the scope
    /// record lazily on first observation. The scope watermark only ever
    /// moves forward.
    pub async fn touch_scope(
        &self,
        scope: &ScopeId,
        name: &str,
        newest: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.load().await?;
        let entry = state.scopes.entry(scope.state_key()).or_default();
        entry.name = name.to_string();
        entry.last_check = Some(Utc::now());
        entry.watermark = match (entry.watermark, newest) {
            (Some(current), Some(newest)) => Some(current.max(newest)),
            (current, newest) => newest.or(current),
        };
        self.save(&state).await
    }
}
