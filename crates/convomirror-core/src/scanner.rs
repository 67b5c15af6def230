//! Change detection: pagination plus watermark comparison.
//!
//! Each scope's listing is paged strictly in the order the remote returns
//! it, which is assumed to be reverse-chronological by update time. The
//! incremental early-exit rule below depends on that assumption: if a page
//! contains nothing stale, no older page can either. Should the remote
//! ever return unsorted pages this under-scans; a full scan
//! (`full_scan = true`) visits every page once and is the corrective.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::remote::RemoteApi;
use crate::state::SyncState;
use crate::types::{ConversationSummary, ScopeId};

/// Unit of work handed to the fetch scheduler: one stale conversation and
/// where its mirror copy belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleTask {
    pub conversation_id: String,
    pub project_id: Option<String>,
    pub title: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Destination category folder. Owned by the item (its project name if
    /// it has one), not by the endpoint that listed it.
    pub category: String,
}

/// One scanned scope: identity, display name and the newest remote
/// update time its listing showed this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedScope {
    pub id: ScopeId,
    pub name: String,
    pub newest: Option<chrono::DateTime<chrono::Utc>>,
}

/// What one scan pass learned.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub tasks: Vec<StaleTask>,
    /// Every scope scanned this pass, for `last_check` and scope
    /// watermark stamping. Personal/workspace first, then projects in
    /// discovery order.
    pub scopes: Vec<ScannedScope>,
}

/// Pages through every scope and classifies items as stale or current.
pub struct Scanner<'a> {
    api: &'a dyn RemoteApi,
    config: &'a SyncConfig,
}

impl<'a> Scanner<'a> {
    pub fn new(api: &'a dyn RemoteApi, config: &'a SyncConfig) -> Self {
        Self { api, config }
    }

    /// Scan all scopes. Network failures on a page end that scope's scan
    /// for this pass (nothing more learned) without failing the others.
    pub async fn scan(
        &self,
        state: &SyncState,
        workspace_id: &str,
        full_scan: bool,
    ) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let mut seen: HashSet<String> = HashSet::new();

        let personal = ScopeId::Workspace(workspace_id.to_string());
        let newest = self
            .scan_scope(state, full_scan, &personal, None, &mut outcome, &mut seen)
            .await;
        outcome.scopes.push(ScannedScope {
            id: personal,
            name: self.config.personal_label.clone(),
            newest,
        });

        // Project directory, in discovery order.
        let mut cursor: Option<String> = None;
        loop {
            let page = match self.api.list_projects(cursor.as_deref()).await {
                Ok(page) => page,
                Err(e) => {
                    warn!("project directory listing failed, skipping rest: {e}");
                    break;
                }
            };
            for project in page.items {
                let scope = ScopeId::Project(project.id.clone());
                let newest = self
                    .scan_scope(
                        state,
                        full_scan,
                        &scope,
                        Some(&project),
                        &mut outcome,
                        &mut seen,
                    )
                    .await;
                outcome.scopes.push(ScannedScope {
                    id: scope,
                    name: project.name.clone(),
                    newest,
                });
            }
            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }

        debug!(
            stale = outcome.tasks.len(),
            scopes = outcome.scopes.len(),
            "scan complete"
        );
        outcome
    }

    async fn scan_scope(
        &self,
        state: &SyncState,
        full_scan: bool,
        scope: &ScopeId,
        project: Option<&crate::types::ProjectStub>,
        outcome: &mut ScanOutcome,
        seen: &mut HashSet<String>,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        let limit = self.config.page_size;
        let mut offset = 0usize;
        let mut consumed = 0usize;
        let mut newest = None;

        loop {
            let page = match scope {
                ScopeId::Workspace(_) => self.api.list_personal(offset, limit).await,
                ScopeId::Project(id) => self.api.list_project(id, offset, limit).await,
            };
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    warn!(scope = %scope.state_key(), "listing page failed, stopping scope for this cycle: {e}");
                    return newest;
                }
            };

            let mut stale_in_page = 0usize;
            for item in &page.items {
                newest = Some(match newest {
                    Some(current) if current >= item.updated_at => current,
                    _ => item.updated_at,
                });
                if state.is_stale(&item.id, item.updated_at) {
                    stale_in_page += 1;
                    if seen.insert(item.id.clone()) {
                        outcome.tasks.push(self.task_for(item, project));
                    }
                }
            }

            consumed += page.items.len();
            if page.items.is_empty() || page.items.len() < limit {
                break;
            }
            if let Some(total) = page.total {
                if consumed as u64 >= total {
                    break;
                }
            }
            // Early exit: a fully clean page means older pages hold
            // nothing newer.
            if !full_scan && stale_in_page == 0 {
                break;
            }
            offset += limit;
        }
        newest
    }

    fn task_for(
        &self,
        item: &ConversationSummary,
        scope_project: Option<&crate::types::ProjectStub>,
    ) -> StaleTask {
        // The item's own project wins; a project-listing item without an
        // inline stub inherits the scope's project.
        let project = item.project.as_ref().or(scope_project);
        StaleTask {
            conversation_id: item.id.clone(),
            project_id: project.map(|p| p.id.clone()),
            title: item.title.clone(),
            updated_at: item.updated_at,
            category: project
                .map(|p| p.name.clone())
                .unwrap_or_else(|| self.config.personal_label.clone()),
        }
    }
}
