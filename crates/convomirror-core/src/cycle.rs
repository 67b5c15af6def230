//! One full synchronization pass and its state machine.
//!
//! A cycle moves `idle → checking → saving → idle`, or `→ error` on any
//! uncaught failure; errors are never sticky, the next cycle starts at
//! `checking` again. The whole checking+saving span runs inside the state
//! critical section, so even if two client instances both attempt a cycle,
//! their read-modify-write sequences against the shared state document
//! cannot interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::locks::{NamedLocks, STATE_LOCK};
use crate::remote::{CredentialProvider, RemoteApi};
use crate::scanner::Scanner;
use crate::scheduler::{fetch_all, CancelFlag, FetchOptions};
use crate::state::StateStore;
use crate::status::{StatusPublisher, SyncPhase};
use crate::store::LocalStore;
use crate::writer::Writer;

/// What one completed cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Stale conversations the scan turned up.
    pub stale: usize,
    /// How many of those were persisted and had their watermark advanced.
    pub persisted: usize,
    pub message: String,
}

/// Runs full synchronization passes against the collaborators.
pub struct Orchestrator {
    api: Arc<dyn RemoteApi>,
    store: Arc<dyn LocalStore>,
    credentials: Arc<dyn CredentialProvider>,
    locks: NamedLocks,
    config: SyncConfig,
    status: Arc<StatusPublisher>,
    cancel: CancelFlag,
    running: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        store: Arc<dyn LocalStore>,
        credentials: Arc<dyn CredentialProvider>,
        locks: NamedLocks,
        config: SyncConfig,
        status: Arc<StatusPublisher>,
    ) -> Self {
        Self {
            api,
            store,
            credentials,
            locks,
            config,
            status,
            cancel: CancelFlag::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn status(&self) -> Arc<StatusPublisher> {
        self.status.clone()
    }

    /// Run one pass. A trigger while a cycle is already in flight is a
    /// no-op; a client instance never runs two cycles concurrently.
    pub async fn run_cycle(&self, full_scan: bool) -> Result<CycleOutcome> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("cycle already in progress, ignoring trigger");
            return Ok(CycleOutcome {
                stale: 0,
                persisted: 0,
                message: "sync already in progress".to_string(),
            });
        }
        let result = self.run_guarded(full_scan).await;
        self.running.store(false, Ordering::SeqCst);

        match &result {
            Ok(outcome) => {
                info!("cycle finished: {}", outcome.message);
                self.status.update(|s| {
                    s.phase = SyncPhase::Idle;
                    s.message = outcome.message.clone();
                    s.last_run = Some(Utc::now());
                });
            }
            Err(SyncError::Cancelled) => {
                info!("cycle cancelled");
                self.status.update(|s| {
                    s.phase = SyncPhase::Idle;
                    s.message = "sync cancelled".to_string();
                });
            }
            Err(e) => {
                warn!("cycle failed: {e}");
                self.status.update(|s| {
                    s.phase = SyncPhase::Error;
                    s.message = e.to_string();
                    s.last_error = Some(e.to_string());
                });
            }
        }
        result
    }

    async fn run_guarded(&self, full_scan: bool) -> Result<CycleOutcome> {
        self.status.update(|s| {
            s.phase = SyncPhase::Checking;
            s.message = "checking for updates".to_string();
        });

        // Configuration and credential problems surface before any state
        // or listing I/O.
        self.credentials.ensure_ready().await?;
        let identity = self.credentials.identity().await?;
        self.store.verify_permission().await?;

        self.locks
            .run_exclusive(STATE_LOCK, || async {
                let state_store = StateStore::new(self.store.clone(), &identity.label);
                let mut state = state_store.load().await?;
                if state.account_id.is_none() {
                    state.account_id = Some(identity.account_id.clone());
                    state.account_label = Some(identity.label.clone());
                    state_store.save(&state).await?;
                }

                let scanner = Scanner::new(self.api.as_ref(), &self.config);
                let scan = scanner.scan(&state, &identity.account_id, full_scan).await;
                let stale = scan.tasks.len();

                if stale == 0 {
                    for scope in &scan.scopes {
                        state_store
                            .touch_scope(&scope.id, &scope.name, scope.newest)
                            .await?;
                    }
                    return Ok(CycleOutcome {
                        stale: 0,
                        persisted: 0,
                        message: "no new or updated conversations".to_string(),
                    });
                }

                self.status.update(|s| {
                    s.phase = SyncPhase::Saving;
                    s.message = format!("saving {stale} conversations");
                });

                let mut options = FetchOptions::from_config(&self.config, self.cancel.clone());
                let publisher = self.status.clone();
                options.progress = Some(Arc::new(move |_pct, text| {
                    publisher.update(|s| s.message = text.clone());
                }));
                let fetched = fetch_all(self.api.clone(), scan.tasks.clone(), options).await?;

                let writer = Writer::new(self.store.as_ref(), self.api.as_ref(), &self.cancel);
                let mut persisted = 0usize;
                for (task, conversation) in scan.tasks.iter().zip(&fetched) {
                    match writer
                        .persist(
                            &identity.label,
                            &self.config.workspace_label,
                            &task.category,
                            conversation,
                        )
                        .await
                    {
                        Ok(_report) => {
                            // The record must cover every remote watermark
                            // observed for this entity, listing and body
                            // alike.
                            let watermark = task.updated_at.max(conversation.updated_at);
                            state_store
                                .update_entity(
                                    &conversation.id,
                                    watermark,
                                    Utc::now(),
                                    Some(&identity.account_id),
                                    task.project_id.as_deref(),
                                )
                                .await?;
                            persisted += 1;
                        }
                        Err(e) if e.is_storage() => return Err(e),
                        Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                        Err(e) => {
                            // Watermark stays put; the next pass retries
                            // this conversation.
                            warn!(id = %conversation.id, "persist failed, will retry next cycle: {e}");
                        }
                    }
                }

                for scope in &scan.scopes {
                    state_store
                        .touch_scope(&scope.id, &scope.name, scope.newest)
                        .await?;
                }

                Ok(CycleOutcome {
                    stale,
                    persisted,
                    message: format!("saved {persisted} of {stale} conversations"),
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SyncState;
    use crate::store::{LocalStore, MemoryStore};
    use crate::testutil::{conversation, summary, ts, MockCredentials, MockRemote};
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    fn orchestrator(
        remote: Arc<MockRemote>,
        store: Arc<dyn LocalStore>,
        locks: NamedLocks,
    ) -> Orchestrator {
        Orchestrator::new(
            remote,
            store,
            Arc::new(MockCredentials::new()),
            locks,
            SyncConfig {
                retry_base_backoff: Duration::from_millis(1),
                ..SyncConfig::default()
            },
            Arc::new(StatusPublisher::new()),
        )
    }

    async fn load_state(store: &Arc<MemoryStore>) -> SyncState {
        let state_store = StateStore::new(store.clone() as Arc<dyn LocalStore>, "alice@example.com");
        state_store.load().await.expect("load")
    }

    #[tokio::test]
    async fn incremental_pass_updates_stale_watermark() {
        let remote = Arc::new(MockRemote::new());
        remote.set_personal(vec![summary("conv-1", 150, None)]);
        remote.add_conversation(conversation("conv-1", 150));
        let store = Arc::new(MemoryStore::new());

        // Seed the state: conv-1 known at watermark 100.
        let state_store = StateStore::new(store.clone() as Arc<dyn LocalStore>, "alice@example.com");
        state_store
            .update_entity("conv-1", ts(100), ts(100), Some("acct-1"), None)
            .await
            .expect("seed");

        let orchestrator = orchestrator(remote.clone(), store.clone(), NamedLocks::new());
        let outcome = orchestrator.run_cycle(false).await.expect("cycle");
        assert_eq!(outcome.stale, 1);
        assert_eq!(outcome.persisted, 1);

        let state = load_state(&store).await;
        assert_eq!(state.conversations["conv-1"].updated_at, ts(150));
        assert!(store
            .file_exists(
                Path::new("alice@example.com/workspace/chats/conv-1"),
                "conversation.json"
            )
            .await
            .expect("exists"));

        // Second cycle with no remote change: nothing fetched.
        let before = remote.fetch_calls.load(std::sync::atomic::Ordering::SeqCst);
        let outcome = orchestrator.run_cycle(false).await.expect("cycle");
        assert_eq!(outcome.stale, 0);
        assert_eq!(
            remote.fetch_calls.load(std::sync::atomic::Ordering::SeqCst),
            before
        );
    }

    #[tokio::test]
    async fn watermark_covers_listing_and_body() {
        let remote = Arc::new(MockRemote::new());
        // Listing reports 150 while the fetched body says 140.
        remote.set_personal(vec![summary("conv-1", 150, None)]);
        remote.add_conversation(conversation("conv-1", 140));
        let store = Arc::new(MemoryStore::new());

        let orchestrator = orchestrator(remote, store.clone(), NamedLocks::new());
        orchestrator.run_cycle(false).await.expect("cycle");

        let state = load_state(&store).await;
        assert_eq!(state.conversations["conv-1"].updated_at, ts(150));
    }

    #[tokio::test]
    async fn current_entities_are_never_refetched() {
        let remote = Arc::new(MockRemote::new());
        remote.set_personal(vec![summary("conv-1", 150, None)]);
        let store = Arc::new(MemoryStore::new());

        let state_store = StateStore::new(store.clone() as Arc<dyn LocalStore>, "alice@example.com");
        state_store
            .update_entity("conv-1", ts(200), ts(200), Some("acct-1"), None)
            .await
            .expect("seed");

        let orchestrator = orchestrator(remote.clone(), store.clone(), NamedLocks::new());
        let outcome = orchestrator.run_cycle(false).await.expect("cycle");
        assert_eq!(outcome.stale, 0);
        assert_eq!(
            remote.fetch_calls.load(std::sync::atomic::Ordering::SeqCst),
            0
        );

        // Monotonic: the recorded watermark did not move backwards.
        let state = load_state(&store).await;
        assert_eq!(state.conversations["conv-1"].updated_at, ts(200));
    }

    #[tokio::test]
    async fn no_op_cycle_touches_scope_check_times() {
        let remote = Arc::new(MockRemote::new());
        let store = Arc::new(MemoryStore::new());

        let orchestrator = orchestrator(remote, store.clone(), NamedLocks::new());
        orchestrator.run_cycle(false).await.expect("cycle");

        let state = load_state(&store).await;
        let scope = &state.scopes["workspace:acct-1"];
        assert!(scope.last_check.is_some());
        assert_eq!(scope.name, "chats");
    }

    #[tokio::test]
    async fn concurrent_cycles_do_not_lose_updates() {
        let remote = Arc::new(MockRemote::new());
        remote.set_personal(vec![
            summary("conv-1", 100, None),
            summary("conv-2", 200, None),
        ]);
        remote.add_conversation(conversation("conv-1", 100));
        remote.add_conversation(conversation("conv-2", 200));
        let store = Arc::new(MemoryStore::new());
        let locks = NamedLocks::new();

        // Two client instances racing the same pass; the critical section
        // must serialize their read-modify-write sequences.
        let a = orchestrator(remote.clone(), store.clone(), locks.clone());
        let b = orchestrator(remote.clone(), store.clone(), locks.clone());
        let (ra, rb) = tokio::join!(a.run_cycle(false), b.run_cycle(false));
        ra.expect("cycle a");
        rb.expect("cycle b");

        let state = load_state(&store).await;
        assert_eq!(state.conversations.len(), 2);
        assert_eq!(state.conversations["conv-1"].updated_at, ts(100));
        assert_eq!(state.conversations["conv-2"].updated_at, ts(200));
        // The loser of the race observed fresh watermarks and fetched
        // nothing, same as running the cycles sequentially.
        assert_eq!(
            remote.fetch_calls.load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }

    #[tokio::test]
    async fn trigger_during_running_cycle_is_a_no_op() {
        let remote = Arc::new(MockRemote::new());
        remote.set_personal(vec![summary("conv-1", 100, None)]);
        remote.add_conversation(conversation("conv-1", 100));
        *remote.fetch_delay.lock().expect("lock") = Some(Duration::from_millis(50));
        let store = Arc::new(MemoryStore::new());

        let orchestrator = Arc::new(orchestrator(remote, store, NamedLocks::new()));
        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run_cycle(false).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = orchestrator.run_cycle(false).await.expect("no-op");
        assert_eq!(second.message, "sync already in progress");
        assert_eq!(second.persisted, 0);

        let first = first.await.expect("join").expect("cycle");
        assert_eq!(first.persisted, 1);
    }

    #[tokio::test]
    async fn fetch_exhaustion_leaves_error_status_and_recovers() {
        let remote = Arc::new(MockRemote::new());
        remote.set_personal(vec![summary("conv-1", 100, None)]);
        remote.add_conversation(conversation("conv-1", 100));
        remote.fail_fetch("conv-1", usize::MAX);
        let store = Arc::new(MemoryStore::new());

        let orchestrator = orchestrator(remote.clone(), store.clone(), NamedLocks::new());
        orchestrator.run_cycle(false).await.expect_err("must fail");
        assert_eq!(orchestrator.status().current().phase, SyncPhase::Error);

        // Watermark was not advanced for the unfetched conversation.
        let state = load_state(&store).await;
        assert!(state.conversations.is_empty());

        // Errors are not sticky: the remote recovers, the next cycle runs.
        remote.fetch_failures.lock().expect("lock").clear();
        let outcome = orchestrator.run_cycle(false).await.expect("recovered");
        assert_eq!(outcome.persisted, 1);
        assert_eq!(orchestrator.status().current().phase, SyncPhase::Idle);
    }

    /// Store whose conversation writes always fail, for the storage-fatal
    /// path.
    struct BrokenStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl LocalStore for BrokenStore {
        async fn verify_permission(&self) -> crate::error::Result<()> {
            self.inner.verify_permission().await
        }
        async fn ensure_dir(&self, dir: &Path) -> crate::error::Result<()> {
            self.inner.ensure_dir(dir).await
        }
        async fn write_file(
            &self,
            dir: &Path,
            name: &str,
            bytes: &[u8],
        ) -> crate::error::Result<()> {
            if name == crate::writer::CONVERSATION_FILE {
                return Err(SyncError::Storage("disk full".to_string()));
            }
            self.inner.write_file(dir, name, bytes).await
        }
        async fn read_file(&self, dir: &Path, name: &str) -> crate::error::Result<Option<Vec<u8>>> {
            self.inner.read_file(dir, name).await
        }
        async fn file_exists(&self, dir: &Path, name: &str) -> crate::error::Result<bool> {
            self.inner.file_exists(dir, name).await
        }
        async fn list_files(&self, dir: &Path) -> crate::error::Result<Vec<String>> {
            self.inner.list_files(dir).await
        }
    }

    #[tokio::test]
    async fn storage_failure_aborts_cycle_without_advancing_watermark() {
        let remote = Arc::new(MockRemote::new());
        remote.set_personal(vec![summary("conv-1", 100, None)]);
        remote.add_conversation(conversation("conv-1", 100));
        let store = Arc::new(BrokenStore {
            inner: MemoryStore::new(),
        });

        let orchestrator = orchestrator(remote, store.clone(), NamedLocks::new());
        let err = orchestrator.run_cycle(false).await.expect_err("storage");
        assert!(err.is_storage());
        assert_eq!(orchestrator.status().current().phase, SyncPhase::Error);

        let state_store =
            StateStore::new(store as Arc<dyn LocalStore>, "alice@example.com");
        let state = state_store.load().await.expect("load");
        assert!(state.conversations.is_empty());
    }
}
