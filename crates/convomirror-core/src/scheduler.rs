//! Bounded-concurrency conversation fetching with retry and fail-fast.
//!
//! Workers claim task indices off a shared atomic counter, so completion
//! order is whatever the network gives us, but the result vector always
//! matches the input order. The first task to exhaust its retries aborts
//! the whole batch: a systemic failure (expired credentials, an outage)
//! will hit every remaining task too, and burning time and rate limits on
//! doomed fetches is wasted work.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::remote::RemoteApi;
use crate::scanner::StaleTask;
use crate::types::Conversation;

/// Cooperative cancellation flag, checked at task-claim boundaries.
/// In-flight network calls are never forcibly aborted.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress callback: `(percent_complete, human_text)`.
pub type ProgressFn = Arc<dyn Fn(u8, String) + Send + Sync>;

pub struct FetchOptions {
    pub concurrency: usize,
    /// Extra attempts after the first failure.
    pub retry_attempts: u32,
    pub retry_base_backoff: Duration,
    pub progress: Option<ProgressFn>,
    /// Percent span this batch occupies in the caller's progress bar.
    pub progress_weight: u8,
    pub progress_offset: u8,
    pub cancel: CancelFlag,
}

impl FetchOptions {
    pub fn from_config(config: &SyncConfig, cancel: CancelFlag) -> Self {
        Self {
            concurrency: config.concurrency,
            retry_attempts: config.retry_attempts,
            retry_base_backoff: config.retry_base_backoff,
            progress: None,
            progress_weight: 100,
            progress_offset: 0,
            cancel,
        }
    }
}

/// Fetch every task's full conversation body, one result per task in
/// input order.
pub async fn fetch_all(
    api: Arc<dyn RemoteApi>,
    tasks: Vec<StaleTask>,
    options: FetchOptions,
) -> Result<Vec<Conversation>> {
    let total = tasks.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let tasks = Arc::new(tasks);
    let next = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let abort = Arc::new(AtomicBool::new(false));
    let first_error: Arc<Mutex<Option<SyncError>>> = Arc::new(Mutex::new(None));
    let results: Arc<Mutex<Vec<Option<Conversation>>>> =
        Arc::new(Mutex::new((0..total).map(|_| None).collect()));
    let options = Arc::new(options);

    let workers = options.concurrency.max(1).min(total);
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        if options.cancel.is_cancelled() {
            break;
        }
        let api = api.clone();
        let tasks = tasks.clone();
        let next = next.clone();
        let completed = completed.clone();
        let abort = abort.clone();
        let first_error = first_error.clone();
        let results = results.clone();
        let options = options.clone();

        handles.push(tokio::spawn(async move {
            loop {
                if abort.load(Ordering::SeqCst) || options.cancel.is_cancelled() {
                    break;
                }
                let index = next.fetch_add(1, Ordering::SeqCst);
                if index >= total {
                    break;
                }
                let task = &tasks[index];
                match fetch_with_retry(api.as_ref(), task, &options).await {
                    Ok(conversation) => {
                        results.lock().expect("results lock")[index] = Some(conversation);
                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        if let Some(progress) = &options.progress {
                            let percent = ((done as f64 / total as f64)
                                * f64::from(options.progress_weight))
                            .round() as u8
                                + options.progress_offset;
                            progress(percent, format!("Fetched \"{}\" ({done}/{total})", task.title));
                        }
                    }
                    Err(e) => {
                        // First exhausted task wins; everyone stops
                        // claiming.
                        abort.store(true, Ordering::SeqCst);
                        let mut slot = first_error.lock().expect("error lock");
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        break;
                    }
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    if let Some(error) = first_error.lock().expect("error lock").take() {
        return Err(error);
    }
    if options.cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    let results = Arc::try_unwrap(results)
        .map_err(|_| SyncError::Remote("fetch workers still running".to_string()))?
        .into_inner()
        .expect("results lock");
    results
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            slot.ok_or_else(|| SyncError::Remote(format!("task {i} was never completed")))
        })
        .collect()
}

async fn fetch_with_retry(
    api: &dyn RemoteApi,
    task: &StaleTask,
    options: &FetchOptions,
) -> Result<Conversation> {
    let mut attempt = 0u32;
    loop {
        match api
            .fetch_conversation(&task.conversation_id, task.project_id.as_deref())
            .await
        {
            Ok(conversation) => {
                debug!(id = %task.conversation_id, "fetched conversation");
                return Ok(conversation);
            }
            Err(e) if attempt < options.retry_attempts => {
                let backoff = options.retry_base_backoff * 2u32.pow(attempt);
                warn!(
                    id = %task.conversation_id,
                    attempt = attempt + 1,
                    "fetch failed, retrying in {backoff:?}: {e}"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
