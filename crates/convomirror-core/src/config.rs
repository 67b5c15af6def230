//! Tuning knobs for the sync engine.

use std::time::Duration;

/// Configuration for the sync service and one cycle's sub-components.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long the leader sleeps between cycles.
    pub interval: Duration,
    /// How often a standby instance re-attempts leadership.
    pub leader_poll: Duration,
    /// Listing page size for every scope.
    pub page_size: usize,
    /// Maximum concurrent conversation fetches.
    pub concurrency: usize,
    /// Extra fetch attempts per conversation after the first failure.
    pub retry_attempts: u32,
    /// Base delay of the exponential retry backoff.
    pub retry_base_backoff: Duration,
    /// Folder name of the workspace partition under the identity folder.
    pub workspace_label: String,
    /// Destination category for conversations that belong to no project.
    pub personal_label: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            leader_poll: Duration::from_secs(10),
            page_size: 25,
            concurrency: 3,
            retry_attempts: 2,
            retry_base_backoff: Duration::from_secs(1),
            workspace_label: "workspace".to_string(),
            personal_label: "chats".to_string(),
        }
    }
}
