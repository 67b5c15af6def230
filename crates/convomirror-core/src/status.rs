//! Observer surface: a single state-change notification stream.
//!
//! The presentation layer (or a test) subscribes to the watch channel and
//! receives the latest [`SyncStatus`] after every transition. The engine
//! never talks to a UI directly.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// Where the engine currently is in its cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Checking,
    Saving,
    Error,
    Disabled,
}

/// This instance's position in leader election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRole {
    Leader,
    Standby,
    Unknown,
}

/// Snapshot published to observers on every state change.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub message: String,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub role: SyncRole,
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            message: String::new(),
            last_run: None,
            next_run: None,
            role: SyncRole::Unknown,
            last_error: None,
        }
    }
}

/// Publisher half of the status stream.
pub struct StatusPublisher {
    tx: watch::Sender<SyncStatus>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncStatus::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// Mutate the current status in place and notify observers.
    pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.tx.send_modify(f);
    }
}
