//! Named exclusive locks and leader election.
//!
//! Every client instance sharing a mirror root must share one
//! [`NamedLocks`] value (the handle is cheap to clone). Two locks are in
//! play during normal operation: the state critical-section lock, taken
//! around every read-modify-write of the sync state, and the leader lock,
//! held for as long as one instance runs the periodic loop. Dropping the
//! holding task — including by panic or abort — releases the lock, which is
//! what lets a surviving instance take over.
//!
//! On a deployment with a single instance per mirror root, a fresh
//! registry makes that instance the leader on the first attempt; the
//! interface is satisfied without a degraded, unsynchronized mode.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as AsyncMutex;

/// Lock guarding every read-modify-write of the sync state document.
pub const STATE_LOCK: &str = "convomirror.state";

/// Lock held by the instance running the periodic sync loop.
pub const LEADER_LOCK: &str = "convomirror.leader";

/// Process-wide registry of named exclusive locks.
#[derive(Clone, Default)]
pub struct NamedLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().expect("lock registry poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Run `f` inside the named exclusive section. Callers queue; the
    /// result or error of `f` propagates unchanged.
    pub async fn run_exclusive<F, Fut, T>(&self, name: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.entry(name);
        let _guard = lock.lock_owned().await;
        f().await
    }

    /// Try to become the holder of the named lock without blocking.
    ///
    /// Returns `None` immediately when the lock is held elsewhere.
    /// Otherwise runs `f` (typically a long-lived loop) while holding the
    /// lock and returns its output.
    pub async fn try_leader<F, Fut, T>(&self, name: &str, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.entry(name);
        let guard = match lock.try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => return None,
        };
        let out = f().await;
        drop(guard);
        Some(out)
    }
}
