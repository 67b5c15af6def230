//! The periodic sync service and leader election loop.
//!
//! Every client instance starts one [`SyncService`]; exactly one of them
//! holds the leader lock and runs cycles on a timer, the rest poll for
//! leadership and report standby. Losing the leader (task aborted,
//! instance gone) releases the lock and a standby instance takes over on
//! its next poll.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::cycle::{CycleOutcome, Orchestrator};
use crate::error::Result;
use crate::locks::{NamedLocks, LEADER_LOCK};
use crate::status::{StatusPublisher, SyncPhase, SyncRole, SyncStatus};

enum Wake {
    Elapsed,
    IntervalChanged,
    Stopped,
}

pub struct SyncService {
    orchestrator: Arc<Orchestrator>,
    locks: NamedLocks,
    status: Arc<StatusPublisher>,
    interval_tx: watch::Sender<Duration>,
    stop_tx: watch::Sender<bool>,
    leader_poll: Duration,
}

impl SyncService {
    pub fn new(orchestrator: Arc<Orchestrator>, locks: NamedLocks, config: &SyncConfig) -> Self {
        let status = orchestrator.status();
        let (interval_tx, _) = watch::channel(config.interval);
        let (stop_tx, _) = watch::channel(false);
        Self {
            orchestrator,
            locks,
            status,
            interval_tx,
            stop_tx,
            leader_poll: config.leader_poll,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Change the cycle interval. A leading instance's pending sleep is
    /// woken so the new interval takes effect on the next tick.
    pub fn set_interval(&self, interval: Duration) {
        self.interval_tx.send_replace(interval);
    }

    /// Request the loop to stop. A cycle already in flight finishes
    /// inside its own critical section; only the loop exits.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Run one cycle immediately, regardless of leadership.
    pub async fn run_once(&self, full_scan: bool) -> Result<CycleOutcome> {
        self.orchestrator.run_cycle(full_scan).await
    }

    /// Spawn the election/cycle loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.stop_tx.send_replace(false);
        let service = self.clone();
        tokio::spawn(async move { service.run().await })
    }

    fn stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// The loop body. Public for callers that want to drive it on their
    /// own task.
    pub async fn run(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut interval_rx = self.interval_tx.subscribe();

        loop {
            if self.stopped() {
                break;
            }
            let led = self
                .locks
                .try_leader(LEADER_LOCK, || self.lead(&mut stop_rx, &mut interval_rx))
                .await;
            if led.is_some() {
                // Leadership ended (stop requested); fall through to the
                // loop head.
                continue;
            }

            debug!("leader lock held elsewhere, standing by");
            self.status.update(|s| {
                s.role = SyncRole::Standby;
                s.message = "another instance is active".to_string();
            });
            if let Wake::Stopped = self
                .sleep_interruptible(self.leader_poll, &mut stop_rx, &mut interval_rx)
                .await
            {
                break;
            }
        }

        info!("sync service stopped");
        self.status.update(|s| {
            s.phase = SyncPhase::Disabled;
            s.role = SyncRole::Unknown;
            s.message = "sync stopped".to_string();
            s.next_run = None;
        });
    }

    async fn lead(
        &self,
        stop_rx: &mut watch::Receiver<bool>,
        interval_rx: &mut watch::Receiver<Duration>,
    ) {
        info!("became sync leader");
        self.status.update(|s| s.role = SyncRole::Leader);

        'cycles: loop {
            if self.stopped() {
                break;
            }
            // Cycle errors land in the status stream; the loop itself
            // keeps ticking.
            let _ = self.orchestrator.run_cycle(false).await;

            loop {
                let interval = *interval_rx.borrow();
                let eta = chrono::Duration::from_std(interval)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                self.status.update(|s| s.next_run = Some(Utc::now() + eta));
                match self
                    .sleep_interruptible(interval, stop_rx, interval_rx)
                    .await
                {
                    Wake::Stopped => break 'cycles,
                    Wake::Elapsed => continue 'cycles,
                    // Re-sleep with the freshly configured interval.
                    Wake::IntervalChanged => continue,
                }
            }
        }
    }

    async fn sleep_interruptible(
        &self,
        duration: Duration,
        stop_rx: &mut watch::Receiver<bool>,
        interval_rx: &mut watch::Receiver<Duration>,
    ) -> Wake {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Wake::Elapsed,
            _ = stop_rx.changed() => Wake::Stopped,
            _ = interval_rx.changed() => Wake::IntervalChanged,
        }
    }
}
