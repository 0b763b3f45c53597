//! Drains the pending queue against the server.
//!
//! A pass works on a snapshot: it reads the queue once, decides every record, then hands the
//! decisions to [`PendingQueue::apply`], which persists once. Records enqueued while the pass is
//! in flight wait for the next trigger.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tally_core::{limits::MAX_SYNC_ATTEMPTS, RecordKind};
use tokio::{sync::Notify, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    connectivity::ConnectivityMonitor,
    events::{EventBus, SyncEvent},
    queue::{Disposition, PassOutcome, PendingQueue},
    remote::{DeliveryError, RemoteApi},
};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// A record whose attempt count would exceed this is failed instead of delivered.
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_SYNC_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed,
    /// Skipped because the monitor reported offline.
    Offline,
    /// Another pass was already running; nothing was done.
    Coalesced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub succeeded: usize,
    pub remaining: usize,
    /// Ids that exhausted their attempts or were refused as malformed during this pass.
    pub permanently_failed: Vec<String>,
}

impl SyncReport {
    fn idle(outcome: SyncOutcome, remaining: usize) -> Self {
        Self {
            outcome,
            succeeded: 0,
            remaining,
            permanently_failed: Vec::new(),
        }
    }
}

pub struct SyncEngine {
    queue: Arc<PendingQueue>,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<ConnectivityMonitor>,
    bus: EventBus,
    config: SyncConfig,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncEngine {
    pub fn new(
        queue: Arc<PendingQueue>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<ConnectivityMonitor>,
        bus: EventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue,
            remote,
            connectivity,
            bus,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    /// Runs one pass. A call that arrives while a pass is in flight returns
    /// [`SyncOutcome::Coalesced`] immediately and publishes nothing.
    pub async fn sync_now(&self) -> SyncReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sync already in flight; coalescing");
            return SyncReport::idle(SyncOutcome::Coalesced, self.queue.pending_len());
        }
        let _guard = RunningGuard(&self.running);

        if !self.connectivity.is_online() {
            let report = SyncReport::idle(SyncOutcome::Offline, self.queue.pending_len());
            debug!(remaining = report.remaining, "offline; sync skipped");
            self.bus.publish(SyncEvent::SyncCompleted(report.clone()));
            return report;
        }

        let snapshot = self.queue.dequeue_all_pending();
        let mut outcomes = Vec::with_capacity(snapshot.len());
        let mut succeeded = 0;
        let mut failed_ids = Vec::new();

        for record in &snapshot {
            let attempts = record.attempts.saturating_add(1);
            if attempts > self.config.max_attempts {
                warn!(id = %record.id, attempts, "retry limit exhausted");
                failed_ids.push(record.id.clone());
                outcomes.push(PassOutcome {
                    id: record.id.clone(),
                    attempts,
                    disposition: Disposition::Failed {
                        reason: format!("exceeded {} delivery attempts", self.config.max_attempts),
                    },
                });
                continue;
            }

            let disposition = match self.remote.deliver(record).await {
                Ok(()) => {
                    succeeded += 1;
                    Disposition::Resolved
                }
                Err(DeliveryError::Malformed { body }) => {
                    warn!(id = %record.id, %body, "server refused payload as malformed");
                    failed_ids.push(record.id.clone());
                    Disposition::Failed {
                        reason: format!("malformed payload: {body}"),
                    }
                }
                Err(DeliveryError::NotFound { .. })
                    if record.kind() == RecordKind::ConnectionEvent =>
                {
                    warn!(id = %record.id, "server no longer tracks this session; dropping event");
                    succeeded += 1;
                    Disposition::Resolved
                }
                Err(err) => {
                    debug!(id = %record.id, attempts, error = %err, "delivery failed; will retry");
                    Disposition::StillPending
                }
            };
            outcomes.push(PassOutcome {
                id: record.id.clone(),
                attempts,
                disposition,
            });
        }

        if let Err(err) = self.queue.apply(&outcomes) {
            error!(error = %err, "failed to persist sync results");
        }

        let report = SyncReport {
            outcome: SyncOutcome::Completed,
            succeeded,
            remaining: self.queue.pending_len(),
            permanently_failed: failed_ids,
        };
        info!(
            attempted = snapshot.len(),
            succeeded = report.succeeded,
            remaining = report.remaining,
            permanently_failed = report.permanently_failed.len(),
            "sync pass finished"
        );

        self.bus.publish(SyncEvent::SyncCompleted(report.clone()));
        report
    }
}

/// Runs [`SyncEngine::sync_now`] on every trigger signal and every `interval` tick.
pub fn spawn_sync_worker(
    engine: Arc<SyncEngine>,
    trigger: Arc<Notify>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = trigger.notified() => debug!("sync triggered by reconnect"),
                _ = ticker.tick() => {}
            }
            engine.sync_now().await;
        }
    })
}
