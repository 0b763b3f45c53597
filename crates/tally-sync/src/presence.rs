//! Client half of the active-session registry.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use parking_lot::Mutex;
use tally_core::{ConnectionEvent, PendingRecord, RecordPayload};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    connectivity::ConnectivityMonitor,
    queue::{PendingQueue, QueueError},
    remote::{DeliveryError, RemoteApi},
};

const CONNECTION_ID_PREFIX: &str = "connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Sent,
    SkippedOffline,
    /// The server had forgotten the session; it was registered again.
    Reregistered,
    Failed,
}

pub struct Presence {
    session_id: String,
    device_info: Option<String>,
    section: Mutex<Option<String>>,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<ConnectivityMonitor>,
    queue: Arc<PendingQueue>,
}

impl Presence {
    pub fn new(
        device_info: Option<String>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<ConnectivityMonitor>,
        queue: Arc<PendingQueue>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            device_info,
            section: Mutex::new(None),
            remote,
            connectivity,
            queue,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn section(&self) -> Option<String> {
        self.section.lock().clone()
    }

    /// Returns true when the server acknowledged; false when the event was queued instead.
    pub async fn register(&self) -> Result<bool, QueueError> {
        let event = self.register_event();
        self.send_or_queue(event).await
    }

    /// Pings the server so the session stays "active". Heartbeats are never queued: a stale
    /// one carries no information.
    pub async fn heartbeat(&self) -> HeartbeatOutcome {
        if !self.connectivity.is_online() {
            return HeartbeatOutcome::SkippedOffline;
        }

        let event =
            ConnectionEvent::update_activity(self.session_id.as_str(), self.section(), Utc::now());
        match self.remote.send_connection(&event).await {
            Ok(()) => HeartbeatOutcome::Sent,
            Err(DeliveryError::NotFound { .. }) => {
                info!(session_id = %self.session_id, "session unknown to server; registering again");
                match self.remote.send_connection(&self.register_event()).await {
                    Ok(()) => HeartbeatOutcome::Reregistered,
                    Err(err) => {
                        warn!(error = %err, "re-registration failed");
                        HeartbeatOutcome::Failed
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, "heartbeat failed");
                HeartbeatOutcome::Failed
            }
        }
    }

    /// Records the kiosk's current section and pushes it with an immediate heartbeat.
    pub async fn set_section(&self, section: Option<String>) -> HeartbeatOutcome {
        *self.section.lock() = section;
        self.heartbeat().await
    }

    pub async fn unregister(&self) -> Result<bool, QueueError> {
        let event = ConnectionEvent::unregister(self.session_id.as_str());
        self.send_or_queue(event).await
    }

    /// Heartbeats every `interval`; the first one fires after one full interval.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let presence = Arc::clone(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let outcome = presence.heartbeat().await;
                debug!(?outcome, "heartbeat");
            }
        })
    }

    fn register_event(&self) -> ConnectionEvent {
        ConnectionEvent::register(self.session_id.as_str(), self.device_info.clone())
            .with_section(self.section())
    }

    async fn send_or_queue(&self, event: ConnectionEvent) -> Result<bool, QueueError> {
        if self.connectivity.is_online() {
            match self.remote.send_connection(&event).await {
                Ok(()) => return Ok(true),
                Err(err) => {
                    warn!(action = event.action.as_str(), error = %err, "connection event not delivered; queueing")
                }
            }
        }

        let id = self.queue.fresh_id(CONNECTION_ID_PREFIX);
        let record = PendingRecord::new(id, RecordPayload::ConnectionEvent(event), Utc::now());
        self.queue.enqueue(record)?;
        Ok(false)
    }
}
