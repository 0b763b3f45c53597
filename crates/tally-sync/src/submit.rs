use std::sync::Arc;

use chrono::Utc;
use tally_core::{FormData, FormResponse, PendingRecord, RecordPayload};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    connectivity::ConnectivityMonitor,
    events::{EventBus, SyncEvent},
    queue::{EnqueueOutcome, PendingQueue, QueueError},
    remote::RemoteApi,
};

const RESPONSE_ID_PREFIX: &str = "response";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Delivered { id: String },
    /// Saved on the device; the sync engine will deliver it.
    QueuedOffline { id: String },
}

impl SubmissionOutcome {
    pub fn id(&self) -> &str {
        match self {
            SubmissionOutcome::Delivered { id } | SubmissionOutcome::QueuedOffline { id } => id,
        }
    }
}

/// Only local persistence failures surface here; network trouble always degrades to a queued
/// submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("response could not be saved on this device: {0}")]
    Persist(#[from] QueueError),
}

pub struct Submitter {
    queue: Arc<PendingQueue>,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<ConnectivityMonitor>,
    bus: EventBus,
}

impl Submitter {
    pub fn new(
        queue: Arc<PendingQueue>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<ConnectivityMonitor>,
        bus: EventBus,
    ) -> Self {
        Self {
            queue,
            remote,
            connectivity,
            bus,
        }
    }

    /// Stamps `form` and either delivers it or writes it to the queue before returning.
    pub async fn submit(&self, form: FormData) -> Result<SubmissionOutcome, SubmitError> {
        let id = self.queue.fresh_id(RESPONSE_ID_PREFIX);
        let now = Utc::now();
        let response = FormResponse::stamp(id.clone(), form, now);

        if self.connectivity.is_online() {
            match self.remote.send_response(&response).await {
                Ok(()) => {
                    let record = PendingRecord::new(
                        id.clone(),
                        RecordPayload::FormResponse(response),
                        now,
                    );
                    self.queue.record_delivered(record);
                    info!(%id, "response delivered");
                    return Ok(SubmissionOutcome::Delivered { id });
                }
                Err(err) => {
                    warn!(%id, error = %err, "direct delivery failed; queueing response");
                }
            }
        }

        let record = PendingRecord::new(id.clone(), RecordPayload::FormResponse(response), now);
        if self.queue.enqueue(record)? == EnqueueOutcome::Queued {
            self.bus
                .publish(SyncEvent::SubmissionQueued { id: id.clone() });
        }
        info!(%id, "response saved for later sync");
        Ok(SubmissionOutcome::QueuedOffline { id })
    }
}
