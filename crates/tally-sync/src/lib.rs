//! Offline-first submission and synchronization for Tally kiosks.
//!
//! The pieces, leaf first:
//!
//! - [`store`]: byte-accounted key/value persistence ([`MemoryStore`], [`FileStore`]).
//! - [`queue`]: the pending-write queue plus the resolved and failed ledgers.
//! - [`connectivity`]: online/offline state machine fed by a [`LinkProbe`].
//! - [`events`]: publish/subscribe bus used instead of ambient callbacks.
//! - [`remote`]: the HTTP API as seen from the device.
//! - [`engine`]: drains the queue against the server, one pass at a time.
//! - [`submit`]: per-submission send-or-enqueue decision.
//! - [`presence`]: register/heartbeat/unregister against the session registry.
//!
//! [`OfflineClient`] wires them together for a binary.

pub mod client;
pub mod connectivity;
pub mod engine;
pub mod events;
pub mod presence;
pub mod queue;
pub mod remote;
pub mod store;
pub mod submit;

pub use client::{ClientConfig, ClientError, OfflineClient};
pub use connectivity::{Connectivity, ConnectivityMonitor, LinkProbe, StaticLink};
pub use engine::{spawn_sync_worker, SyncConfig, SyncEngine, SyncOutcome, SyncReport};
pub use events::{EventBus, EventKind, SyncEvent, Unsubscribe};
pub use presence::{HeartbeatOutcome, Presence};
pub use queue::{Disposition, EnqueueOutcome, FailedRecord, PassOutcome, PendingQueue, QueueError};
pub use remote::{DeliveryError, HttpRemote, RemoteApi};
pub use store::{FileStore, LocalStore, MemoryStore, StorageError};
pub use submit::{SubmissionOutcome, SubmitError, Submitter};
