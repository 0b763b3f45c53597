use std::{path::PathBuf, sync::Arc, time::Duration};

use tally_core::limits::{
    DELIVERY_TIMEOUT, HEARTBEAT_INTERVAL, MAX_STORAGE_BYTES, MAX_SYNC_ATTEMPTS, SYNC_INTERVAL,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    connectivity::{ConnectivityMonitor, LinkProbe},
    engine::{spawn_sync_worker, SyncConfig, SyncEngine},
    events::EventBus,
    presence::Presence,
    queue::{PendingQueue, QueueError},
    remote::{HttpRemote, RemoteApi},
    store::{FileStore, LocalStore, MemoryStore, StorageError},
    submit::Submitter,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// `None` keeps everything in memory for the life of the process.
    pub data_dir: Option<PathBuf>,
    pub max_storage_bytes: u64,
    pub max_sync_attempts: u32,
    pub delivery_timeout: Duration,
    pub sync_interval: Duration,
    pub heartbeat_interval: Duration,
    pub link_poll_interval: Duration,
    pub device_info: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            data_dir: None,
            max_storage_bytes: MAX_STORAGE_BYTES,
            max_sync_attempts: MAX_SYNC_ATTEMPTS,
            delivery_timeout: DELIVERY_TIMEOUT,
            sync_interval: SYNC_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            link_poll_interval: Duration::from_secs(5),
            device_info: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to open local store: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to load pending queue: {0}")]
    Queue(#[from] QueueError),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Everything a kiosk needs, wired once.
pub struct OfflineClient {
    config: ClientConfig,
    bus: EventBus,
    queue: Arc<PendingQueue>,
    monitor: Arc<ConnectivityMonitor>,
    remote: Arc<dyn RemoteApi>,
    engine: Arc<SyncEngine>,
    submitter: Submitter,
    presence: Arc<Presence>,
}

impl OfflineClient {
    pub fn open(config: ClientConfig, probe: &dyn LinkProbe) -> Result<Self, ClientError> {
        let remote = Arc::new(HttpRemote::new(
            config.server_url.clone(),
            config.delivery_timeout,
        )?);
        Self::with_remote(config, probe, remote)
    }

    pub fn with_remote(
        config: ClientConfig,
        probe: &dyn LinkProbe,
        remote: Arc<dyn RemoteApi>,
    ) -> Result<Self, ClientError> {
        let store: Arc<dyn LocalStore> = match &config.data_dir {
            Some(dir) => Arc::new(FileStore::open(dir.clone(), config.max_storage_bytes)?),
            None => Arc::new(MemoryStore::new(config.max_storage_bytes)),
        };

        let bus = EventBus::new();
        let queue = Arc::new(PendingQueue::open(store, bus.clone())?);
        let monitor = Arc::new(ConnectivityMonitor::new(probe, bus.clone()));
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            remote.clone(),
            monitor.clone(),
            bus.clone(),
            SyncConfig {
                max_attempts: config.max_sync_attempts,
            },
        ));
        let submitter = Submitter::new(queue.clone(), remote.clone(), monitor.clone(), bus.clone());
        let presence = Arc::new(Presence::new(
            config.device_info.clone(),
            remote.clone(),
            monitor.clone(),
            queue.clone(),
        ));

        Ok(Self {
            config,
            bus,
            queue,
            monitor,
            remote,
            engine,
            submitter,
            presence,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn remote(&self) -> &Arc<dyn RemoteApi> {
        &self.remote
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn submitter(&self) -> &Submitter {
        &self.submitter
    }

    pub fn presence(&self) -> &Arc<Presence> {
        &self.presence
    }

    /// Starts the link poller, the sync worker and the heartbeat task.
    pub fn start(&self, probe: Arc<dyn LinkProbe>) -> Vec<JoinHandle<()>> {
        info!(
            server = %self.config.server_url,
            sync_interval = ?self.config.sync_interval,
            heartbeat_interval = ?self.config.heartbeat_interval,
            "starting background tasks"
        );
        vec![
            self.monitor
                .spawn_poller(probe, self.config.link_poll_interval),
            spawn_sync_worker(
                self.engine.clone(),
                self.monitor.sync_trigger(),
                self.config.sync_interval,
            ),
            self.presence.spawn_heartbeat(self.config.heartbeat_interval),
        ]
    }
}
