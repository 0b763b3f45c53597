use std::{sync::Arc, time::Instant};

use crate::{
    registry::{RegistryConfig, SessionRegistry},
    responses::{InMemoryResponses, ResponseStore, ResponseStoreHandle},
};

#[derive(Clone)]
pub struct AppState {
    start: Instant,
    registry: SessionRegistry,
    responses: ResponseStoreHandle,
}

impl AppState {
    pub fn new(registry: SessionRegistry, responses: ResponseStoreHandle) -> Self {
        Self {
            start: Instant::now(),
            registry,
            responses,
        }
    }

    /// Default registry limits and in-memory responses.
    pub fn in_memory() -> Self {
        Self::new(
            SessionRegistry::new(RegistryConfig::default()),
            Arc::new(InMemoryResponses::new()),
        )
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn responses(&self) -> &dyn ResponseStore {
        self.responses.as_ref()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }
}
