use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::Notify, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::events::{EventBus, SyncEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn from_link(up: bool) -> Self {
        if up {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }
}

/// The platform's reachability signal. Reflects link state, not whether the server answers.
pub trait LinkProbe: Send + Sync {
    fn link_up(&self) -> bool;
}

/// Settable link state for tests and embedders that receive connectivity events from elsewhere.
#[derive(Debug, Default)]
pub struct StaticLink {
    up: AtomicBool,
}

impl StaticLink {
    pub fn new(up: bool) -> Self {
        Self {
            up: AtomicBool::new(up),
        }
    }

    pub fn set(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

impl LinkProbe for StaticLink {
    fn link_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}

/// Online/offline state machine.
///
/// Every `Offline -> Online` transition signals the sync trigger. The trigger is a
/// [`Notify`], so signalling never blocks and bursts collapse into one stored permit.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    bus: EventBus,
    trigger: Arc<Notify>,
}

impl ConnectivityMonitor {
    /// Initial state is one synchronous probe.
    pub fn new(probe: &dyn LinkProbe, bus: EventBus) -> Self {
        let online = probe.link_up();
        info!(online, "connectivity monitor started");
        Self {
            online: AtomicBool::new(online),
            bus,
            trigger: Arc::new(Notify::new()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> Connectivity {
        Connectivity::from_link(self.is_online())
    }

    /// Handle the sync worker waits on.
    pub fn sync_trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Processes one platform connectivity event. Repeated identical events are no-ops.
    pub fn set_link_state(&self, up: bool) {
        let was_up = self.online.swap(up, Ordering::SeqCst);
        if was_up == up {
            return;
        }

        let state = Connectivity::from_link(up);
        info!(?state, "connectivity changed");
        if up {
            self.trigger.notify_one();
        }
        self.bus.publish(SyncEvent::ConnectivityChanged(state));
    }

    /// Polls `probe` every `interval` and feeds the result into [`Self::set_link_state`].
    pub fn spawn_poller(
        self: &Arc<Self>,
        probe: Arc<dyn LinkProbe>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let probe = Arc::clone(&probe);
                // Probes may do blocking I/O (a TCP connect, a sysfs read).
                let up = match tokio::task::spawn_blocking(move || probe.link_up()).await {
                    Ok(up) => up,
                    Err(err) => {
                        debug!(error = %err, "link probe panicked; treating link as down");
                        false
                    }
                };
                monitor.set_link_state(up);
            }
        })
    }
}
