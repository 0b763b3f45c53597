//! Active-session registry.
//!
//! Process-lifetime map of session id to [`ActiveSession`], behind one mutex so every operation
//! (including the purge of expired entries) is a single critical section. Expiry is measured from
//! `registered_at`, not from the last heartbeat: a session disappears from reads once it is older
//! than the TTL no matter how chatty it is.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tally_core::{
    limits::{IDLE_THRESHOLD, SESSION_TTL},
    ActiveSession, ActiveSessionView,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::metrics;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub session_ttl: Duration,
    pub idle_threshold: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session_ttl: SESSION_TTL,
            idle_threshold: IDLE_THRESHOLD,
        }
    }
}

/// Fields a `register` call may carry; `None` leaves an existing value alone.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub device_info: Option<String>,
    pub section: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: Mutex<HashMap<String, ActiveSession>>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Upsert. Returns true when a new session was created.
    pub fn register(&self, session_id: &str, registration: Registration) -> bool {
        self.register_at(session_id, registration, Utc::now())
    }

    pub fn register_at(
        &self,
        session_id: &str,
        registration: Registration,
        now: DateTime<Utc>,
    ) -> bool {
        let ttl = self.inner.config.session_ttl;
        let mut sessions = self.inner.sessions.lock();

        // An expired session that no read has purged yet starts over.
        let live = sessions
            .get(session_id)
            .is_some_and(|session| !session.is_expired_at(now, ttl));
        if !live {
            sessions.insert(
                session_id.to_string(),
                ActiveSession::new(session_id.to_string(), now),
            );
        }

        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        session.last_activity = now;
        if registration.device_info.is_some() {
            session.device_info = registration.device_info;
        }
        if registration.section.is_some() {
            session.section = registration.section;
        }
        if registration.user_agent.is_some() {
            session.user_agent = registration.user_agent;
        }

        metrics::SESSIONS_REGISTERED.inc();
        metrics::ACTIVE_SESSIONS.set(sessions.len() as i64);
        debug!(session_id, new = !live, "session registered");
        !live
    }

    pub fn heartbeat(&self, session_id: &str, section: Option<String>) -> Result<(), RegistryError> {
        self.heartbeat_at(session_id, section, Utc::now())
    }

    pub fn heartbeat_at(
        &self,
        session_id: &str,
        section: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let ttl = self.inner.config.session_ttl;
        let mut sessions = self.inner.sessions.lock();

        let found = match sessions.get(session_id).map(|s| s.is_expired_at(now, ttl)) {
            None => false,
            Some(true) => {
                sessions.remove(session_id);
                metrics::ACTIVE_SESSIONS.set(sessions.len() as i64);
                false
            }
            Some(false) => match sessions.get_mut(session_id) {
                Some(session) => {
                    session.last_activity = now;
                    if section.is_some() {
                        session.section = section;
                    }
                    true
                }
                None => false,
            },
        };

        if !found {
            metrics::HEARTBEATS.with_label_values(&["not_found"]).inc();
            return Err(RegistryError::NotFound(session_id.to_string()));
        }
        metrics::HEARTBEATS.with_label_values(&["ok"]).inc();
        Ok(())
    }

    /// Idempotent. Returns whether a session was removed.
    pub fn unregister(&self, session_id: &str) -> bool {
        let mut sessions = self.inner.sessions.lock();
        let removed = sessions.remove(session_id).is_some();
        metrics::ACTIVE_SESSIONS.set(sessions.len() as i64);
        debug!(session_id, removed, "session unregistered");
        removed
    }

    pub fn unregister_all(&self) -> usize {
        let mut sessions = self.inner.sessions.lock();
        let cleared = sessions.len();
        sessions.clear();
        metrics::ACTIVE_SESSIONS.set(0);
        info!(cleared, "all sessions unregistered");
        cleared
    }

    pub fn list(&self) -> Vec<ActiveSessionView> {
        self.list_at(Utc::now())
    }

    /// Purges expired sessions, then returns the rest oldest registration first.
    pub fn list_at(&self, now: DateTime<Utc>) -> Vec<ActiveSessionView> {
        let config = &self.inner.config;
        let mut sessions = self.inner.sessions.lock();
        purge_locked(&mut sessions, now, config.session_ttl);

        let mut views: Vec<ActiveSessionView> = sessions
            .values()
            .map(|session| session.view_at(now, config.idle_threshold))
            .collect();
        views.sort_by(|a, b| {
            a.session
                .registered_at
                .cmp(&b.session.registered_at)
                .then_with(|| a.session.session_id.cmp(&b.session.session_id))
        });
        views
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.inner.sessions.lock();
        purge_locked(&mut sessions, now, self.inner.config.session_ttl)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodic housekeeping on top of the purge every read already does.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let mut ticker = tokio::time::interval(interval);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let purged = registry.purge_expired_at(Utc::now());
                if purged > 0 {
                    info!(purged, "swept expired sessions");
                }
            }
        })
    }
}

fn purge_locked(
    sessions: &mut HashMap<String, ActiveSession>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> usize {
    let before = sessions.len();
    sessions.retain(|_, session| !session.is_expired_at(now, ttl));
    let purged = before - sessions.len();
    if purged > 0 {
        metrics::ACTIVE_SESSIONS.set(sessions.len() as i64);
        debug!(purged, "purged expired sessions");
    }
    purged
}
