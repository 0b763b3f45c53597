use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionAction {
    Register,
    UpdateActivity,
    Unregister,
    UnregisterAll,
}

impl ConnectionAction {
    pub const ALL: [ConnectionAction; 4] = [
        ConnectionAction::Register,
        ConnectionAction::UpdateActivity,
        ConnectionAction::Unregister,
        ConnectionAction::UnregisterAll,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionAction::Register => "register",
            ConnectionAction::UpdateActivity => "update_activity",
            ConnectionAction::Unregister => "unregister",
            ConnectionAction::UnregisterAll => "unregister_all",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == raw)
    }
}

/// Body of `POST /connections`, and the payload of a queued connection record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub action: ConnectionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

impl ConnectionEvent {
    fn new(action: ConnectionAction, session_id: Option<String>) -> Self {
        Self {
            action,
            session_id,
            section: None,
            device_info: None,
            last_activity: None,
        }
    }

    pub fn register(session_id: impl Into<String>, device_info: Option<String>) -> Self {
        Self {
            device_info,
            ..Self::new(ConnectionAction::Register, Some(session_id.into()))
        }
    }

    pub fn update_activity(
        session_id: impl Into<String>,
        section: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            section,
            last_activity: Some(at),
            ..Self::new(ConnectionAction::UpdateActivity, Some(session_id.into()))
        }
    }

    pub fn unregister(session_id: impl Into<String>) -> Self {
        Self::new(ConnectionAction::Unregister, Some(session_id.into()))
    }

    pub fn unregister_all() -> Self {
        Self::new(ConnectionAction::UnregisterAll, None)
    }

    pub fn with_section(mut self, section: Option<String>) -> Self {
        self.section = section;
        self
    }
}

/// A live client connection tracked by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub session_id: String,
    pub registered_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub device_info: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl ActiveSession {
    pub fn new(session_id: String, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            registered_at: now,
            last_activity: now,
            section: None,
            device_info: None,
            user_agent: None,
        }
    }

    /// Time since registration; clock skew that puts `now` in the past yields zero.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.registered_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.age_at(now) > ttl
    }

    pub fn status_at(&self, now: DateTime<Utc>, idle_threshold: Duration) -> SessionStatus {
        let quiet_for = (now - self.last_activity).to_std().unwrap_or(Duration::ZERO);
        if quiet_for < idle_threshold {
            SessionStatus::Active
        } else {
            SessionStatus::Idle
        }
    }

    pub fn view_at(&self, now: DateTime<Utc>, idle_threshold: Duration) -> ActiveSessionView {
        ActiveSessionView {
            session: self.clone(),
            status: self.status_at(now, idle_threshold),
            elapsed_seconds: self.age_at(now).as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
}

/// Read-time projection of a session for dashboards; status is derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionView {
    #[serde(flatten)]
    pub session: ActiveSession,
    pub status: SessionStatus,
    pub elapsed_seconds: u64,
}
