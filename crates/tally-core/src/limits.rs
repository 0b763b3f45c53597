//! Named limits shared by the kiosk and the server.
//!
//! Every tunable the sync subsystem depends on lives here with its default. Binaries may
//! override them through their CLI/env surface; libraries fall back to these values.

use std::time::Duration;

/// Ceiling for the on-device store, in bytes (4 MiB).
pub const MAX_STORAGE_BYTES: u64 = 4 * 1024 * 1024;

/// A record is delivered at most this many times before it is moved to the failed bucket.
pub const MAX_SYNC_ATTEMPTS: u32 = 5;

/// Interval between `update_activity` calls from a live client.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Sessions older than this (measured from registration) disappear from the registry.
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// A session with no activity for this long is reported as idle.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(60);

/// Upper bound for a single delivery attempt.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Periodic sync tick, independent of connectivity transitions.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Store key holding records that still await delivery.
pub const PENDING_REQUESTS_KEY: &str = "pendingRequests";

/// Store key holding form responses known to this device, with their `pendingSync` flag.
pub const OFFLINE_RESPONSES_KEY: &str = "offlineResponses";

/// Store key holding records that exhausted their attempts or were refused by the server.
pub const FAILED_REQUESTS_KEY: &str = "failedRequests";
