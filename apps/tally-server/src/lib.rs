//! Tally survey API.
//!
//! Two concerns share one router: the active-session registry fed by kiosk heartbeats
//! (`/connections`) and the intake of form responses (`/responses`).

pub mod config;
pub mod metrics;
pub mod registry;
pub mod responses;
pub mod responses_redis;
pub mod routes;
pub mod state;
pub mod telemetry;

pub use registry::{RegistryConfig, SessionRegistry};
pub use routes::build_router;
pub use state::AppState;
