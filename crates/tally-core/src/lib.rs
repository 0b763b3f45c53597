//! Shared primitives for the Tally survey service.
//!
//! Both the kiosk-side sync crate and the HTTP server speak in these types, so the
//! JSON shapes here are the wire contract: camelCase field names, RFC 3339 timestamps.

pub mod connection;
pub mod form;
pub mod ids;
pub mod limits;
pub mod record;
pub mod wire;

pub use connection::{ActiveSession, ActiveSessionView, ConnectionAction, ConnectionEvent, SessionStatus};
pub use form::{FormData, FormResponse};
pub use ids::generate_record_id;
pub use record::{PendingRecord, RecordKind, RecordPayload};
pub use wire::{ApiMessage, ConnectionsListing, ResponseAck, ResponsesListing};
