//! JSON envelopes returned by the HTTP API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::ActiveSessionView;

/// Plain `{success, message}` body; every error response uses this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub success: bool,
    pub message: String,
}

impl ApiMessage {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionsListing {
    pub success: bool,
    pub connections: Vec<ActiveSessionView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseAck {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsesListing {
    pub success: bool,
    pub responses: Vec<Value>,
}
