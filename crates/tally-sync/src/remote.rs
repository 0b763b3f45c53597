//! The server API as seen from a kiosk.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tally_core::{
    ActiveSessionView, ConnectionEvent, ConnectionsListing, FormResponse, PendingRecord,
    RecordPayload, ResponsesListing,
};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    /// 400: the server will refuse this payload every time.
    #[error("server rejected payload as malformed: {body}")]
    Malformed { body: String },

    /// 404: the target (usually a session) is unknown to the server.
    #[error("target not found: {body}")]
    NotFound { body: String },

    #[error("unexpected status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("unreadable response body: {0}")]
    InvalidResponse(String),
}

impl DeliveryError {
    /// Whether replaying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DeliveryError::Malformed { .. } | DeliveryError::NotFound { .. }
        )
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeliveryError::Timeout
        } else if err.is_decode() {
            DeliveryError::InvalidResponse(err.to_string())
        } else {
            DeliveryError::Network(err.to_string())
        }
    }
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn send_response(&self, response: &FormResponse) -> Result<(), DeliveryError>;

    async fn send_connection(&self, event: &ConnectionEvent) -> Result<(), DeliveryError>;

    async fn fetch_sessions(&self) -> Result<Vec<ActiveSessionView>, DeliveryError>;

    async fn fetch_responses(&self) -> Result<Vec<Value>, DeliveryError>;

    /// Routes a queued record to the endpoint matching its kind.
    async fn deliver(&self, record: &PendingRecord) -> Result<(), DeliveryError> {
        match &record.payload {
            RecordPayload::FormResponse(response) => self.send_response(response).await,
            RecordPayload::ConnectionEvent(event) => self.send_connection(event).await,
        }
    }
}

/// reqwest-backed [`RemoteApi`]. Every request is bounded by the client timeout.
#[derive(Clone)]
pub struct HttpRemote {
    http: Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tally-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn check(res: Response) -> Result<Response, DeliveryError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::BAD_REQUEST => DeliveryError::Malformed { body },
        StatusCode::NOT_FOUND => DeliveryError::NotFound { body },
        other => DeliveryError::Rejected {
            status: other.as_u16(),
            body,
        },
    })
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn send_response(&self, response: &FormResponse) -> Result<(), DeliveryError> {
        let res = self
            .http
            .post(self.url("/responses"))
            .json(response)
            .send()
            .await?;
        check(res).await?;
        trace!(id = %response.id, "response delivered");
        Ok(())
    }

    async fn send_connection(&self, event: &ConnectionEvent) -> Result<(), DeliveryError> {
        let res = self
            .http
            .post(self.url("/connections"))
            .json(event)
            .send()
            .await?;
        check(res).await?;
        trace!(action = event.action.as_str(), "connection event delivered");
        Ok(())
    }

    async fn fetch_sessions(&self) -> Result<Vec<ActiveSessionView>, DeliveryError> {
        let res = self.http.get(self.url("/connections")).send().await?;
        let listing: ConnectionsListing = check(res).await?.json().await?;
        Ok(listing.connections)
    }

    async fn fetch_responses(&self) -> Result<Vec<Value>, DeliveryError> {
        let res = self.http.get(self.url("/responses")).send().await?;
        let listing: ResponsesListing = check(res).await?.json().await?;
        Ok(listing.responses)
    }
}

/// Scriptable in-process [`RemoteApi`] for unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeRemote {
        /// Consumed front-first; once empty every call succeeds.
        script: Mutex<VecDeque<Result<(), DeliveryError>>>,
        pub responses: Mutex<Vec<FormResponse>>,
        pub connections: Mutex<Vec<ConnectionEvent>>,
    }

    impl FakeRemote {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, result: Result<(), DeliveryError>) {
            self.script.lock().push_back(result);
        }

        pub fn fail_next(&self, count: usize, err: DeliveryError) {
            for _ in 0..count {
                self.push(Err(err.clone()));
            }
        }

        pub fn calls(&self) -> usize {
            self.responses.lock().len() + self.connections.lock().len()
        }

        pub fn response_ids(&self) -> Vec<String> {
            self.responses.lock().iter().map(|r| r.id.clone()).collect()
        }

        fn next(&self) -> Result<(), DeliveryError> {
            self.script.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    #[async_trait]
    impl RemoteApi for FakeRemote {
        async fn send_response(&self, response: &FormResponse) -> Result<(), DeliveryError> {
            let result = self.next();
            if result.is_ok() {
                self.responses.lock().push(response.clone());
            }
            result
        }

        async fn send_connection(&self, event: &ConnectionEvent) -> Result<(), DeliveryError> {
            let result = self.next();
            if result.is_ok() {
                self.connections.lock().push(event.clone());
            }
            result
        }

        async fn fetch_sessions(&self) -> Result<Vec<ActiveSessionView>, DeliveryError> {
            Ok(Vec::new())
        }

        async fn fetch_responses(&self) -> Result<Vec<Value>, DeliveryError> {
            let responses = self.responses.lock();
            responses
                .iter()
                .map(|r| serde_json::to_value(r).map_err(|e| DeliveryError::InvalidResponse(e.to_string())))
                .collect()
        }
    }
}
