use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tally_core::{
    ApiMessage, ConnectionAction, ConnectionEvent, ConnectionsListing, ResponseAck,
    ResponsesListing,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::{
    metrics,
    registry::{RegistryError, Registration},
    responses::{self, InsertOutcome},
    state::AppState,
};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/connections", get(list_connections).post(post_connection))
        .route("/responses", get(list_responses).post(post_response))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(ApiMessage::error(message))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => ApiError::NotFound("session not found".into()),
        }
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.uptime_secs(),
        "responseBackend": state.responses().backend(),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

async fn list_connections(State(state): State<AppState>) -> ApiResult<ConnectionsListing> {
    Ok(Json(ConnectionsListing {
        success: true,
        connections: state.registry().list(),
    }))
}

/// Accepts JSON bodies regardless of content type: page-unload beacons arrive as `text/plain`.
fn parse_connection_event(body: &[u8]) -> Result<ConnectionEvent, ApiError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| ApiError::BadRequest(format!("invalid body: {err}")))?;
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("missing action".into()))?;
    if ConnectionAction::parse(action).is_none() {
        return Err(ApiError::BadRequest(format!("unknown action: {action}")));
    }
    serde_json::from_value(value)
        .map_err(|err| ApiError::BadRequest(format!("invalid connection event: {err}")))
}

async fn post_connection(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<ApiMessage> {
    let event = parse_connection_event(&body)?;
    let registry = state.registry();

    if event.action == ConnectionAction::UnregisterAll {
        let cleared = registry.unregister_all();
        return Ok(Json(ApiMessage::ok(format!("{cleared} connections removed"))));
    }

    let session_id = event
        .session_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing sessionId".into()))?;

    let message = match event.action {
        ConnectionAction::Register => {
            let user_agent = headers
                .get(header::USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let created = registry.register(
                session_id,
                Registration {
                    device_info: event.device_info.clone(),
                    section: event.section.clone(),
                    user_agent,
                },
            );
            info!(session_id, created, "connection registered");
            "connection registered"
        }
        ConnectionAction::UpdateActivity => {
            if let Err(err) = registry.heartbeat(session_id, event.section.clone()) {
                debug!(session_id, "heartbeat for unknown session");
                return Err(err.into());
            }
            "activity updated"
        }
        ConnectionAction::Unregister => {
            registry.unregister(session_id);
            "connection removed"
        }
        ConnectionAction::UnregisterAll => "all connections removed",
    };
    Ok(Json(ApiMessage::ok(message)))
}

async fn list_responses(State(state): State<AppState>) -> ApiResult<ResponsesListing> {
    let responses = state.responses().list().await.map_err(|err| {
        error!(error = %err, "failed to list responses");
        ApiError::Internal("failed to list responses".into())
    })?;
    Ok(Json(ResponsesListing {
        success: true,
        responses,
    }))
}

async fn post_response(State(state): State<AppState>, body: Bytes) -> ApiResult<ResponseAck> {
    let parsed = serde_json::from_slice::<Value>(&body)
        .map_err(|err| format!("invalid body: {err}"))
        .and_then(|value| responses::prepare(value, Utc::now()).map_err(|err| err.to_string()));
    let (id, record) = match parsed {
        Ok(prepared) => prepared,
        Err(message) => {
            metrics::RESPONSES_RECEIVED
                .with_label_values(&["rejected"])
                .inc();
            warn!(%message, "rejected response body");
            return Err(ApiError::BadRequest(message));
        }
    };

    let outcome = state.responses().insert(&id, record).await.map_err(|err| {
        error!(%id, error = %err, "failed to store response");
        ApiError::Internal("failed to store response".into())
    })?;

    let (label, message) = match &outcome {
        InsertOutcome::Created(_) => ("created", "response recorded"),
        InsertOutcome::Existing(_) => ("duplicate", "response already recorded"),
    };
    metrics::RESPONSES_RECEIVED
        .with_label_values(&[label])
        .inc();
    info!(%id, result = label, "response received");

    Ok(Json(ResponseAck {
        success: true,
        message: Some(message.to_string()),
        data: outcome.into_value(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{self, Body},
        http::Request,
    };
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn health_reports_backend() {
        let app = build_router(AppState::in_memory());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["responseBackend"], "memory");
    }

    #[test]
    fn connection_bodies_are_validated_before_decoding() {
        assert!(matches!(
            parse_connection_event(b"{not json"),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            parse_connection_event(br#"{"action":"dance","sessionId":"s1"}"#),
            Err(ApiError::BadRequest(message)) if message.contains("dance")
        ));
        let event = parse_connection_event(br#"{"action":"unregister","sessionId":"s1"}"#).unwrap();
        assert_eq!(event.action, ConnectionAction::Unregister);
    }
}
