//! HTTP handlers: the push validation pipeline, status queries, and health.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prost::Message;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::batcher::Batcher;
use crate::ourcloud::OurCloudService;
use crate::proto::{PushRequest, PushResponse};

/// Error codes carried in `PushResponse.error_code`.
pub const ERROR_CODE_SUCCESS: i32 = 0;
pub const ERROR_CODE_NO_ENDPOINTS: i32 = 1;
pub const ERROR_CODE_NO_CONSENT: i32 = 2;
pub const ERROR_CODE_SIGNATURE_FAILED: i32 = 3;
pub const ERROR_CODE_INVALID_REQUEST: i32 = 4;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub ourcloud: Arc<dyn OurCloudService>,
    pub batcher: Arc<Batcher>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/push", post(handle_push))
        .route("/status/:id", get(handle_get_status))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// `POST /push`. Fixed validation chain; each failing step answers with its
/// own error code and the chain stops there:
/// parse → required fields → signature (3) → consent (2) → endpoints (1),
/// with parse/field failures as code 4. Accepted requests fan out to one
/// batch admission per endpoint under a single request id.
#[instrument(skip_all)]
async fn handle_push(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let req = match parse_request(&headers, &body) {
        Ok(req) => req,
        Err(message) => {
            return push_response(false, "", ERROR_CODE_INVALID_REQUEST, message);
        }
    };

    if let Err(message) = validate_request(&req) {
        return push_response(false, "", ERROR_CODE_INVALID_REQUEST, message);
    }

    match state.ourcloud.verify_push_request(&req).await {
        Ok(true) => {}
        Ok(false) => {
            return push_response(
                false,
                "",
                ERROR_CODE_SIGNATURE_FAILED,
                "signature verification failed",
            );
        }
        Err(err) => {
            warn!(?err, sender = %req.sender_username, "signature verification error");
            return push_response(
                false,
                "",
                ERROR_CODE_SIGNATURE_FAILED,
                "signature verification failed",
            );
        }
    }

    match state
        .ourcloud
        .has_consent(&req.target_username, &req.sender_username)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            return push_response(false, "", ERROR_CODE_NO_CONSENT, "sender not in consent list");
        }
        Err(err) => {
            warn!(?err, target = %req.target_username, "consent lookup error");
            return push_response(false, "", ERROR_CODE_NO_CONSENT, "sender not in consent list");
        }
    }

    let endpoints = match state.ourcloud.get_endpoints(&req.target_username).await {
        Ok(endpoints) if !endpoints.is_empty() => endpoints,
        Ok(_) => {
            return push_response(false, "", ERROR_CODE_NO_ENDPOINTS, "no endpoints registered");
        }
        Err(err) => {
            warn!(?err, target = %req.target_username, "endpoint lookup error");
            return push_response(false, "", ERROR_CODE_NO_ENDPOINTS, "no endpoints registered");
        }
    };

    // One request id for the whole request: every endpoint's flush publishes
    // under this key, last terminal write wins. A per-endpoint admission
    // failure is logged and dropped; delivery is best-effort.
    let request_id = Uuid::new_v4().to_string();
    let cancel = CancellationToken::new();
    for endpoint in &endpoints {
        if let Err(err) = state
            .batcher
            .queue_with_request_id(
                &endpoint.fcm_token,
                req.data_ids.clone(),
                &request_id,
                &cancel,
            )
            .await
        {
            warn!(?err, device = %endpoint.device_id, "failed to queue notification");
        }
    }

    push_response(true, &request_id, ERROR_CODE_SUCCESS, "")
}

fn parse_request(headers: &HeaderMap, body: &Bytes) -> Result<PushRequest, &'static str> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if content_type != "application/x-protobuf" && content_type != "application/protobuf" {
        return Err("invalid content type, expected application/x-protobuf");
    }
    if body.is_empty() {
        return Err("empty request body");
    }
    PushRequest::decode(body.as_ref()).map_err(|_| "failed to unmarshal protobuf")
}

fn validate_request(req: &PushRequest) -> Result<(), &'static str> {
    if req.sender_username.is_empty() {
        return Err("sender_username is required");
    }
    if req.target_username.is_empty() && req.target_node_ids.is_empty() {
        return Err("target_username or target_node_ids is required");
    }
    if req.signature.is_empty() {
        return Err("signature is required");
    }
    Ok(())
}

/// Encode a `PushResponse` and map the error code onto an HTTP status.
fn push_response(accepted: bool, request_id: &str, error_code: i32, message: &str) -> Response {
    let body = PushResponse {
        accepted,
        request_id: request_id.to_string(),
        error_code,
        message: message.to_string(),
    }
    .encode_to_vec();

    let status = match error_code {
        ERROR_CODE_SUCCESS => StatusCode::OK,
        ERROR_CODE_NO_ENDPOINTS => StatusCode::NOT_FOUND,
        ERROR_CODE_NO_CONSENT => StatusCode::FORBIDDEN,
        ERROR_CODE_SIGNATURE_FAILED => StatusCode::UNAUTHORIZED,
        ERROR_CODE_INVALID_REQUEST => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        [(header::CONTENT_TYPE, "application/x-protobuf")],
        body,
    )
        .into_response()
}

/// JSON body for `GET /status/{id}`. Timestamps are UNIX seconds.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub expires_at: i64,
}

/// `GET /status/{id}`.
async fn handle_get_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "missing request ID").into_response();
    }

    match state.batcher.get_status(&id).await {
        Ok(Some(status)) => Json(StatusResponse {
            state: status.state.as_str(),
            sent_at: status.sent_at.map(|t| t.timestamp()),
            error: status.error,
            expires_at: status.expires_at.timestamp(),
        })
        .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "request not found").into_response(),
        Err(err) => {
            warn!(?err, request_id = %id, "status lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    ourcloud: String,
}

/// `GET /health`. Degraded (503) when the OurCloud probe fails within 5 s.
async fn handle_health(State(state): State<AppState>) -> Response {
    let probe = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, state.ourcloud.health_check()).await;
    match probe {
        Ok(Ok(())) => Json(HealthResponse {
            status: "ok",
            ourcloud: "ok".to_string(),
        })
        .into_response(),
        Ok(Err(err)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "degraded",
                ourcloud: format!("error: {err:#}"),
            }),
        )
            .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "degraded",
                ourcloud: "error: health check timed out".to_string(),
            }),
        )
            .into_response(),
    }
}
