//! Request/response DTOs and the error-to-status mapping.

use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::model::{NovelProfile, ProgressEvent, WorkerOutput};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub topic: String,
    #[serde(default)]
    pub novel_mode: bool,
    #[serde(default)]
    pub novel_profile: Option<NovelProfile>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// RFC 3339; the response contains strictly later events.
    pub since: Option<String>,
}

/// Poll response. An empty `progress_events` with `is_running=false`
/// tells the client to stop polling.
#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub progress_events: Vec<ProgressEvent>,
    pub worker_outputs: Vec<WorkerOutput>,
    pub is_running: bool,
    pub last_progress_event_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Map a domain error onto an HTTP response.
pub fn error_response(err: OrchestratorError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match &err {
        OrchestratorError::ValidationFailed(_) => (StatusCode::BAD_REQUEST, "VALIDATION_FAILED"),
        OrchestratorError::PlanNotConfirmed => (StatusCode::BAD_REQUEST, "PLAN_NOT_CONFIRMED"),
        OrchestratorError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        OrchestratorError::AlreadyRunning => (StatusCode::CONFLICT, "ALREADY_RUNNING"),
        OrchestratorError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
        OrchestratorError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
        OrchestratorError::ProviderUnavailable(_) => {
            (StatusCode::BAD_GATEWAY, "PROVIDER_UNAVAILABLE")
        }
        OrchestratorError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE"),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: code.to_string(),
        }),
    )
}
