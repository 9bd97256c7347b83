//! Session CRUD and the command endpoint.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::model::{SessionSnapshot, SessionSummary};
use crate::orchestrator::{Command, CommandOutcome};
use crate::server::state::{AppState, AuthUser};
use crate::server::types::{
    error_response, CreateSessionRequest, DeleteResponse, ErrorResponse,
};

/// POST /sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    AuthUser(owner): AuthUser,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionSnapshot>), (StatusCode, Json<ErrorResponse>)> {
    let snapshot = state
        .orchestrator
        .create_session(
            &owner,
            &request.topic,
            request.novel_mode,
            request.novel_profile,
        )
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// GET /sessions, owner-scoped, newest first.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    AuthUser(owner): AuthUser,
) -> Result<Json<Vec<SessionSummary>>, (StatusCode, Json<ErrorResponse>)> {
    let summaries = state
        .orchestrator
        .store()
        .list(&owner)
        .map_err(error_response)?;
    Ok(Json(summaries))
}

/// GET /sessions/:id
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    AuthUser(owner): AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, (StatusCode, Json<ErrorResponse>)> {
    let store = state.orchestrator.store();
    store
        .load_owned(&session_id, &owner)
        .map_err(error_response)?;
    let snapshot = store.get(&session_id).map_err(error_response)?;
    Ok(Json(snapshot))
}

/// DELETE /sessions/:id
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    AuthUser(owner): AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<DeleteResponse>, (StatusCode, Json<ErrorResponse>)> {
    let outcome = state
        .orchestrator
        .execute(&owner, &session_id, Command::DeleteSession)
        .await
        .map_err(error_response)?;
    Ok(Json(DeleteResponse { ok: outcome.ok }))
}

/// POST /sessions/:id/command, the dispatcher endpoint. The body is the
/// wire form of `Command`: `{"command": ..., "payload": ...}`.
pub async fn execute_command(
    State(state): State<Arc<AppState>>,
    AuthUser(owner): AuthUser,
    Path(session_id): Path<String>,
    Json(command): Json<Command>,
) -> Result<Json<CommandOutcome>, (StatusCode, Json<ErrorResponse>)> {
    let outcome = state
        .orchestrator
        .execute(&owner, &session_id, command)
        .await
        .map_err(error_response)?;
    Ok(Json(outcome))
}
