//! Incremental event polling.
//!
//! Clients pass `since` = the newest `ts` they have and receive strictly
//! later progress events. An empty result with `is_running=false` is the
//! stop-polling signal.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use crate::model::parse_ts;
use crate::server::state::{AppState, AuthUser};
use crate::server::types::{error_response, ErrorResponse, EventsQuery, EventsResponse};

/// GET /sessions/:id/events?since={rfc3339}
pub async fn get_events(
    State(state): State<Arc<AppState>>,
    AuthUser(owner): AuthUser,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let store = state.orchestrator.store();
    store
        .load_owned(&session_id, &owner)
        .map_err(error_response)?;

    let since = match query.since.as_deref() {
        Some(raw) => parse_ts(raw).map_err(error_response)?,
        None => chrono::DateTime::<chrono::Utc>::MIN_UTC,
    };

    let all_events = store.progress_events(&session_id).map_err(error_response)?;
    let last_progress_event_ts = all_events.iter().map(|e| e.ts).max();
    let progress_events = all_events.into_iter().filter(|e| e.ts > since).collect();

    let snapshot = store.get(&session_id).map_err(error_response)?;
    let worker_outputs = store
        .get_worker_outputs(&session_id)
        .map_err(error_response)?;

    Ok(Json(EventsResponse {
        progress_events,
        worker_outputs,
        is_running: snapshot.is_running(),
        last_progress_event_ts,
    }))
}
