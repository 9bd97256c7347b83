//! Registration, email verification, and login.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::server::state::AppState;
use crate::server::types::{
    error_response, ErrorResponse, LoginRequest, RegisterRequest, StatusResponse, TokenResponse,
    VerifyRequest,
};

/// POST /auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .auth
        .register(&request.email, &request.password)
        .map_err(error_response)?;
    Ok(Json(StatusResponse {
        status: "verification code sent".into(),
    }))
}

/// POST /auth/verify
pub async fn verify(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .auth
        .verify(&request.email, &request.code)
        .map_err(error_response)?;
    Ok(Json(StatusResponse {
        status: "verified".into(),
    }))
}

/// POST /auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, (StatusCode, Json<ErrorResponse>)> {
    let access_token = state
        .auth
        .login(&request.email, &request.password)
        .map_err(error_response)?;
    Ok(Json(TokenResponse { access_token }))
}
