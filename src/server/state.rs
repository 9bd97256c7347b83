//! Shared server state and the bearer-token extractor.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header::AUTHORIZATION, StatusCode};
use axum::Json;

use crate::auth::AuthService;
use crate::orchestrator::Orchestrator;

use super::types::ErrorResponse;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub auth: Arc<AuthService>,
}

/// The authenticated caller's identity, resolved from the Authorization
/// header. Every non-auth endpoint takes this extractor.
pub struct AuthUser(pub String);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|header| header.strip_prefix("Bearer "));

        match token.map(|t| state.auth.authenticate(t)) {
            Some(Ok(identity)) => Ok(AuthUser(identity)),
            _ => Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "missing or invalid bearer token".into(),
                    code: "UNAUTHORIZED".into(),
                }),
            )),
        }
    }
}
