//! HTTP surface: axum router over the orchestrator, with bearer-token
//! authentication on everything outside `/auth` and `/health`.

pub mod routes;
pub mod state;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{AuthService, LogMailer};
use crate::config::Config;
use crate::llm::create_client;
use crate::orchestrator::Orchestrator;
use crate::store::SessionStore;

use state::AppState;

/// Build the application state from config: store, providers,
/// orchestrator, auth.
pub fn build_state(config: &Config) -> anyhow::Result<Arc<AppState>> {
    let data_dir = config.data_dir()?;
    let store = Arc::new(SessionStore::new(&data_dir)?);
    let providers =
        crate::agents::Providers::uniform(create_client(&config.llm));
    let orchestrator = Orchestrator::new(store, providers, config.orchestrator_settings());
    let auth = Arc::new(AuthService::new(
        &data_dir,
        &config.auth,
        Arc::new(LogMailer),
    )?);
    Ok(Arc::new(AppState { orchestrator, auth }))
}

/// Assemble the router. Public so integration tests can drive the exact
/// production routing without binding a fixed port.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/auth/register", post(routes::auth::register))
        .route("/auth/verify", post(routes::auth::verify))
        .route("/auth/login", post(routes::auth::login))
        .route("/sessions", post(routes::sessions::create_session))
        .route("/sessions", get(routes::sessions::list_sessions))
        .route("/sessions/:id", get(routes::sessions::get_session))
        .route("/sessions/:id", delete(routes::sessions::delete_session))
        .route(
            "/sessions/:id/command",
            post(routes::sessions::execute_command),
        )
        .route("/sessions/:id/events", get(routes::events::get_events))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the server until ctrl-c, then cancel outstanding runners.
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let state = build_state(&config)?;
    let orchestrator = state.orchestrator.clone();

    let mut app = build_router(state);
    if config.server.cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("shutting down; cancelling outstanding runs");
    orchestrator.shutdown().await;
    Ok(())
}
