//! Rowe Server — CWL workflow engine backend.
//!
//! A standalone HTTP server on top of rowe-core, providing:
//! - the REST API under `/api/v1` (workflows, submissions, tasks, apps)
//! - the pull-based worker protocol (register, heartbeat, checkout, complete)
//! - the scheduler loop, spawned alongside the listener

pub mod api;
pub mod envelope;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use rowe_core::config::RoweConfig;
use rowe_core::db::Database;
use rowe_core::state::{AppState, AppStateInner};

/// Create a shared `AppState` from configuration. Useful when the HTTP
/// server and another consumer (tests, the CLI) share one state.
pub fn create_app_state(config: RoweConfig) -> Result<AppState, String> {
    let db = Database::open(&config.db_path).map_err(|e| format!("failed to open database: {}", e))?;
    let state = AppStateInner::new(config, db).map_err(|e| e.to_string())?;
    Ok(Arc::new(state))
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api::api_router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Start the backend server. Returns the address actually listening.
pub async fn start_server(config: RoweConfig) -> Result<SocketAddr, String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rowe_server=info,rowe_core=info,tower_http=info".into()),
        )
        .init();

    tracing::info!("starting rowe server on {}:{}", config.host, config.port);

    let addr = format!("{}:{}", config.host, config.port);
    let state = create_app_state(config)?;

    // one cooperative scheduler loop per server
    tokio::spawn(state.scheduler.clone().run());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed to bind {}: {}", addr, e))?;
    let local = listener
        .local_addr()
        .map_err(|e| format!("failed to read local addr: {}", e))?;
    tracing::info!("listening on http://{}", local);

    let app = build_router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("server exited: {}", e);
        }
    });

    Ok(local)
}
