pub mod apps;
pub mod health;
pub mod submissions;
pub mod workers;
pub mod workflows;

use axum::Router;

use rowe_core::state::AppState;

/// Build the complete API router with all sub-routes.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/health", health::router())
        .nest("/workflows", workflows::router())
        .nest("/submissions", submissions::router())
        .nest("/workers", workers::router())
        .nest("/tasks", workers::tasks_router())
        .nest("/apps", apps::router())
}
