//! Remote-service app catalog, read through the schema cache.

use axum::{
    extract::{Path, State},
    routing::get,
    Router,
};

use rowe_core::error::ServerError;
use rowe_core::state::AppState;

use crate::envelope::{ApiError, Envelope};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_apps))
        .route("/{id}", get(get_app))
}

async fn list_apps(
    State(state): State<AppState>,
) -> Result<Envelope<Vec<serde_json::Value>>, ApiError> {
    let client = state.bvbrc.as_ref().ok_or_else(|| {
        ServerError::BadRequest("no remote service is configured".to_string())
    })?;
    let apps = client
        .enumerate_apps()
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    Ok(Envelope::success(apps))
}

async fn get_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Envelope<rowe_core::bvbrc::AppSchema>, ApiError> {
    let schemas = state.app_schemas.as_ref().ok_or_else(|| {
        ServerError::BadRequest("no remote service is configured".to_string())
    })?;
    let schema = schemas
        .get(&id)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    Ok(Envelope::success(schema))
}
