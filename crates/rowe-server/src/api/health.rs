use axum::{extract::State, routing::get, Router};

use rowe_core::state::AppState;

use crate::envelope::Envelope;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health))
}

async fn health(State(state): State<AppState>) -> Envelope<serde_json::Value> {
    Envelope::success(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "executors": state.registry.available(),
    }))
}
