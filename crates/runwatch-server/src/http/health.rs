use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe with a little engine metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "dispatch_interval_secs": state.config.dispatch.interval_secs,
        "countdowns": state.countdowns.is_some(),
        "subscribers": state.events.receiver_count(),
    }))
}
