use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use runwatch_alerts::HistoryEntry;
use serde::{Deserialize, Serialize};

use super::{check_auth, ApiError};
use crate::app::AppState;

const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub resource_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub entries: Vec<HistoryEntry>,
}

/// GET /history: the notification feed, newest first.
pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let limit = query.limit.clamp(1, MAX_LIMIT);
    let entries = match query.resource_id.as_deref() {
        Some(id) => state.history.for_resource(id, limit)?,
        None => state.history.recent(limit)?,
    };
    Ok(Json(HistoryResponse { entries }))
}
