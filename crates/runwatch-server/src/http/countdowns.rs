//! Local auto-stop countdowns. All endpoints answer 503 when no control
//! endpoint is configured.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::HeaderMap, Json};
use runwatch_countdown::{CountdownReconciler, LocalCountdown, ResumeOutcome};
use serde::{Deserialize, Serialize};

use super::{check_auth, ApiError};
use crate::app::AppState;

fn reconciler(state: &AppState) -> Result<&CountdownReconciler, ApiError> {
    state
        .countdowns
        .as_ref()
        .ok_or_else(|| ApiError::unavailable("auto-stop requires control.url to be configured"))
}

#[derive(Debug, Deserialize)]
pub struct ArmCountdownBody {
    pub resource_id: String,
    #[serde(default)]
    pub resource_name: Option<String>,
    pub region: String,
    pub duration_secs: u64,
}

pub async fn arm_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ArmCountdownBody>,
) -> Result<Json<LocalCountdown>, ApiError> {
    check_auth(&state, &headers)?;
    let name = body.resource_name.as_deref().unwrap_or(&body.resource_id);
    let countdown = reconciler(&state)?.arm(
        &body.resource_id,
        name,
        &body.region,
        Duration::from_secs(body.duration_secs),
    )?;
    Ok(Json(countdown))
}

#[derive(Debug, Deserialize)]
pub struct CancelCountdownBody {
    pub resource_id: String,
}

#[derive(Serialize)]
pub struct CancelCountdownResponse {
    pub cancelled: bool,
}

pub async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CancelCountdownBody>,
) -> Result<Json<CancelCountdownResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let cancelled = reconciler(&state)?.cancel(&body.resource_id)?;
    Ok(Json(CancelCountdownResponse { cancelled }))
}

#[derive(Serialize)]
pub struct ResumedCountdown {
    pub resource_id: String,
    pub outcome: &'static str,
    pub remaining_secs: Option<i64>,
}

/// POST /countdowns/resume: reconcile every persisted countdown now.
pub async fn resume_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ResumedCountdown>>, ApiError> {
    check_auth(&state, &headers)?;
    let outcomes = reconciler(&state)?.resume_all().await?;
    Ok(Json(
        outcomes
            .into_iter()
            .map(|(resource_id, outcome)| {
                let (outcome, remaining_secs) = match outcome {
                    ResumeOutcome::Idle => ("idle", None),
                    ResumeOutcome::Fired => ("fired", None),
                    ResumeOutcome::Resumed { remaining } => ("resumed", Some(remaining.num_seconds())),
                };
                ResumedCountdown {
                    resource_id,
                    outcome,
                    remaining_secs,
                }
            })
            .collect(),
    ))
}

#[derive(Serialize)]
pub struct CountdownsResponse {
    pub countdowns: Vec<LocalCountdown>,
}

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<CountdownsResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let countdowns = reconciler(&state)?.countdowns()?;
    Ok(Json(CountdownsResponse { countdowns }))
}
