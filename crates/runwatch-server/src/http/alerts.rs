//! Alert endpoints used by the UI layer.
//!
//! - `POST /alerts/arm` arms thresholds for a running resource.
//! - `POST /alerts/disarm` cancels them (and any local countdown).
//! - `POST /resources/state` reports a lifecycle transition.
//! - `GET /alerts?resource_id=&region=` lists live alerts of one resource.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use runwatch_alerts::{AlertRecord, ArmRequest};
use runwatch_core::ResourceState;
use serde::{Deserialize, Serialize};

use super::{check_auth, ApiError};
use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct ArmBody {
    pub resource_id: String,
    #[serde(default)]
    pub resource_name: Option<String>,
    pub region: String,
    pub launch_time: DateTime<Utc>,
    pub resource_state: ResourceState,
    pub thresholds_minutes: Vec<u32>,
    pub delivery_target: String,
}

#[derive(Serialize)]
pub struct ArmResponse {
    pub armed: usize,
}

pub async fn arm_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ArmBody>,
) -> Result<Json<ArmResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let req = ArmRequest {
        resource_id: body.resource_id,
        resource_name: body.resource_name,
        region: body.region,
        launch_time: body.launch_time,
        resource_state: body.resource_state,
        thresholds: body
            .thresholds_minutes
            .iter()
            .map(|m| Duration::from_secs(u64::from(*m) * 60))
            .collect(),
        delivery_target: body.delivery_target,
    };
    let armed = state.registrar.arm(&req)?;
    Ok(Json(ArmResponse { armed }))
}

#[derive(Debug, Deserialize)]
pub struct ResourceRef {
    pub resource_id: String,
    pub region: String,
}

#[derive(Serialize)]
pub struct DisarmResponse {
    pub cancelled: usize,
}

pub async fn disarm_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ResourceRef>,
) -> Result<Json<DisarmResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let cancelled = state.registrar.disarm(&body.resource_id, &body.region)?;
    Ok(Json(DisarmResponse { cancelled }))
}

#[derive(Debug, Deserialize)]
pub struct StateBody {
    pub resource_id: String,
    pub region: String,
    pub state: ResourceState,
}

#[derive(Serialize)]
pub struct StateResponse {
    pub cancelled: usize,
    pub updated: usize,
}

pub async fn state_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<StateBody>,
) -> Result<Json<StateResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let outcome = state
        .tracker
        .on_state_change(&body.resource_id, &body.region, &body.state)?;
    Ok(Json(StateResponse {
        cancelled: outcome.cancelled,
        updated: outcome.updated,
    }))
}

#[derive(Serialize)]
pub struct AlertsResponse {
    pub alerts: Vec<AlertRecord>,
}

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ResourceRef>,
) -> Result<Json<AlertsResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let alerts = state
        .registrar
        .alerts_for_resource(&query.resource_id, &query.region)?;
    Ok(Json(AlertsResponse { alerts }))
}
