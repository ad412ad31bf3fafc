use std::time::Duration;

use chrono::{DateTime, Utc};
use runwatch_core::{AlertStatus, ResourceState};
use serde::{Deserialize, Serialize};

/// Deterministic record id: `{region}_{resource_id}_{threshold_minutes}`.
///
/// Re-arming the same threshold for the same resource lands on the same row.
pub fn alert_id(region: &str, resource_id: &str, threshold_minutes: u32) -> String {
    format!("{region}_{resource_id}_{threshold_minutes}")
}

/// A persisted runtime alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    /// Primary key, see [`alert_id`].
    pub id: String,
    pub resource_id: String,
    pub resource_name: String,
    pub region: String,
    /// Anchor for all duration math.
    pub launch_time: DateTime<Utc>,
    pub threshold_minutes: u32,
    /// Always `launch_time + threshold_minutes`; stored so the dispatch query
    /// can filter and order on it.
    pub scheduled_time: DateTime<Utc>,
    pub status: AlertStatus,
    /// Last lifecycle state mirrored by the state tracker.
    pub resource_state: ResourceState,
    /// Soft-delete flag; the retention sweep removes the row later.
    pub deleted: bool,
    /// Opaque push address captured at arm time.
    pub delivery_target: String,
    /// Ticks on which delivery failed transiently.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl AlertRecord {
    /// Build a fresh `pending` record for a running resource.
    pub fn new(
        resource_id: &str,
        resource_name: &str,
        region: &str,
        launch_time: DateTime<Utc>,
        threshold_minutes: u32,
        delivery_target: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: alert_id(region, resource_id, threshold_minutes),
            resource_id: resource_id.to_string(),
            resource_name: resource_name.to_string(),
            region: region.to_string(),
            launch_time,
            threshold_minutes,
            scheduled_time: launch_time + chrono::Duration::minutes(threshold_minutes as i64),
            status: AlertStatus::Pending,
            resource_state: ResourceState::Running,
            deleted: false,
            delivery_target: delivery_target.to_string(),
            attempts: 0,
            created_at: now,
            updated_at: now,
            last_error_at: None,
            error: None,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }

    /// Pending, live, resource running and scheduled time reached.
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.is_live()
            && self.status == AlertStatus::Pending
            && self.resource_state.is_running()
            && self.scheduled_time <= now
    }
}

/// User intent to be alerted at one or more runtimes.
#[derive(Debug, Clone)]
pub struct ArmRequest {
    pub resource_id: String,
    /// Display name; falls back to `resource_id` when blank.
    pub resource_name: Option<String>,
    pub region: String,
    pub launch_time: DateTime<Utc>,
    /// State the caller observed; only `running` resources can be armed.
    pub resource_state: ResourceState,
    /// Durations after launch. Each must be a positive whole number of minutes.
    pub thresholds: Vec<Duration>,
    pub delivery_target: String,
}

/// Change notifications published on the engine's broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlertEvent {
    Armed {
        resource_id: String,
        region: String,
        count: usize,
    },
    Disarmed {
        resource_id: String,
        region: String,
        count: usize,
    },
    Cancelled {
        resource_id: String,
        region: String,
        count: usize,
        reason: String,
    },
    Fired {
        alert_id: String,
        resource_id: String,
        region: String,
        threshold_minutes: u32,
        message_id: String,
    },
    Failed {
        alert_id: String,
        resource_id: String,
        region: String,
        fatal: bool,
        error: String,
    },
}
