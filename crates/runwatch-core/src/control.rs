//! Seams to collaborators that live outside the engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ResourceState;

/// What the cloud control API reports about a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescription {
    pub state: ResourceState,
    /// `None` when the resource is not running (the provider clears it).
    pub launch_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Resource not found: {resource_id}")]
    NotFound { resource_id: String },

    #[error("Control API unavailable: {0}")]
    Unavailable(String),

    #[error("Control API rejected the request: {0}")]
    Rejected(String),
}

/// Start/stop/describe surface of the cloud provider. Authentication is the
/// implementor's business.
#[async_trait]
pub trait ResourceControl: Send + Sync {
    async fn describe(
        &self,
        resource_id: &str,
        region: &str,
    ) -> std::result::Result<ResourceDescription, ControlError>;

    async fn stop(&self, resource_id: &str, region: &str) -> std::result::Result<(), ControlError>;
}

/// Implemented by the client-side countdown layer so disarming a resource
/// also clears its local auto-stop timer.
pub trait CountdownCanceller: Send + Sync {
    fn cancel_countdown(&self, resource_id: &str) -> crate::error::Result<()>;
}
