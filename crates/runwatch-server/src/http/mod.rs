pub mod alerts;
pub mod countdowns;
pub mod health;
pub mod history;

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use runwatch_alerts::AlertError;
use runwatch_countdown::CountdownError;
use serde_json::json;
use tracing::error;

use crate::app::AppState;

/// JSON error body: `{ "error": "...", "code": "..." }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED",
            message: "Unauthorized. Set 'Authorization: Bearer <your-token>' header.".to_string(),
        }
    }

    pub fn unavailable(message: &str) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "UNAVAILABLE",
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.message, "code": self.code })),
        )
            .into_response()
    }
}

impl From<AlertError> for ApiError {
    fn from(e: AlertError) -> Self {
        let status = match e {
            AlertError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => {
                error!("alert store error: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<CountdownError> for ApiError {
    fn from(e: CountdownError) -> Self {
        let status = match e {
            CountdownError::InvalidDuration(_) => StatusCode::BAD_REQUEST,
            _ => {
                error!("countdown storage error: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            code: e.code(),
            message: e.to_string(),
        }
    }
}

/// Bearer check against `server.token`. No token configured means open.
pub fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.server.token.as_deref() else {
        return Ok(());
    };
    match extract_bearer(headers) {
        Some(t) if t == expected => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
