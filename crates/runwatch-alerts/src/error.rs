use thiserror::Error;

/// Errors raised by the alert store and the components built on it.
#[derive(Debug, Error)]
pub enum AlertError {
    /// Arm parameters were missing or invalid. Nothing was persisted.
    #[error("Invalid arm request: {0}")]
    Validation(String),

    /// The resource left `running` between the due-query and the send. The
    /// group has already been cancelled; callers treat this as handled.
    #[error("Resource {resource_id} in {region} is no longer running")]
    StaleState { resource_id: String, region: String },

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A previous holder of the connection lock panicked.
    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl AlertError {
    pub fn code(&self) -> &'static str {
        match self {
            AlertError::Validation(_) => "VALIDATION_ERROR",
            AlertError::StaleState { .. } => "STALE_STATE",
            AlertError::Database(_) => "STORE_ERROR",
            AlertError::Serialization(_) => "SERIALIZATION_ERROR",
            AlertError::LockPoisoned => "STORE_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, AlertError>;
