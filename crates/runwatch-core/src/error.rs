use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunwatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RunwatchError {
    /// Short error code string returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            RunwatchError::Config(_) => "CONFIG_ERROR",
            RunwatchError::Serialization(_) => "SERIALIZATION_ERROR",
            RunwatchError::Io(_) => "IO_ERROR",
            RunwatchError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RunwatchError>;
