use thiserror::Error;

#[derive(Debug, Error)]
pub enum CountdownError {
    #[error("Invalid countdown duration: {0}")]
    InvalidDuration(String),

    #[error("Countdown storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Countdown storage lock poisoned")]
    LockPoisoned,
}

impl CountdownError {
    pub fn code(&self) -> &'static str {
        match self {
            CountdownError::InvalidDuration(_) => "INVALID_DURATION",
            CountdownError::Storage(_) => "STORAGE_ERROR",
            CountdownError::LockPoisoned => "LOCK_POISONED",
        }
    }
}

pub type Result<T> = std::result::Result<T, CountdownError>;
