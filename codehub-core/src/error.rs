use thiserror::Error;

use crate::retry::ErrorClass;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("runtime operation failed: {0}")]
    Runtime(String),

    #[error("circuit open for {service}, retry after {retry_after_secs:.1}s")]
    CircuitOpen {
        service: String,
        retry_after_secs: f64,
    },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Retryable vs. not, through the same classifier the Proxy uses on
    /// HTTP status codes (spec §7: "a common helper so that WC, Scheduler,
    /// and Proxy all agree on what is retryable"). `Database`/`Redis`/
    /// `Runtime`/`Timeout` are connection- or dependency-level failures a
    /// retry can plausibly outlive; `Serialization`/`InvalidState`/
    /// `Internal` are logic errors no retry would fix, and `CircuitOpen` is
    /// already the fail-fast outcome, not something to loop on.
    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::Database(_) | CoreError::Redis(_) | CoreError::Runtime(_) | CoreError::Timeout(_) => {
                ErrorClass::Transient
            }
            CoreError::Serialization(_)
            | CoreError::CircuitOpen { .. }
            | CoreError::InvalidState(_)
            | CoreError::Internal(_) => ErrorClass::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
