// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PressqError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed job: {0}")]
    MalformedJob(String),

    #[error("Handler failed: {0}")]
    HandlerFailure(#[from] anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<redis::RedisError> for PressqError {
    fn from(err: redis::RedisError) -> Self {
        PressqError::StoreUnavailable(err.to_string())
    }
}

impl PressqError {
    /// True for failures of the store itself, which callers may retry.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, PressqError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, PressqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_errors_map_to_store_unavailable() {
        let err: PressqError =
            redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into();
        assert!(err.is_store_unavailable());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn handler_errors_keep_their_message() {
        let err: PressqError = anyhow::anyhow!("smtp down").into();
        assert!(!err.is_store_unavailable());
        assert_eq!(err.to_string(), "Handler failed: smtp down");
    }
}
