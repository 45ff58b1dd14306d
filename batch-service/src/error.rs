// Service Errors
// Crate-level error type for I/O, job parsing and store access

use std::io;
use thiserror::Error;

/// Result alias used by the service-level APIs
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors raised outside of task execution (daemon, registry, store, parsing)
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid job descriptor at line {line}: {message}")]
    InvalidJob { line: usize, message: String },

    #[error("Store '{name}' could not be opened in {dir}")]
    StoreUnavailable { name: String, dir: String },

    #[error("Run error: {0}")]
    Run(String),
}

impl ServiceError {
    pub fn invalid_job(line: usize, message: impl Into<String>) -> Self {
        Self::InvalidJob {
            line,
            message: message.into(),
        }
    }
}
