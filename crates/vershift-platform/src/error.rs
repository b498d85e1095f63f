//! Platform collaborator error types.

use thiserror::Error;

/// Result type alias for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Errors surfaced by platform collaborators.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("platform unavailable: {0}")]
    Unavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl PlatformError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Unavailable(_))
    }
}
