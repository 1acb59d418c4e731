//! Error types for hubcapture
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in the capture engine
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Capture job not found in the store
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Repository metadata not found
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Task dispatch to the execution fabric failed
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CaptureError {
    /// Missing jobs and repositories are user-facing and never retried.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound(_) | Self::RepositoryNotFound(_))
    }
}

/// Result type alias for capture engine operations
pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_not_found_error() {
        let err = CaptureError::JobNotFound("job-001".to_string());
        assert_eq!(err.to_string(), "Job not found: job-001");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_repository_not_found_error() {
        let err = CaptureError::RepositoryNotFound("octo/widgets".to_string());
        assert_eq!(err.to_string(), "Repository not found: octo/widgets");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_invalid_state_error() {
        let err = CaptureError::InvalidState("cannot resume completed backfill".to_string());
        assert_eq!(err.to_string(), "Invalid state: cannot resume completed backfill");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_dispatch_error() {
        let err = CaptureError::Dispatch("fabric unavailable".to_string());
        assert_eq!(err.to_string(), "Dispatch error: fabric unavailable");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CaptureError = io_err.into();
        assert!(matches!(err, CaptureError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: CaptureError = json_err.into();
        assert!(matches!(err, CaptureError::Json(_)));
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let err: CaptureError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, CaptureError::Sqlite(_)));
    }
}
