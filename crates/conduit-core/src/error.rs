//! Error types for conduit.

use thiserror::Error;

use crate::models::{JobStatus, QuotaRejection};

/// Result type alias using conduit's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for conduit operations.
///
/// Admission errors (`QuotaExceeded`, `QueueSaturated`, `ShuttingDown`) are
/// surfaced synchronously to submitters and never retried internally.
/// Dependency failures are not represented here; see
/// [`InvokeError`](crate::models::InvokeError).
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    /// Tenant quota or rate limit rejected the admission
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(QuotaRejection),

    /// Queue is at its configured maximum size
    #[error("Queue saturated: capacity {capacity} reached")]
    QueueSaturated { capacity: usize },

    /// The orchestrator no longer accepts admissions
    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    /// Lifecycle state machine violation
    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persistence backend unavailable or failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code for the error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Database(_) => "DATABASE_ERROR",
            Error::NotFound(_) | Error::JobNotFound(_) => "NOT_FOUND",
            Error::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Error::QueueSaturated { .. } => "QUEUE_SATURATED",
            Error::ShuttingDown => "SHUTTING_DOWN",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether this error was raised at admission (before a job existed).
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            Error::QuotaExceeded(_) | Error::QueueSaturated { .. } | Error::ShuttingDown
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuotaRejectReason;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_error_display_job_not_found() {
        let id = Uuid::nil();
        let err = Error::JobNotFound(id);
        assert_eq!(err.to_string(), format!("Job not found: {}", id));
    }

    #[test]
    fn test_error_display_queue_saturated() {
        let err = Error::QueueSaturated { capacity: 10 };
        assert_eq!(err.to_string(), "Queue saturated: capacity 10 reached");
        assert_eq!(err.code(), "QUEUE_SATURATED");
    }

    #[test]
    fn test_error_display_quota_exceeded() {
        let err = Error::QuotaExceeded(QuotaRejection {
            reason: QuotaRejectReason::RateLimitExceeded,
            retry_after: Some(Duration::from_secs(12)),
        });
        assert!(err.to_string().contains("RATE_LIMIT_EXCEEDED"));
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = Error::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Running,
        };
        assert_eq!(err.to_string(), "Invalid job transition: completed -> running");
    }

    #[test]
    fn test_admission_errors() {
        assert!(Error::ShuttingDown.is_admission_error());
        assert!(Error::QueueSaturated { capacity: 1 }.is_admission_error());
        assert!(!Error::Storage("down".into()).is_admission_error());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.code(), "IO_ERROR");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
