use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue, bus and limiter operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// The backing store could not be reached or rejected the command.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("No handler registered for [{0}]")]
    UnresolvedHandler(String),

    #[error("Runtime configuration error: {0}")]
    RuntimeConfiguration(String),

    #[error("Limiter [{name}] could not acquire a slot within {waited:?}")]
    LimiterTimeout { name: String, waited: Duration },

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    /// A job handler failed; the job was released or marked as failed before
    /// this error was returned to the supervisor.
    #[error("Job {job_id} failed: {error}")]
    JobFailed {
        job_id: String,
        error: Arc<anyhow::Error>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Wrap a handler failure for the given job
    pub fn job_failed(job_id: impl Into<String>, error: Arc<anyhow::Error>) -> Self {
        Self::JobFailed {
            job_id: job_id.into(),
            error,
        }
    }

    /// Check if this is a transport failure (retry policy belongs to the caller)
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    /// Check if this is a limiter timeout
    pub fn is_limiter_timeout(&self) -> bool {
        matches!(self, Self::LimiterTimeout { .. })
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Connectivity(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_failed_keeps_original_error() {
        let original = Arc::new(anyhow::anyhow!("boom"));
        let err = QueueError::job_failed("abc", original.clone());

        match err {
            QueueError::JobFailed { job_id, error } => {
                assert_eq!(job_id, "abc");
                assert!(Arc::ptr_eq(&error, &original));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_serde_errors_are_invalid_payloads() {
        let err: QueueError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, QueueError::InvalidPayload(_)));
    }
}
