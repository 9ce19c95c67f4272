//! Error taxonomy for pool, routing and file staging operations

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::models::ExecutionResult;
use crate::runtime::RuntimeError;

/// Errors raised by the sandbox core
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Container runtime unreachable: {0}")]
    RuntimeUnreachable(String),

    #[error("Failed to pull image {image} after {attempts} attempts: {reason}")]
    ImagePullFailed {
        image: String,
        attempts: u32,
        reason: String,
    },

    #[error("Invalid image name: {0}")]
    InvalidImageName(String),

    #[error("No containers available in pool {pool} after waiting {waited:?}")]
    PoolExhausted { pool: String, waited: Duration },

    #[error("Pool {0} is shut down")]
    PoolShutDown(String),

    #[error("File {name} is {size} bytes, exceeding the per-file limit of {limit} bytes")]
    FileTooLarge { name: String, size: u64, limit: u64 },

    #[error("Adding {name} would bring the session to {total} bytes, exceeding the limit of {limit} bytes")]
    TotalSizeExceeded { name: String, total: u64, limit: u64 },

    #[error("File {name} rejected: {reason}")]
    FileRejected { name: String, reason: String },

    #[error("Archive rejected as a ZIP bomb: {0}")]
    ZipBombDetected(String),

    #[error("Archive entry escapes the extraction directory: {0}")]
    ZipPathTraversal(String),

    #[error("Archive extraction exceeded {0:?}")]
    ZipExtractionTimeout(Duration),

    #[error("Archive contains {count} nested archives, limit is {limit}")]
    NestedArchiveLimitExceeded { count: usize, limit: usize },

    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    #[error("File session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Container lifecycle error: {0}")]
    ContainerLifecycle(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Short machine-readable tag, used for metrics labels and API error codes
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::RuntimeUnreachable(_) => "runtime_unreachable",
            SandboxError::ImagePullFailed { .. } => "image_pull_failed",
            SandboxError::InvalidImageName(_) => "invalid_image_name",
            SandboxError::PoolExhausted { .. } => "pool_exhausted",
            SandboxError::PoolShutDown(_) => "pool_shut_down",
            SandboxError::FileTooLarge { .. } => "file_too_large",
            SandboxError::TotalSizeExceeded { .. } => "total_size_exceeded",
            SandboxError::FileRejected { .. } => "file_rejected",
            SandboxError::ZipBombDetected(_) => "zip_bomb_detected",
            SandboxError::ZipPathTraversal(_) => "zip_path_traversal",
            SandboxError::ZipExtractionTimeout(_) => "zip_extraction_timeout",
            SandboxError::NestedArchiveLimitExceeded { .. } => "nested_archive_limit_exceeded",
            SandboxError::InvalidArchive(_) => "invalid_archive",
            SandboxError::SessionNotFound(_) => "session_not_found",
            SandboxError::ContainerLifecycle(_) => "container_lifecycle",
            SandboxError::Execution(_) => "execution",
            SandboxError::InvalidConfig(_) => "invalid_config",
            SandboxError::Io(_) => "io",
        }
    }

    /// Turn an error into the failed-execution shape returned to callers
    pub fn into_result(self, elapsed: Duration) -> ExecutionResult {
        ExecutionResult::failure(self.to_string(), elapsed)
    }
}

impl From<RuntimeError> for SandboxError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unreachable(msg) => SandboxError::RuntimeUnreachable(msg),
            other => SandboxError::ContainerLifecycle(other.to_string()),
        }
    }
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_result_shape() {
        let err = SandboxError::ImagePullFailed {
            image: "bad-registry.invalid/nope:latest".to_string(),
            attempts: 3,
            reason: "not found".to_string(),
        };
        let result = err.into_result(Duration::from_millis(1500));

        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("Failed to pull image"));
        assert_eq!(result.error.as_deref(), Some(result.stderr.as_str()));
        assert!((result.execution_time - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_runtime_error_conversion() {
        let err: SandboxError = RuntimeError::Unreachable("no socket".into()).into();
        assert_eq!(err.kind(), "runtime_unreachable");

        let err: SandboxError = RuntimeError::Api {
            operation: "stop",
            message: "boom".into(),
        }
        .into();
        assert_eq!(err.kind(), "container_lifecycle");
    }
}
