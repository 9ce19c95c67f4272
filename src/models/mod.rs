//! Data models for sandpool
//!
//! This module defines all request/response types and internal data structures.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Execution Models
// ============================================================================

/// A script to run, optionally against a specific image and staged files
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    /// Shell script, run as a single `sh -c` invocation
    pub script: String,

    /// Data fed to the script's standard input
    pub stdin: Option<String>,

    /// Image to run in; the default pool when absent
    pub image: Option<String>,

    /// File session whose contents are staged into the workspace
    pub file_session: Option<Uuid>,
}

impl ExecutionRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_file_session(mut self, session: Uuid) -> Self {
        self.file_session = Some(session);
        self
    }
}

/// Outcome of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// True only when the script exited with status 0
    pub success: bool,

    /// Combined output of the script
    #[serde(default)]
    pub stdout: String,

    /// Protocol-level failure description (empty for normal exits)
    #[serde(default)]
    pub stderr: String,

    /// Script exit code, or -1 when the script never ran to completion
    pub exit_code: i64,

    /// Wall time from request acceptance to result, in seconds
    pub execution_time: f64,

    /// Set only for failures of the execution machinery itself
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Result of a script that ran to completion, whatever its exit code
    pub fn completed(stdout: String, exit_code: i64, elapsed: Duration) -> Self {
        Self {
            success: exit_code == 0,
            stdout,
            stderr: String::new(),
            exit_code,
            execution_time: elapsed.as_secs_f64(),
            error: None,
        }
    }

    /// Result of a failure outside the script
    pub fn failure(message: String, elapsed: Duration) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.clone(),
            exit_code: -1,
            execution_time: elapsed.as_secs_f64(),
            error: Some(message),
        }
    }
}

// ============================================================================
// Metrics Models
// ============================================================================

/// Per-pool statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub pool_name: String,
    pub image: String,
    pub pool_size: usize,
    pub available_containers: usize,
    pub leased_containers: usize,
    pub containers_created: u64,
    pub containers_destroyed: u64,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub average_execution_time: f64,
}

/// Router-wide statistics with a breakdown per registered image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub average_execution_time: f64,
    pub containers_created: u64,
    pub containers_destroyed: u64,
    pub disposable_containers_created: u64,
    pub disposable_containers_destroyed: u64,
    pub pools_active: usize,
    pub total_available_containers: usize,
    pub pool_metrics: BTreeMap<String, PoolMetrics>,
}

// ============================================================================
// File Session Models
// ============================================================================

/// Kind of a staged entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEntryKind {
    Regular,
    ZipArchive,
}

/// Summary of one staged entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntryInfo {
    pub name: String,
    pub original_name: String,
    pub kind: FileEntryKind,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extracted_files: Vec<String>,
}

/// Summary of a file session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub total_size_bytes: u64,
    pub entries: Vec<FileEntryInfo>,
}

/// Archive breakdown attached to an execute response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveExtraction {
    pub archive: String,
    pub extracted_count: usize,
    pub extracted_files: Vec<String>,
}

// ============================================================================
// API Models
// ============================================================================

/// A base64-encoded attachment in a JSON execute request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttachment {
    pub filename: String,
    /// Base64-encoded content
    pub content: String,
}

/// JSON body of `POST /execute`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequestBody {
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub files: Vec<FileAttachment>,
}

/// Response of `POST /execute`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(flatten)]
    pub result: ExecutionResult,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_attached: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_file_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archive_extractions: Vec<ArchiveExtraction>,
}

impl ExecuteResponse {
    /// Attach the staged-file summary of a session
    pub fn with_session(mut self, info: &SessionInfo) -> Self {
        for entry in &info.entries {
            match entry.kind {
                FileEntryKind::Regular => self.files_attached.push(entry.name.clone()),
                FileEntryKind::ZipArchive => {
                    self.files_attached.push(format!(
                        "{} (ZIP - {} files extracted)",
                        entry.original_name,
                        entry.extracted_files.len()
                    ));
                    self.archive_extractions.push(ArchiveExtraction {
                        archive: entry.original_name.clone(),
                        extracted_count: entry.extracted_files.len(),
                        extracted_files: entry.extracted_files.clone(),
                    });
                }
            }
        }
        self.total_file_size = Some(info.total_size_bytes);
        self
    }
}

impl From<ExecutionResult> for ExecuteResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            result,
            files_attached: vec![],
            total_file_size: None,
            archive_extractions: vec![],
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub pools_active: usize,
    pub available_containers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_nonzero_exit_is_not_an_error() {
        let result = ExecutionResult::completed(String::new(), 42, Duration::from_millis(10));
        assert!(!result.success);
        assert_eq!(result.exit_code, 42);
        assert_eq!(result.error, None);
    }

    #[test]
    fn test_response_includes_archive_breakdown() {
        let info = SessionInfo {
            session_id: Uuid::new_v4(),
            created_at: Utc::now(),
            total_size_bytes: 30,
            entries: vec![
                FileEntryInfo {
                    name: "data.csv".into(),
                    original_name: "data.csv".into(),
                    kind: FileEntryKind::Regular,
                    size_bytes: 10,
                    extracted_files: vec![],
                },
                FileEntryInfo {
                    name: "bundle.zip_extracted".into(),
                    original_name: "bundle.zip".into(),
                    kind: FileEntryKind::ZipArchive,
                    size_bytes: 20,
                    extracted_files: vec!["a.txt".into(), "src/b.py".into()],
                },
            ],
        };

        let response = ExecuteResponse::from(ExecutionResult::completed(
            "ok".into(),
            0,
            Duration::from_secs(1),
        ))
        .with_session(&info);

        assert_eq!(
            response.files_attached,
            vec![
                "data.csv".to_string(),
                "bundle.zip (ZIP - 2 files extracted)".to_string()
            ]
        );
        assert_eq!(response.total_file_size, Some(30));
        assert_eq!(response.archive_extractions.len(), 1);
        assert_eq!(response.archive_extractions[0].extracted_count, 2);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], serde_json::json!(true));
        assert_eq!(json["stdout"], serde_json::json!("ok"));
    }
}
