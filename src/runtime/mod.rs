//! Container runtime gateway
//!
//! The pools and the router only talk to the runtime through [`RuntimeGateway`],
//! so the Docker-backed implementation can be swapped for a fake in tests.

mod docker;
pub mod image;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use docker::DockerRuntime;

/// Errors reported by a runtime gateway
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime unreachable: {0}")]
    Unreachable(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
}

/// Fully-typed description of a sandbox container, built once per creation
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Entrypoint shell kept running so the container stays up for `exec`
    pub entrypoint: Vec<String>,
    /// Keep stdin open and allocate a tty for the entrypoint
    pub interactive: bool,
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub network_disabled: bool,
    /// Scratch tmpfs mounts, path -> options
    pub tmpfs: HashMap<String, String>,
    pub workspace: WorkspaceMount,
    pub no_new_privileges: bool,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Bind mount of an execution's workspace directory
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

impl WorkspaceMount {
    pub fn bind(&self) -> String {
        format!("{}:{}:rw", self.host_path.display(), self.container_path)
    }
}

/// A single command run inside a running container
#[derive(Debug, Clone, PartialEq)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub stdin: Option<String>,
}

/// Combined output and exit status of an exec
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub output: Vec<u8>,
    pub exit_code: Option<i64>,
}

/// A container found by a label query
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub labels: HashMap<String, String>,
}

/// Primitives of the container runtime consumed by pools and the router
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuntimeGateway: Send + Sync {
    /// Whether the image is present locally
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Pull an image from its registry
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Run one command, capturing combined output and the exit code
    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    /// All containers (running or not) carrying `key=value`
    async fn list_containers(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;
}
