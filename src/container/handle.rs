//! Container handles and their lifecycle

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::runtime::RuntimeGateway;

use super::profile::{SandboxProfile, LABEL_IMAGE, LABEL_POOL, LABEL_STATUS, LABEL_WORKSPACE};

/// Lifecycle state of a container handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Available,
    Leased,
    Destroyed,
}

/// A started sandbox container and the host workspace bound into it.
///
/// Handles are moved, never cloned: whoever holds one owns the container,
/// and [`destroy`] consumes it.
#[derive(Debug)]
pub struct ContainerHandle {
    pub id: String,
    pub image: String,
    pub workspace: PathBuf,
    state: ContainerState,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>, image: impl Into<String>, workspace: PathBuf) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            workspace,
            state: ContainerState::Created,
        }
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ContainerState) {
        self.state = state;
    }

    /// First 12 characters of the id, for logs
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

/// Who a container is created for; becomes its pool/status labels
#[derive(Debug, Clone, Copy)]
pub struct Provenance<'a> {
    pub pool: &'a str,
    pub status: &'a str,
}

/// Create a private workspace, then create and start a container bound to it.
///
/// Anything created before a failing step is torn down again.
pub async fn provision(
    runtime: &dyn RuntimeGateway,
    profile: &SandboxProfile,
    image: &str,
    provenance: Provenance<'_>,
    workspace_root: &Path,
) -> Result<ContainerHandle> {
    tokio::fs::create_dir_all(workspace_root).await?;
    let workspace = tempfile::Builder::new()
        .prefix("sandpool_ws_")
        .tempdir_in(workspace_root)?
        .into_path();

    let labels = HashMap::from([
        (LABEL_POOL.to_string(), provenance.pool.to_string()),
        (LABEL_STATUS.to_string(), provenance.status.to_string()),
        (LABEL_IMAGE.to_string(), image.to_string()),
        (LABEL_WORKSPACE.to_string(), workspace.display().to_string()),
    ]);
    let name = format!("sandpool-{}-{}", provenance.pool, &Uuid::new_v4().simple().to_string()[..12]);
    let spec = profile.container_spec(name, image, &workspace, labels);

    let id = match runtime.create_container(&spec).await {
        Ok(id) => id,
        Err(e) => {
            remove_workspace(&workspace).await;
            return Err(e.into());
        }
    };

    if let Err(e) = runtime.start_container(&id).await {
        if let Err(remove_err) = runtime.remove_container(&id, true).await {
            warn!(container_id = %id, error = %remove_err, "Failed to remove unstarted container");
        }
        remove_workspace(&workspace).await;
        return Err(e.into());
    }

    debug!(container_id = %id, image = %image, workspace = %workspace.display(), "Container started");
    Ok(ContainerHandle::new(id, image, workspace))
}

/// Tear a container down: workspace first, then stop and force-remove.
///
/// Best-effort; failures are logged and never returned.
pub async fn destroy(runtime: &dyn RuntimeGateway, mut handle: ContainerHandle, grace: Duration) {
    remove_workspace(&handle.workspace).await;

    if let Err(e) = runtime.stop_container(&handle.id, grace).await {
        warn!(container_id = %handle.short_id(), error = %e, "Failed to stop container (may already be stopped)");
    }
    if let Err(e) = runtime.remove_container(&handle.id, true).await {
        error!(container_id = %handle.short_id(), error = %e, "Failed to remove container");
    }

    handle.set_state(ContainerState::Destroyed);
    info!(container_id = %handle.short_id(), image = %handle.image, "Destroyed container");
}

pub(crate) async fn remove_workspace(workspace: &Path) {
    match tokio::fs::remove_dir_all(workspace).await {
        Ok(()) => debug!(workspace = %workspace.display(), "Cleaned up workspace"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!(workspace = %workspace.display(), error = %e, "Failed to clean up workspace"),
    }
}
