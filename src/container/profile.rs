//! Resource and security profile applied to every sandbox container

use std::collections::HashMap;
use std::path::Path;

use crate::config::{parse_memory_limit, ContainerLimits};
use crate::error::{Result, SandboxError};
use crate::runtime::{ContainerSpec, WorkspaceMount};

pub const LABEL_POOL: &str = "sandpool.pool";
pub const LABEL_STATUS: &str = "sandpool.status";
pub const LABEL_IMAGE: &str = "sandpool.image";
pub const LABEL_WORKSPACE: &str = "sandpool.workspace";

/// CFS period the CPU quota is expressed against
const CPU_PERIOD: i64 = 100_000;

/// Fixed sandbox profile derived once from configuration
#[derive(Debug, Clone)]
pub struct SandboxProfile {
    memory_bytes: i64,
    cpu_quota: i64,
    shell: String,
    workspace_mount: String,
    tmpfs_path: String,
    tmpfs_options: String,
    cap_add: Vec<String>,
}

impl SandboxProfile {
    pub fn from_limits(limits: &ContainerLimits) -> Result<Self> {
        let memory_bytes = parse_memory_limit(&limits.memory_limit)
            .map_err(|e| SandboxError::InvalidConfig(format!("memory_limit: {:#}", e)))?;
        if limits.cpu_limit <= 0.0 {
            return Err(SandboxError::InvalidConfig("cpu_limit must be positive".into()));
        }

        Ok(Self {
            memory_bytes,
            cpu_quota: (limits.cpu_limit * CPU_PERIOD as f64) as i64,
            shell: limits.shell.clone(),
            workspace_mount: limits.workspace_mount.clone(),
            tmpfs_path: limits.tmpfs_path.clone(),
            tmpfs_options: limits.tmpfs_options.clone(),
            cap_add: limits.cap_add.clone(),
        })
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Typed container description for one creation
    pub fn container_spec(
        &self,
        name: String,
        image: &str,
        workspace: &Path,
        labels: HashMap<String, String>,
    ) -> ContainerSpec {
        ContainerSpec {
            name,
            image: image.to_string(),
            entrypoint: vec![self.shell.clone()],
            interactive: true,
            memory_bytes: self.memory_bytes,
            cpu_quota: self.cpu_quota,
            cpu_period: CPU_PERIOD,
            network_disabled: true,
            tmpfs: HashMap::from([(self.tmpfs_path.clone(), self.tmpfs_options.clone())]),
            workspace: WorkspaceMount {
                host_path: workspace.to_path_buf(),
                container_path: self.workspace_mount.clone(),
            },
            no_new_privileges: true,
            cap_drop: vec!["ALL".to_string()],
            cap_add: self.cap_add.clone(),
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_profile() {
        let profile = SandboxProfile::from_limits(&ContainerLimits::default()).unwrap();
        let spec = profile.container_spec(
            "sandpool-default-abc".into(),
            "alpine:latest",
            Path::new("/tmp/ws"),
            HashMap::new(),
        );

        assert_eq!(spec.memory_bytes, 256 * 1024 * 1024);
        assert_eq!(spec.cpu_quota, 50_000);
        assert_eq!(spec.cpu_period, 100_000);
        assert_eq!(spec.entrypoint, vec!["/bin/sh".to_string()]);
        assert!(spec.network_disabled);
        assert!(spec.no_new_privileges);
        assert_eq!(spec.cap_drop, vec!["ALL".to_string()]);
        assert_eq!(
            spec.cap_add,
            vec!["CHOWN".to_string(), "SETUID".to_string(), "SETGID".to_string()]
        );
        assert_eq!(spec.tmpfs.get("/tmp").map(String::as_str), Some("size=100M"));
        assert_eq!(spec.workspace.bind(), "/tmp/ws:/workspace:rw");
    }

    #[test]
    fn test_rejects_bad_limits() {
        let limits = ContainerLimits {
            memory_limit: "lots".into(),
            ..Default::default()
        };
        assert!(matches!(
            SandboxProfile::from_limits(&limits),
            Err(SandboxError::InvalidConfig(_))
        ));
    }
}
