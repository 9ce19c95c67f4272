//! Docker Engine gateway backed by bollard

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;

use super::{
    ContainerSpec, ContainerSummary, ExecOutput, ExecRequest, RuntimeError, RuntimeGateway,
};

/// Gateway to a local Docker-compatible engine
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the environment defaults, then each configured socket.
    ///
    /// Every candidate is pinged; the first that answers wins.
    pub async fn connect(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let mut failures = Vec::new();

        match Docker::connect_with_local_defaults() {
            Ok(docker) => match docker.ping().await {
                Ok(_) => {
                    info!("Connected to container runtime using local defaults");
                    return Ok(Self { docker });
                }
                Err(e) => failures.push(format!("local defaults: {}", e)),
            },
            Err(e) => failures.push(format!("local defaults: {}", e)),
        }

        for path in &config.socket_paths {
            let socket = path.as_str();
            debug!(socket = %socket, "Trying container runtime socket");
            let docker = match Docker::connect_with_unix(
                socket,
                config.connect_timeout_seconds,
                API_DEFAULT_VERSION,
            ) {
                Ok(docker) => docker,
                Err(e) => {
                    failures.push(format!("{}: {}", socket, e));
                    continue;
                }
            };

            match docker.ping().await {
                Ok(_) => {
                    info!(socket = %socket, "Connected to container runtime");
                    return Ok(Self { docker });
                }
                Err(e) => failures.push(format!("{}: {}", socket, e)),
            }
        }

        Err(RuntimeError::Unreachable(failures.join("; ")))
    }
}

fn api_error(operation: &'static str) -> impl FnOnce(bollard::errors::Error) -> RuntimeError {
    move |e| match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::ContainerNotFound(message),
        other => RuntimeError::Api {
            operation,
            message: other.to_string(),
        },
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let host_config = HostConfig {
        memory: Some(spec.memory_bytes),
        cpu_quota: Some(spec.cpu_quota),
        cpu_period: Some(spec.cpu_period),
        binds: Some(vec![spec.workspace.bind()]),
        tmpfs: Some(spec.tmpfs.clone()),
        network_mode: spec.network_disabled.then(|| "none".to_string()),
        security_opt: spec
            .no_new_privileges
            .then(|| vec!["no-new-privileges:true".to_string()]),
        cap_drop: Some(spec.cap_drop.clone()),
        cap_add: Some(spec.cap_add.clone()),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        entrypoint: Some(spec.entrypoint.clone()),
        open_stdin: Some(spec.interactive),
        tty: Some(spec.interactive),
        network_disabled: Some(spec.network_disabled),
        working_dir: Some(spec.workspace.container_path.clone()),
        labels: Some(spec.labels.clone()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl RuntimeGateway for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::Api {
                operation: "inspect image",
                message: e.to_string(),
            }),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let options = CreateImageOptions::<String> {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %image, status = %status, "Pull progress");
                    }
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    message,
                }) => return Err(RuntimeError::ImageNotFound(message)),
                Err(e) => {
                    return Err(RuntimeError::Api {
                        operation: "pull image",
                        message: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| RuntimeError::Api {
                operation: "create container",
                message: e.to_string(),
            })?;

        for warning in &response.warnings {
            warn!(container_id = %response.id, warning = %warning, "Runtime warning on create");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(api_error("start container"))
    }

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError> {
        let options = CreateExecOptions::<String> {
            cmd: Some(request.command.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            attach_stdin: Some(request.stdin.is_some()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(api_error("create exec"))?;

        let mut collected = Vec::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(api_error("start exec"))?
        {
            StartExecResults::Attached { mut output, mut input } => {
                if let Some(stdin) = &request.stdin {
                    input
                        .write_all(stdin.as_bytes())
                        .await
                        .map_err(|e| RuntimeError::Api {
                            operation: "write exec stdin",
                            message: e.to_string(),
                        })?;
                }
                // Close stdin so readers see EOF
                let _ = input.shutdown().await;

                while let Some(chunk) = output.next().await {
                    match chunk.map_err(api_error("read exec output"))? {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message } => collected.extend_from_slice(&message),
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Api {
                    operation: "start exec",
                    message: "exec started detached".to_string(),
                })
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(api_error("inspect exec"))?;

        Ok(ExecOutput {
            output: collected,
            exit_code: inspect.exit_code,
        })
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .map_err(api_error("stop container"))
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(api_error("remove container"))
    }

    async fn list_containers(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", label_key, label_value)],
        );

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(api_error("list containers"))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                c.id.map(|id| ContainerSummary {
                    id,
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }
}
