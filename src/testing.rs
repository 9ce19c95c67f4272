//! In-memory runtime gateway for tests

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::runtime::{
    ContainerSpec, ContainerSummary, ExecOutput, ExecRequest, RuntimeError, RuntimeGateway,
};

type ExecHandler = Arc<dyn Fn(&Path, &ExecRequest) -> Result<ExecOutput, RuntimeError> + Send + Sync>;

struct FakeContainer {
    labels: HashMap<String, String>,
    workspace: PathBuf,
}

#[derive(Default)]
struct State {
    images: HashSet<String>,
    failing_pulls: HashSet<String>,
    pull_attempts: HashMap<String, usize>,
    containers: HashMap<String, FakeContainer>,
    fail_starts: bool,
    exec_delay: Duration,
    handler: Option<ExecHandler>,
}

/// Records every call; containers exist from create until remove
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
    calls: AtomicUsize,
    created: AtomicUsize,
    next_id: AtomicUsize,
    execs_in_flight: AtomicUsize,
    peak_execs: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn fail_pulls_of(&self, image: &str) {
        self.state().failing_pulls.insert(image.to_string());
    }

    pub fn fail_starts(&self, fail: bool) {
        self.state().fail_starts = fail;
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        self.state().exec_delay = delay;
    }

    /// Replace the default exec behavior (empty output, exit 0). The handler
    /// receives the container's host workspace.
    pub fn set_exec_handler(
        &self,
        handler: impl Fn(&Path, &ExecRequest) -> Result<ExecOutput, RuntimeError> + Send + Sync + 'static,
    ) {
        self.state().handler = Some(Arc::new(handler));
    }

    /// Register a container that this process did not create
    pub fn insert_labelled(&self, key: &str, value: &str) -> String {
        let id = format!("external{:08}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.state().containers.insert(
            id.clone(),
            FakeContainer {
                labels: HashMap::from([(key.to_string(), value.to_string())]),
                workspace: PathBuf::new(),
            },
        );
        id
    }

    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Containers created and not yet removed
    pub fn running(&self) -> usize {
        self.state().containers.len()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state().containers.contains_key(id)
    }

    pub fn pull_attempts(&self, image: &str) -> usize {
        self.state().pull_attempts.get(image).copied().unwrap_or(0)
    }

    pub fn peak_concurrent_execs(&self) -> usize {
        self.peak_execs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeGateway for FakeRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        self.call();
        Ok(self.state().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.call();
        let mut state = self.state();
        *state.pull_attempts.entry(image.to_string()).or_default() += 1;
        if state.failing_pulls.contains(image) {
            return Err(RuntimeError::Api {
                operation: "pull image",
                message: format!("pull access denied for {}", image),
            });
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.call();
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.state().containers.insert(
            id.clone(),
            FakeContainer {
                labels: spec.labels.clone(),
                workspace: spec.workspace.host_path.clone(),
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.call();
        if self.state().fail_starts {
            return Err(RuntimeError::Api {
                operation: "start container",
                message: format!("cannot start {}", id),
            });
        }
        Ok(())
    }

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError> {
        self.call();
        let (workspace, delay, handler) = {
            let state = self.state();
            let container = state
                .containers
                .get(id)
                .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
            (container.workspace.clone(), state.exec_delay, state.handler.clone())
        };

        let now = self.execs_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_execs.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        self.execs_in_flight.fetch_sub(1, Ordering::SeqCst);

        match handler {
            Some(handler) => handler(&workspace, request),
            None => Ok(ExecOutput {
                output: Vec::new(),
                exit_code: Some(0),
            }),
        }
    }

    async fn stop_container(&self, _id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.call();
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), RuntimeError> {
        self.call();
        match self.state().containers.remove(id) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::ContainerNotFound(id.to_string())),
        }
    }

    async fn list_containers(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.call();
        Ok(self
            .state()
            .containers
            .iter()
            .filter(|(_, c)| c.labels.get(label_key).map(String::as_str) == Some(label_value))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                labels: c.labels.clone(),
            })
            .collect())
    }
}
