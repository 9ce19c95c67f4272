//! Multi-pool router
//!
//! Owns one pool per registered image plus the default pool, dispatches
//! requests to them, and runs requests for unregistered images on a
//! disposable container.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::container::handle::{self, ContainerHandle, Provenance};
use crate::container::{custom_pool_name, ContainerPool, PoolSettings, SandboxProfile, ScriptExecutor};
use crate::error::{Result, SandboxError};
use crate::files::FileSessionManager;
use crate::metrics::{self, ExecutionStats};
use crate::models::{ExecutionRequest, ExecutionResult, MetricsSnapshot};
use crate::runtime::image::{self, PullPolicy};
use crate::runtime::RuntimeGateway;

/// Pool label carried by disposable containers
const DISPOSABLE_POOL: &str = "disposable";

pub struct PoolRouter {
    runtime: Arc<dyn RuntimeGateway>,
    files: Arc<FileSessionManager>,
    /// Keyed by the configured image name
    pools: HashMap<String, Arc<ContainerPool>>,
    default_image: String,

    profile: SandboxProfile,
    executor: ScriptExecutor,
    pull: PullPolicy,
    workspace_root: PathBuf,
    stop_grace: Duration,

    stats: ExecutionStats,
    disposable_created: AtomicU64,
    disposable_destroyed: Arc<AtomicU64>,
}

impl PoolRouter {
    /// Start the default pool and every custom pool concurrently.
    ///
    /// If any pool fails to start, the ones that did are shut down again.
    pub async fn start(
        runtime: Arc<dyn RuntimeGateway>,
        files: Arc<FileSessionManager>,
        config: &AppConfig,
    ) -> Result<Self> {
        let profile = SandboxProfile::from_limits(&config.container)?;
        let pull = PullPolicy::from(&config.images);
        let workspace_root = config
            .container
            .workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("sandpool_workspaces"));
        let stop_grace = Duration::from_secs(config.runtime.stop_grace_seconds);

        let custom_pools = config
            .custom_pools()
            .map_err(|e| SandboxError::InvalidConfig(format!("{:#}", e)))?;

        let mut wanted = vec![(
            config.pools.default_image.clone(),
            "default".to_string(),
            config.pools.default_pool_size,
        )];
        for (image, size) in custom_pools {
            if image == config.pools.default_image {
                warn!(image = %image, "Custom pool duplicates the default image; ignoring");
                continue;
            }
            wanted.push((image.clone(), custom_pool_name(&image), size));
        }

        info!(pools = wanted.len(), "Initializing container pools");
        let starts = wanted.into_iter().map(|(image, name, size)| {
            let settings = PoolSettings {
                name,
                image: image.clone(),
                target_size: size,
                fallback_image: Some(config.pools.fallback_image.clone()),
                acquire_timeout: config.acquire_timeout(),
                maintenance_interval: config.maintenance_interval(),
                stop_grace,
                workspace_root: workspace_root.clone(),
                pull: pull.clone(),
            };
            let runtime = Arc::clone(&runtime);
            let profile = profile.clone();
            async move { (image, ContainerPool::start(runtime, profile, settings).await) }
        });

        let mut pools = HashMap::new();
        let mut failure = None;
        for (image, started) in join_all(starts).await {
            match started {
                Ok(pool) => {
                    pools.insert(image, pool);
                }
                Err(e) => {
                    error!(image = %image, error = %e, "Failed to start pool");
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            for pool in pools.values() {
                pool.shutdown().await;
            }
            return Err(e);
        }

        info!(pools = pools.len(), "Initialized container pools");
        Ok(Self {
            executor: ScriptExecutor::new(profile.shell()),
            runtime,
            files,
            pools,
            default_image: config.pools.default_image.clone(),
            profile,
            pull,
            workspace_root,
            stop_grace,
            stats: ExecutionStats::default(),
            disposable_created: AtomicU64::new(0),
            disposable_destroyed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Run a request. Never fails: every failure comes back as a result
    /// with `success = false`.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let image = request
            .image
            .clone()
            .unwrap_or_else(|| self.default_image.clone());

        let (route, result) = match self.pools.get(&image) {
            Some(pool) => {
                info!(image = %image, pool = %pool.name(), "Using pool for image");
                ("pool", pool.execute(&request, &self.files, started).await)
            }
            None => {
                info!(image = %image, "No pool for image, using a disposable container");
                let result = match self.execute_disposable(&request, &image, started).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(image = %image, error = %e, "Disposable execution failed");
                        e.into_result(started.elapsed())
                    }
                };
                ("disposable", result)
            }
        };

        self.stats.record(result.success, result.execution_time);
        metrics::record_execution(&image, route, result.execution_time, result.success);
        result
    }

    async fn execute_disposable(
        &self,
        request: &ExecutionRequest,
        image: &str,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let image = image::resolve_image(self.runtime.as_ref(), image, &self.pull).await?;

        let container = handle::provision(
            self.runtime.as_ref(),
            &self.profile,
            &image,
            Provenance {
                pool: DISPOSABLE_POOL,
                status: "disposable",
            },
            &self.workspace_root,
        )
        .await?;
        self.disposable_created.fetch_add(1, Ordering::Relaxed);
        metrics::record_container_created(DISPOSABLE_POOL);
        info!(container_id = %container.short_id(), image = %image, "Created disposable container");

        let container = Disposable {
            runtime: Arc::clone(&self.runtime),
            container: Some(container),
            grace: self.stop_grace,
            destroyed: Arc::clone(&self.disposable_destroyed),
        };

        if let Some(session) = request.file_session {
            if let Err(e) = self.files.copy_to_workspace(session, &container.get().workspace).await {
                warn!(session_id = %session, error = %e, "Failed to copy session files");
            }
        }

        let result = self
            .executor
            .execute(
                self.runtime.as_ref(),
                container.get(),
                &request.script,
                request.stdin.as_deref(),
                started,
            )
            .await;
        container.destroy().await;
        Ok(result)
    }

    pub fn pools_active(&self) -> usize {
        self.pools.len()
    }

    pub async fn total_available(&self) -> usize {
        let mut total = 0;
        for pool in self.pools.values() {
            total += pool.available_count().await;
        }
        total
    }

    /// Global counters plus a breakdown per registered image
    pub async fn metrics(&self) -> MetricsSnapshot {
        let global = self.stats.snapshot();
        let disposable_created = self.disposable_created.load(Ordering::Relaxed);
        let disposable_destroyed = self.disposable_destroyed.load(Ordering::Relaxed);

        let mut snapshot = MetricsSnapshot {
            total_executions: global.total,
            successful_executions: global.succeeded,
            failed_executions: global.failed,
            average_execution_time: global.average_secs,
            containers_created: disposable_created,
            containers_destroyed: disposable_destroyed,
            disposable_containers_created: disposable_created,
            disposable_containers_destroyed: disposable_destroyed,
            pools_active: self.pools.len(),
            total_available_containers: 0,
            pool_metrics: BTreeMap::new(),
        };

        for (image, pool) in &self.pools {
            let pool_metrics = pool.metrics().await;
            snapshot.containers_created += pool_metrics.containers_created;
            snapshot.containers_destroyed += pool_metrics.containers_destroyed;
            snapshot.total_available_containers += pool_metrics.available_containers;
            snapshot.pool_metrics.insert(image.clone(), pool_metrics);
        }
        snapshot
    }

    pub async fn shutdown(&self) {
        info!("Shutting down all container pools");
        join_all(self.pools.values().map(|pool| pool.shutdown())).await;
    }
}

/// A one-off container, destroyed on `destroy` or, failing that, on drop
struct Disposable {
    runtime: Arc<dyn RuntimeGateway>,
    container: Option<ContainerHandle>,
    grace: Duration,
    destroyed: Arc<AtomicU64>,
}

impl Disposable {
    fn get(&self) -> &ContainerHandle {
        self.container
            .as_ref()
            .expect("disposable container is held until destroyed")
    }

    async fn destroy(mut self) {
        if let Some(container) = self.container.take() {
            teardown(Arc::clone(&self.runtime), container, self.grace, Arc::clone(&self.destroyed)).await;
        }
    }
}

impl Drop for Disposable {
    fn drop(&mut self) {
        let Some(container) = self.container.take() else {
            return;
        };
        let task = teardown(
            Arc::clone(&self.runtime),
            container,
            self.grace,
            Arc::clone(&self.destroyed),
        );
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(task);
            }
            Err(_) => error!("Disposable container dropped outside a runtime; container leaked"),
        }
    }
}

async fn teardown(
    runtime: Arc<dyn RuntimeGateway>,
    container: ContainerHandle,
    grace: Duration,
    destroyed: Arc<AtomicU64>,
) {
    handle::destroy(runtime.as_ref(), container, grace).await;
    destroyed.fetch_add(1, Ordering::Relaxed);
    metrics::record_container_destroyed(DISPOSABLE_POOL);
}
