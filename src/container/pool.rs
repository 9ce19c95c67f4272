//! Warm container pool for one image
//!
//! The pool keeps `target_size` started containers ready. A lease hands one
//! container to exactly one execution; releasing the lease destroys the
//! container and wakes the maintenance task, which creates a replacement.
//! Containers are never reused across executions.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SandboxError};
use crate::files::FileSessionManager;
use crate::metrics::{self, ExecutionStats};
use crate::models::{ExecutionRequest, ExecutionResult, PoolMetrics};
use crate::runtime::image::{self, PullPolicy};
use crate::runtime::RuntimeGateway;

use super::executor::ScriptExecutor;
use super::handle::{self, ContainerHandle, ContainerState, Provenance};
use super::profile::{SandboxProfile, LABEL_POOL};

/// Per-pool settings
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub name: String,
    pub image: String,
    pub target_size: usize,
    pub fallback_image: Option<String>,
    pub acquire_timeout: Duration,
    pub maintenance_interval: Duration,
    pub stop_grace: Duration,
    pub workspace_root: PathBuf,
    pub pull: PullPolicy,
}

/// Pool name used for an image's custom pool
pub fn custom_pool_name(image: &str) -> String {
    format!("custom-{}", image.replace([':', '/'], "-"))
}

pub struct ContainerPool {
    settings: PoolSettings,
    /// Image actually in use after registry qualification or fallback
    image: String,
    runtime: Arc<dyn RuntimeGateway>,
    profile: SandboxProfile,
    executor: ScriptExecutor,

    available: Mutex<VecDeque<ContainerHandle>>,
    /// One permit per container in `available`
    permits: Semaphore,
    /// Ids of containers currently handed out
    leased: std::sync::Mutex<HashSet<String>>,

    created: AtomicU64,
    destroyed: AtomicU64,
    stats: ExecutionStats,

    refill: Arc<Notify>,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerPool {
    /// Prepare the image, fill the pool and start maintenance.
    ///
    /// An image that cannot be pulled is replaced by the fallback image; if
    /// that fails too the pool does not start. Invalid names never fall back.
    pub async fn start(
        runtime: Arc<dyn RuntimeGateway>,
        profile: SandboxProfile,
        settings: PoolSettings,
    ) -> Result<Arc<Self>> {
        info!(pool = %settings.name, image = %settings.image, size = settings.target_size, "Starting container pool");

        let image = Self::prepare_image(runtime.as_ref(), &settings).await?;
        info!(pool = %settings.name, image = %image, "Using base image");

        let pool = Arc::new(Self {
            image,
            runtime,
            executor: ScriptExecutor::new(profile.shell()),
            profile,
            available: Mutex::new(VecDeque::with_capacity(settings.target_size)),
            permits: Semaphore::new(0),
            leased: std::sync::Mutex::new(HashSet::new()),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            stats: ExecutionStats::default(),
            refill: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
            settings,
        });

        pool.replenish().await;

        let task = tokio::spawn(maintenance_loop(
            Arc::downgrade(&pool),
            Arc::clone(&pool.refill),
            pool.shutdown.clone(),
            pool.settings.maintenance_interval,
        ));
        *pool.maintenance.lock().await = Some(task);

        Ok(pool)
    }

    async fn prepare_image(runtime: &dyn RuntimeGateway, settings: &PoolSettings) -> Result<String> {
        let err = match image::resolve_image(runtime, &settings.image, &settings.pull).await {
            Ok(image) => return Ok(image),
            Err(e @ SandboxError::InvalidImageName(_)) => return Err(e),
            Err(e) => e,
        };

        let Some(fallback) = settings.fallback_image.as_deref() else {
            return Err(err);
        };
        warn!(
            pool = %settings.name,
            image = %settings.image,
            fallback = %fallback,
            error = %err,
            "Could not prepare image, falling back"
        );

        image::validate_image_name(fallback)?;
        image::ensure_image(runtime, fallback, &settings.pull).await?;
        Ok(fallback.to_string())
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Containers ready to be leased
    pub async fn available_count(&self) -> usize {
        self.available.lock().await.len()
    }

    pub fn leased_count(&self) -> usize {
        self.leased_ids().len()
    }

    fn leased_ids(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.leased.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait up to `timeout` for a container.
    ///
    /// On timeout the pool is left exactly as it was.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<Lease> {
        if self.shutdown.is_cancelled() {
            return Err(SandboxError::PoolShutDown(self.settings.name.clone()));
        }

        let permit = match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(SandboxError::PoolShutDown(self.settings.name.clone())),
            Err(_) => {
                warn!(pool = %self.settings.name, waited = ?timeout, "No containers available in pool");
                return Err(SandboxError::PoolExhausted {
                    pool: self.settings.name.clone(),
                    waited: timeout,
                });
            }
        };
        // The container taken below carries the permit away with it
        permit.forget();

        let mut available = self.available.lock().await;
        let mut container = available.pop_front().ok_or_else(|| {
            SandboxError::ContainerLifecycle(format!(
                "pool {} granted a permit with no container queued",
                self.settings.name
            ))
        })?;
        container.set_state(ContainerState::Leased);
        self.leased_ids().insert(container.id.clone());
        drop(available);

        info!(pool = %self.settings.name, container_id = %container.short_id(), "Acquired container");
        Ok(Lease {
            pool: Arc::clone(self),
            container: Some(container),
        })
    }

    /// Run one request on a leased container, staging the request's files
    /// into its workspace first. The container is destroyed before returning.
    pub async fn execute(
        self: &Arc<Self>,
        request: &ExecutionRequest,
        files: &FileSessionManager,
        started: Instant,
    ) -> ExecutionResult {
        let result = match self.acquire(self.settings.acquire_timeout).await {
            Ok(lease) => {
                if let Some(session) = request.file_session {
                    if let Err(e) = files.copy_to_workspace(session, &lease.container().workspace).await {
                        warn!(pool = %self.settings.name, session_id = %session, error = %e, "Failed to copy session files");
                    }
                }

                let result = self
                    .executor
                    .execute(
                        self.runtime.as_ref(),
                        lease.container(),
                        &request.script,
                        request.stdin.as_deref(),
                        started,
                    )
                    .await;
                lease.release().await;
                result
            }
            Err(e) => e.into_result(started.elapsed()),
        };

        self.stats.record(result.success, result.execution_time);
        result
    }

    /// Destroy a container that came back from a lease
    async fn retire(&self, container: ContainerHandle) {
        let id = container.id.clone();
        handle::destroy(self.runtime.as_ref(), container, self.settings.stop_grace).await;
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        metrics::record_container_destroyed(&self.settings.name);

        self.leased_ids().remove(&id);
        self.refill.notify_one();
    }

    /// Create containers until available plus leased reaches the target.
    ///
    /// Creation failures are logged and leave the pool short until the
    /// next round.
    async fn replenish(&self) {
        let shortfall = {
            let available = self.available.lock().await;
            let in_use = available.len() + self.leased_count();
            self.settings.target_size.saturating_sub(in_use)
        };
        if shortfall == 0 {
            return;
        }

        info!(pool = %self.settings.name, shortfall, target = self.settings.target_size, "Pool below target, creating containers");
        for _ in 0..shortfall {
            if self.shutdown.is_cancelled() {
                return;
            }
            match self.create_container().await {
                Ok(mut container) => {
                    container.set_state(ContainerState::Available);
                    self.available.lock().await.push_back(container);
                    self.permits.add_permits(1);
                }
                Err(e) => error!(pool = %self.settings.name, error = %e, "Failed to create container"),
            }
        }
    }

    async fn create_container(&self) -> Result<ContainerHandle> {
        let container = handle::provision(
            self.runtime.as_ref(),
            &self.profile,
            &self.image,
            Provenance {
                pool: &self.settings.name,
                status: "available",
            },
            &self.settings.workspace_root,
        )
        .await?;

        self.created.fetch_add(1, Ordering::Relaxed);
        metrics::record_container_created(&self.settings.name);
        info!(pool = %self.settings.name, container_id = %container.short_id(), workspace = %container.workspace.display(), "Created container");
        Ok(container)
    }

    /// Stop maintenance, destroy idle containers, then sweep the runtime
    /// for anything else carrying this pool's label.
    pub async fn shutdown(&self) {
        info!(pool = %self.settings.name, "Shutting down container pool");
        self.shutdown.cancel();
        self.permits.close();

        if let Some(task) = self.maintenance.lock().await.take() {
            if let Err(e) = task.await {
                warn!(pool = %self.settings.name, error = %e, "Maintenance task ended abnormally");
            }
        }

        let drained: Vec<ContainerHandle> = self.available.lock().await.drain(..).collect();
        for container in drained {
            handle::destroy(self.runtime.as_ref(), container, self.settings.stop_grace).await;
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            metrics::record_container_destroyed(&self.settings.name);
        }

        let orphans = match self.runtime.list_containers(LABEL_POOL, &self.settings.name).await {
            Ok(orphans) => orphans,
            Err(e) => {
                warn!(pool = %self.settings.name, error = %e, "Failed to list pool containers for sweep");
                return;
            }
        };

        let leased = self.leased_ids().clone();
        for orphan in orphans.into_iter().filter(|c| !leased.contains(&c.id)) {
            let workspace = orphan
                .labels
                .get(super::profile::LABEL_WORKSPACE)
                .map(PathBuf::from)
                .unwrap_or_default();
            warn!(pool = %self.settings.name, container_id = %orphan.id, "Sweeping orphaned container");
            let container = ContainerHandle::new(orphan.id, self.image.clone(), workspace);
            handle::destroy(self.runtime.as_ref(), container, self.settings.stop_grace).await;
        }
    }

    pub async fn metrics(&self) -> PoolMetrics {
        let stats = self.stats.snapshot();
        PoolMetrics {
            pool_name: self.settings.name.clone(),
            image: self.image.clone(),
            pool_size: self.settings.target_size,
            available_containers: self.available_count().await,
            leased_containers: self.leased_count(),
            containers_created: self.created.load(Ordering::Relaxed),
            containers_destroyed: self.destroyed.load(Ordering::Relaxed),
            total_executions: stats.total,
            successful_executions: stats.succeeded,
            failed_executions: stats.failed,
            average_execution_time: stats.average_secs,
        }
    }
}

/// Single maintenance task per pool. Ticks and release notifications are
/// handled one at a time, so replenishment never overlaps itself.
async fn maintenance_loop(
    pool: Weak<ContainerPool>,
    refill: Arc<Notify>,
    shutdown: CancellationToken,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Maintenance stopped");
                return;
            }
            _ = refill.notified() => {}
            _ = interval.tick() => {}
        }

        match pool.upgrade() {
            Some(pool) => pool.replenish().await,
            None => return,
        }
    }
}

/// Exclusive use of one pooled container.
///
/// `release` destroys the container. Dropping a lease without releasing
/// it destroys the container on a spawned task instead.
pub struct Lease {
    pool: Arc<ContainerPool>,
    container: Option<ContainerHandle>,
}

impl Lease {
    pub fn container(&self) -> &ContainerHandle {
        self.container
            .as_ref()
            .expect("lease holds its container until released")
    }

    pub async fn release(mut self) {
        if let Some(container) = self.container.take() {
            self.pool.retire(container).await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(container) = self.container.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { pool.retire(container).await });
            }
            Err(_) => {
                error!(container_id = %container.id, "Lease dropped outside a runtime; container leaked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ContainerLimits};
    use crate::testing::FakeRuntime;

    fn settings(root: &std::path::Path, size: usize) -> PoolSettings {
        PoolSettings {
            name: "default".into(),
            image: "alpine:latest".into(),
            target_size: size,
            fallback_image: Some("alpine:latest".into()),
            acquire_timeout: Duration::from_secs(5),
            maintenance_interval: Duration::from_millis(50),
            stop_grace: Duration::from_secs(1),
            workspace_root: root.to_path_buf(),
            pull: PullPolicy {
                registry: String::new(),
                retries: 3,
                attempt_timeout: Duration::from_secs(5),
                backoff: Duration::from_millis(1),
            },
        }
    }

    fn profile() -> SandboxProfile {
        SandboxProfile::from_limits(&ContainerLimits::default()).unwrap()
    }

    fn files(root: &std::path::Path) -> FileSessionManager {
        let mut config = AppConfig::default();
        config.uploads.sessions_dir = Some(root.join("sessions"));
        FileSessionManager::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_start_fills_pool() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let pool = ContainerPool::start(runtime.clone(), profile(), settings(root.path(), 3))
            .await
            .unwrap();

        assert_eq!(pool.available_count().await, 3);
        assert_eq!(runtime.running(), 3);
        assert_eq!(pool.metrics().await.containers_created, 3);

        pool.shutdown().await;
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_when_image_cannot_be_pulled() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_pulls_of("python:3.12");
        let mut settings = settings(root.path(), 1);
        settings.image = "python:3.12".into();

        let pool = ContainerPool::start(runtime.clone(), profile(), settings).await.unwrap();
        assert_eq!(pool.image(), "alpine:latest");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_image_does_not_fall_back() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let mut settings = settings(root.path(), 1);
        settings.image = "Not Valid".into();

        let err = ContainerPool::start(runtime.clone(), profile(), settings).await.err().unwrap();
        assert!(matches!(err, SandboxError::InvalidImageName(_)));
        assert_eq!(runtime.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_acquire_timeout_leaves_pool_unchanged() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let pool = ContainerPool::start(runtime.clone(), profile(), settings(root.path(), 1))
            .await
            .unwrap();

        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.available_count().await, 0);

        let err = pool.acquire(Duration::from_millis(50)).await.err().unwrap();
        assert!(matches!(err, SandboxError::PoolExhausted { .. }));
        assert_eq!(pool.available_count().await, 0);
        assert_eq!(pool.leased_count(), 1);

        lease.release().await;
        pool.shutdown().await;
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn test_release_destroys_and_replaces() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let pool = ContainerPool::start(runtime.clone(), profile(), settings(root.path(), 1))
            .await
            .unwrap();

        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let first = lease.container().id.clone();
        let workspace = lease.container().workspace.clone();
        lease.release().await;
        assert!(!workspace.exists());

        let lease = pool.acquire(Duration::from_secs(2)).await.unwrap();
        assert_ne!(lease.container().id, first);
        lease.release().await;

        let metrics = pool.metrics().await;
        assert_eq!(metrics.containers_destroyed, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_maintenance_interval_still_replenishes() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let mut settings = settings(root.path(), 1);
        settings.maintenance_interval = Duration::ZERO;
        let pool = ContainerPool::start(runtime.clone(), profile(), settings)
            .await
            .unwrap();

        for _ in 0..3 {
            let lease = pool.acquire(Duration::from_secs(2)).await.unwrap();
            lease.release().await;
        }

        let task = pool.maintenance.lock().await.take().unwrap();
        assert!(!task.is_finished());
        *pool.maintenance.lock().await = Some(task);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_lease_is_still_destroyed() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let pool = ContainerPool::start(runtime.clone(), profile(), settings(root.path(), 1))
            .await
            .unwrap();

        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let id = lease.container().id.clone();
        drop(lease);

        tokio::time::timeout(Duration::from_secs(2), async {
            while runtime.is_running(&id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_executions_never_exceed_pool_size() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_exec_delay(Duration::from_millis(50));
        let pool = ContainerPool::start(runtime.clone(), profile(), settings(root.path(), 2))
            .await
            .unwrap();
        let files = Arc::new(files(root.path()));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let pool = pool.clone();
            let files = files.clone();
            tasks.push(tokio::spawn(async move {
                pool.execute(&ExecutionRequest::new("sleep 0.05"), &files, Instant::now())
                    .await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().success);
        }

        assert_eq!(runtime.peak_concurrent_execs(), 2);
        let metrics = pool.metrics().await;
        assert_eq!(metrics.total_executions, 3);
        assert_eq!(metrics.successful_executions, 3);

        pool.shutdown().await;
        let metrics = pool.metrics().await;
        assert_eq!(metrics.containers_created, metrics.containers_destroyed);
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_sweeps_orphans_but_not_live_leases() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let pool = ContainerPool::start(runtime.clone(), profile(), settings(root.path(), 1))
            .await
            .unwrap();
        let orphan = runtime.insert_labelled(LABEL_POOL, "default");
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let leased = lease.container().id.clone();

        pool.shutdown().await;
        assert!(!runtime.is_running(&orphan));
        assert!(runtime.is_running(&leased));

        lease.release().await;
        assert_eq!(runtime.running(), 0);
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)).await,
            Err(SandboxError::PoolShutDown(_))
        ));
    }

    #[test]
    fn test_custom_pool_name() {
        assert_eq!(custom_pool_name("python:3.12-slim"), "custom-python-3.12-slim");
        assert_eq!(custom_pool_name("library/node:20"), "custom-library-node-20");
    }
}
