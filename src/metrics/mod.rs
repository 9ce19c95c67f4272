//! Execution statistics and Prometheus metrics export

use std::sync::Mutex;

use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// Prometheus metrics recorder
static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Running execution counters with an incrementally updated mean.
///
/// The mean is updated as `avg += (x - avg) / n`; no history is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub average_secs: f64,
}

impl RunningStats {
    pub fn record(&mut self, success: bool, duration_secs: f64) {
        self.total += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.average_secs += (duration_secs - self.average_secs) / self.total as f64;
    }
}

/// Thread-safe wrapper so concurrent callers never lose an update
#[derive(Debug, Default)]
pub struct ExecutionStats {
    inner: Mutex<RunningStats>,
}

impl ExecutionStats {
    pub fn record(&self, success: bool, duration_secs: f64) {
        let mut stats = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        stats.record(success, duration_secs);
    }

    pub fn snapshot(&self) -> RunningStats {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Install the Prometheus recorder
pub fn init_metrics() -> Result<()> {
    METRICS_HANDLE.get_or_try_init(|| -> Result<PrometheusHandle> {
        PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("sandpool_execution_duration_seconds".to_string()),
                &[0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            )
            .context("Invalid histogram buckets")?
            .install_recorder()
            .context("Failed to install Prometheus recorder")
    })?;
    Ok(())
}

/// Record an execution
pub fn record_execution(image: &str, route: &'static str, duration_secs: f64, success: bool) {
    counter!("sandpool_executions_total", "image" => image.to_string(), "route" => route).increment(1);

    if !success {
        counter!("sandpool_executions_failed_total", "image" => image.to_string(), "route" => route).increment(1);
    }

    histogram!("sandpool_execution_duration_seconds", "route" => route).record(duration_secs);
}

/// Record a container creation
pub fn record_container_created(pool: &str) {
    counter!("sandpool_containers_created_total", "pool" => pool.to_string()).increment(1);
}

/// Record a container destruction
pub fn record_container_destroyed(pool: &str) {
    counter!("sandpool_containers_destroyed_total", "pool" => pool.to_string()).increment(1);
}

/// Record a rejected attachment
pub fn record_upload_rejected(reason: &'static str) {
    counter!("sandpool_uploads_rejected_total", "reason" => reason).increment(1);
}

/// Prometheus metrics endpoint handler
pub async fn prometheus_handler() -> impl IntoResponse {
    match METRICS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("Content-Type", "text/plain; version=0.0.4")],
            "metrics recorder not installed\n".to_string(),
        ),
    }
}
