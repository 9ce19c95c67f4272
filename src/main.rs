//! sandpool - pooled sandbox execution service
//!
//! Connects to the container runtime, warms the configured pools and serves
//! the execution API until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sandpool::api::create_router;
use sandpool::config::AppConfig;
use sandpool::files::FileSessionManager;
use sandpool::logging::init_logging;
use sandpool::router::PoolRouter;
use sandpool::runtime::DockerRuntime;
use sandpool::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    init_logging(&config.log_level, config.log_dir.as_deref())?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting sandpool");

    // Initialize metrics system
    sandpool::metrics::init_metrics()?;
    info!("Prometheus metrics initialized");

    // Connect to the container runtime; nothing works without it
    let runtime = DockerRuntime::connect(&config.runtime)
        .await
        .context("Failed to connect to the container runtime")?;

    let files = Arc::new(
        FileSessionManager::new(&config).context("Failed to prepare the sessions directory")?,
    );

    let router = PoolRouter::start(Arc::new(runtime), files.clone(), &config)
        .await
        .context("Failed to start container pools")?;

    let state = Arc::new(AppState {
        config: config.clone(),
        router,
        files: files.clone(),
        started_at: Instant::now(),
    });

    // Sweep file sessions leaked by aborted requests
    let sweeper_stop = CancellationToken::new();
    let sweeper = tokio::spawn({
        let files = files.clone();
        let stop = sweeper_stop.clone();
        let max_age = config.session_max_age();
        let period = Duration::from_secs(config.uploads.session_sweep_interval_seconds.max(1));
        async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        files.cleanup_old_sessions(max_age).await;
                    }
                }
            }
        }
    });

    let app = create_router(state.clone());

    // Bind to address
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, "Listening on");

    // Start server with graceful shutdown
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Shutting down...");

    sweeper_stop.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Session sweeper ended abnormally");
    }

    state.router.shutdown().await;

    let leftover = files.cleanup_old_sessions(Duration::ZERO).await;
    if leftover > 0 {
        warn!(sessions = leftover, "Removed file sessions still open at shutdown");
    }

    if let Err(e) = served {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("sandpool stopped");
    Ok(())
}

/// Handle shutdown signals gracefully
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
