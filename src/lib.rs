//! sandpool library
//!
//! Runs untrusted shell scripts in pre-warmed, locked-down containers, with
//! one pool per registered image and disposable containers for the rest.
//! Uploaded files are staged per request and copied into the container
//! workspace before execution.

use std::sync::Arc;
use std::time::Instant;

pub mod api;
pub mod config;
pub mod container;
pub mod error;
pub mod files;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod router;
pub mod runtime;

#[cfg(test)]
mod testing;

/// Application state shared across all handlers
pub struct AppState {
    pub config: config::AppConfig,
    pub router: router::PoolRouter,
    pub files: Arc<files::FileSessionManager>,
    pub started_at: Instant,
}
