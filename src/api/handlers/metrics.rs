//! Execution metrics handler

use std::sync::Arc;

use axum::{extract::State, Json};

use crate::models::MetricsSnapshot;
use crate::AppState;

/// Router-wide statistics with a per-pool breakdown
pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.router.metrics().await)
}
