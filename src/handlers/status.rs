// src/handlers/status.rs
//! Health endpoint: pool occupancy, configured collaborators, run counts

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use std::sync::Arc;

use crate::AppState;

/// GET /api/status
pub async fn api_status(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let (runs, batches) = state.runner.registry().counts().await;
    let artifacts = state.runner.store().len().await;
    let degraded = state.services.iter().any(|s| !s.configured);

    let response = serde_json::json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "pools": state.runner.scheduler().stats(),
        "services": state.services,
        "runs": runs,
        "batches": batches,
        "artifacts": artifacts,
    });
    (StatusCode::OK, Json(response))
}

pub fn status_routes() -> Router {
    Router::new().route("/api/status", get(api_status))
}
