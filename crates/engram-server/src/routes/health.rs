//! Health, stats and progress endpoints.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;

use crate::error::{ApiError, ApiResult};
use crate::routes::ok;
use crate::state::AppState;

/// `GET /health` — cheap liveness
pub async fn health() -> Json<Value> {
    ok(json!({
        "service": "engram",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /health/full` — per-store healthy/unhealthy with latency
pub async fn health_full(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let report = state.service.health_full();
    let status = if report.ok { "healthy" } else { "degraded" };
    Ok(Json(json!({
        "status": status,
        "stores": report.stores,
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

/// `GET /v1/progress` — background-work visibility
pub async fn progress(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let buffered = state.service.buffered_conversations().await;
    let last_maintenance = state
        .progress
        .last_maintenance_at
        .read()
        .ok()
        .and_then(|guard| *guard);
    Ok(ok(json!({
        "maintenanceRuns": state.progress.maintenance_runs.load(Ordering::Relaxed),
        "idleFlushes": state.progress.idle_flushes.load(Ordering::Relaxed),
        "pendingIntents": state.progress.pending_intents.load(Ordering::Relaxed),
        "lastMaintenanceAt": last_maintenance,
        "bufferedConversations": buffered,
        "uptimeSeconds": (chrono::Utc::now() - state.started_at).num_seconds(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub user_id: String,
}

/// `GET /v1/stats?user_id=` — per-user memory statistics
pub async fn stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> ApiResult<Json<Value>> {
    if params.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id is required"));
    }
    let stats = state.service.stats(&params.user_id)?;
    Ok(ok(serde_json::to_value(stats).map_err(|e| {
        ApiError::from(engram_core::EngramError::Internal(e.to_string()))
    })?))
}
