//! Maintenance endpoints.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use engram_core::MaintenanceJob;

use crate::error::{ApiError, ApiResult};
use crate::routes::ok;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceBody {
    #[serde(alias = "user_id")]
    pub user_id: String,
    /// Job names; omitted means the full sweep
    #[serde(default)]
    pub jobs: Vec<String>,
}

/// `POST /v1/maintenance` — run jobs for one user (on-demand)
pub async fn run(
    State(state): State<AppState>,
    Json(body): Json<MaintenanceBody>,
) -> ApiResult<Json<Value>> {
    let jobs = if body.jobs.is_empty() {
        MaintenanceJob::all()
    } else {
        body.jobs
            .iter()
            .map(|name| {
                MaintenanceJob::parse_name(name)
                    .ok_or_else(|| ApiError::bad_request(format!("unknown job: {name}")))
            })
            .collect::<ApiResult<Vec<_>>>()?
    };
    let report = state.service.run_maintenance(&body.user_id, &jobs).await?;
    state.progress.record_maintenance(chrono::Utc::now());
    Ok(ok(serde_json::to_value(report).map_err(internal)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactBody {
    #[serde(alias = "user_id")]
    pub user_id: String,
}

/// `POST /v1/maintenance/compact` — dedup one user
pub async fn compact(
    State(state): State<AppState>,
    Json(body): Json<CompactBody>,
) -> ApiResult<Json<Value>> {
    let report = state.service.compact(&body.user_id).await?;
    Ok(ok(serde_json::to_value(report).map_err(internal)?))
}

/// `POST /v1/maintenance/compact_all` — dedup every known user
pub async fn compact_all(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let reports = state.service.compact_all().await?;
    Ok(ok(json!({ "reports": reports })))
}

/// `POST /v1/maintenance/unlock` — stale-lock recovery
pub async fn force_unlock(
    State(state): State<AppState>,
    Json(body): Json<CompactBody>,
) -> ApiResult<Json<Value>> {
    state.service.maintenance_force_unlock(&body.user_id)?;
    Ok(ok(json!({ "unlocked": body.user_id })))
}

fn internal(e: serde_json::Error) -> ApiError {
    ApiError::from(engram_core::EngramError::Internal(e.to_string()))
}
