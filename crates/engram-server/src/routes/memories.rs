//! Memory endpoints: direct store, fetch, delete, full pipeline store.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use engram_core::{DirectStoreInput, Turn};

use crate::error::{ApiError, ApiResult};
use crate::routes::ok;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct OwnerParams {
    pub user_id: String,
}

/// `POST /v1/memories/direct` — pre-formatted write
pub async fn direct(
    State(state): State<AppState>,
    Json(input): Json<DirectStoreInput>,
) -> ApiResult<Json<Value>> {
    let response = state.service.direct_store(input).await?;
    Ok(ok(json!({
        "memory_id": response.memory_id,
        "message": response.message,
        "storage": response.storage,
    })))
}

/// `GET /v1/memories/{id}?user_id=`
pub async fn get_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<OwnerParams>,
) -> ApiResult<Json<Value>> {
    let memory = state.service.get_memory(&id, &params.user_id)?;
    Ok(ok(json!({ "memory": memory })))
}

/// `DELETE /v1/memories/{id}?user_id=` — 403 on owner mismatch; deletes the
/// vector row, then best-effort typed rows per the routing flags.
pub async fn delete_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<OwnerParams>,
) -> ApiResult<Json<Value>> {
    let removed = state.service.delete_memory(&id, &params.user_id)?;
    Ok(ok(json!({
        "memory_id": id,
        "deleted": removed,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreBody {
    #[serde(alias = "user_id")]
    pub user_id: String,
    #[serde(alias = "turns")]
    pub history: Vec<Turn>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// `POST /v1/store` — full LLM pipeline
pub async fn store_pipeline(
    State(state): State<AppState>,
    Json(body): Json<StoreBody>,
) -> ApiResult<Json<Value>> {
    if body.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id is required"));
    }
    let outcome = state
        .service
        .store_conversation(&body.user_id, body.history, body.metadata)
        .await?;
    Ok(ok(json!({
        "counters": outcome.counters,
        "memoryIds": outcome.memory_ids,
        "worthy": outcome.worthy,
        "worthinessReason": outcome.worthiness_reason,
    })))
}
