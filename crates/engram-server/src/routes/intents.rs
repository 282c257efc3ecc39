//! Scheduled-intent endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use engram_core::{CreateIntentInput, FireOutcome, FireRequest, UpdateIntentInput};

use crate::error::{ApiError, ApiResult};
use crate::routes::ok;
use crate::state::AppState;

/// `POST /v1/intents`
pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<CreateIntentInput>,
) -> ApiResult<Json<Value>> {
    let intent = state.service.intent_create(input)?;
    Ok(ok(json!({ "intent": intent })))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub user_id: Option<String>,
    pub include_disabled: Option<bool>,
}

/// `GET /v1/intents`
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Value>> {
    let intents = state.service.intent_list(
        params.user_id.as_deref(),
        params.include_disabled.unwrap_or(true),
    )?;
    Ok(ok(json!({
        "total": intents.len(),
        "intents": intents,
    })))
}

/// `GET /v1/intents/{id}`
pub async fn get_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let intent = state.service.intent_get(&id)?;
    Ok(ok(json!({ "intent": intent })))
}

/// `PATCH /v1/intents/{id}`
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<UpdateIntentInput>,
) -> ApiResult<Json<Value>> {
    let intent = state.service.intent_update(&id, patch)?;
    Ok(ok(json!({ "intent": intent })))
}

/// `DELETE /v1/intents/{id}` — destroys the intent; audit rows remain
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let deleted = state.service.intent_delete(&id)?;
    if !deleted {
        return Err(ApiError::from(engram_core::EngramError::NotFound(format!(
            "intent {id}"
        ))));
    }
    Ok(ok(json!({ "deleted": id })))
}

/// `GET /v1/intents/pending?user_id=` — due intents ordered by next_check;
/// condition triggers inside cooldown carry `cooldownActive: true`
pub async fn pending(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Value>> {
    let pending = state.service.intent_pending(params.user_id.as_deref())?;
    Ok(ok(json!({
        "total": pending.len(),
        "pending": pending,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimBody {
    #[serde(alias = "user_id")]
    pub user_id: Option<String>,
    pub limit: Option<usize>,
}

/// `POST /v1/intents/claim` — atomically stamp `claimed_at` on due rows
pub async fn claim(
    State(state): State<AppState>,
    Json(body): Json<ClaimBody>,
) -> ApiResult<Json<Value>> {
    let claimed = state
        .service
        .intent_claim(body.user_id.as_deref(), body.limit.unwrap_or(10))?;
    Ok(ok(json!({
        "total": claimed.len(),
        "claimed": claimed,
    })))
}

/// `POST /v1/intents/{id}/fire` — worker fire callback. Cooldown is a
/// first-class status, not an error.
pub async fn fire(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<FireRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state.service.intent_fire(&id, request)?;
    let body = match outcome {
        FireOutcome::Recorded { execution, intent } => json!({
            "status": execution.status.as_str(),
            "execution": execution,
            "intent": intent,
        }),
        FireOutcome::CooldownActive {
            cooldown_remaining_hours,
            intent,
        } => json!({
            "status": "cooldown_active",
            "cooldown_remaining_hours": cooldown_remaining_hours,
            "intent": intent,
        }),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct ExecutionsParams {
    pub limit: Option<usize>,
}

/// `GET /v1/intents/{id}/executions` — immutable audit rows
pub async fn executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ExecutionsParams>,
) -> ApiResult<Json<Value>> {
    let rows = state
        .service
        .intent_executions(&id, params.limit.unwrap_or(50))?;
    Ok(ok(json!({
        "total": rows.len(),
        "executions": rows,
    })))
}
