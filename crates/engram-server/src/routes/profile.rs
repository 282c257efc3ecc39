//! Profile projection endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::routes::ok;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UserParams {
    pub user_id: String,
}

/// `GET /v1/profile?user_id=`
pub async fn view_all(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> ApiResult<Json<Value>> {
    let view = state.service.profile_view(&params.user_id, None)?;
    Ok(ok(serde_json::to_value(view).map_err(internal)?))
}

/// `GET /v1/profile/{category}?user_id=`
pub async fn view_category(
    State(state): State<AppState>,
    Path(category): Path<String>,
    Query(params): Query<UserParams>,
) -> ApiResult<Json<Value>> {
    let view = state.service.profile_view(&params.user_id, Some(&category))?;
    Ok(ok(serde_json::to_value(view).map_err(internal)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutFieldBody {
    #[serde(alias = "user_id")]
    pub user_id: String,
    pub value: String,
}

/// `PUT /v1/profile/{category}/{field}` — explicit overwrite
pub async fn put_field(
    State(state): State<AppState>,
    Path((category, field)): Path<(String, String)>,
    Json(body): Json<PutFieldBody>,
) -> ApiResult<Json<Value>> {
    state
        .service
        .profile_set_field(&body.user_id, &category, &field, &body.value)?;
    Ok(ok(json!({
        "category": category,
        "field": field,
        "value": body.value,
    })))
}

/// `GET /v1/profile/completeness?user_id=`
pub async fn completeness(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> ApiResult<Json<Value>> {
    let report = state.service.profile_completeness(&params.user_id)?;
    Ok(ok(serde_json::to_value(report).map_err(internal)?))
}

fn internal(e: serde_json::Error) -> ApiError {
    ApiError::from(engram_core::EngramError::Internal(e.to_string()))
}
