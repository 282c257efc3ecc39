//! Retrieval endpoints: hybrid GET/POST, structured buckets, narrative,
//! cursor timeline.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use engram_core::{
    MemoryLayer, MemoryType, NarrativeRequest, RetrievalFilters, RetrievalOptions,
    RetrievalRequest, SortOrder,
};

use crate::error::{ApiError, ApiResult};
use crate::routes::ok;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RetrieveParams {
    pub user_id: String,
    pub query: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub layer: Option<String>,
    #[serde(rename = "type")]
    pub memory_type: Option<String>,
    pub tag: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub persona: Option<String>,
    pub synthesize: Option<bool>,
    pub sort: Option<String>,
}

impl RetrieveParams {
    fn into_request(self) -> ApiResult<RetrievalRequest> {
        let layer = match self.layer.as_deref() {
            Some(raw) => Some(
                MemoryLayer::parse_name(raw)
                    .ok_or_else(|| ApiError::bad_request(format!("unknown layer: {raw}")))?,
            ),
            None => None,
        };
        let memory_type = match self.memory_type.as_deref() {
            Some(raw) => Some(
                MemoryType::parse_name(raw)
                    .ok_or_else(|| ApiError::bad_request(format!("unknown type: {raw}")))?,
            ),
            None => None,
        };
        let sort = match self.sort.as_deref() {
            Some("oldest") => SortOrder::Oldest,
            Some("newest") => SortOrder::Newest,
            Some("relevance") | None => SortOrder::Relevance,
            Some(other) => {
                return Err(ApiError::bad_request(format!("unknown sort: {other}")))
            }
        };
        Ok(RetrievalRequest {
            user_id: self.user_id,
            query: self.query,
            filters: RetrievalFilters {
                layer,
                memory_type,
                tag: self.tag,
                from: self.from,
                to: self.to,
            },
            limit: self.limit.unwrap_or(0),
            offset: self.offset.unwrap_or(0),
            options: RetrievalOptions {
                persona: self.persona,
                synthesize: self.synthesize.unwrap_or(false),
                sort,
            },
        })
    }
}

/// `GET /v1/retrieve`
pub async fn retrieve_get(
    State(state): State<AppState>,
    Query(params): Query<RetrieveParams>,
) -> ApiResult<Json<Value>> {
    let request = params.into_request()?;
    let results = state.service.retrieve(request).await?;
    Ok(ok(serde_json::to_value(results).map_err(internal)?))
}

/// `POST /v1/retrieve` (persona-aware) and `POST /v1/orchestrator/retrieve`
pub async fn retrieve_post(
    State(state): State<AppState>,
    Json(request): Json<RetrievalRequest>,
) -> ApiResult<Json<Value>> {
    let results = state.service.retrieve(request).await?;
    Ok(ok(serde_json::to_value(results).map_err(internal)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredBody {
    #[serde(alias = "user_id")]
    pub user_id: String,
    #[serde(default)]
    pub filters: RetrievalFilters,
    #[serde(default)]
    pub limit_per_bucket: Option<usize>,
}

/// `POST /v1/retrieve/structured` — category buckets
pub async fn structured(
    State(state): State<AppState>,
    Json(body): Json<StructuredBody>,
) -> ApiResult<Json<Value>> {
    let results = state.service.retrieve_structured(
        &body.user_id,
        &body.filters,
        body.limit_per_bucket.unwrap_or(20),
    )?;
    Ok(ok(serde_json::to_value(results).map_err(internal)?))
}

/// `POST /v1/narrative`
pub async fn narrative(
    State(state): State<AppState>,
    Json(request): Json<NarrativeRequest>,
) -> ApiResult<Json<Value>> {
    let narrative = state.service.narrative(request).await?;
    Ok(ok(serde_json::to_value(narrative).map_err(internal)?))
}

#[derive(Debug, Deserialize)]
pub struct TimelineParams {
    pub user_id: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

/// `GET /v1/timeline` — pure time-series scan with cursor pagination
pub async fn timeline(
    State(state): State<AppState>,
    Query(params): Query<TimelineParams>,
) -> ApiResult<Json<Value>> {
    let page = state.service.timeline(
        &params.user_id,
        params.from,
        params.to,
        params.limit.unwrap_or(50),
        params.cursor.as_deref(),
    )?;
    Ok(ok(serde_json::to_value(page).map_err(internal)?))
}

fn internal(e: serde_json::Error) -> ApiError {
    ApiError::from(engram_core::EngramError::Internal(e.to_string()))
}
