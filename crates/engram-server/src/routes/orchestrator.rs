//! Streaming-orchestrator endpoints.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use engram_core::{OrchestratorMessage, Turn, TurnRole};

use crate::error::{ApiError, ApiResult};
use crate::routes::ok;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    #[serde(alias = "conversation_id")]
    pub conversation_id: String,
    pub role: TurnRole,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub flush: bool,
}

fn user_id_from(metadata: &Map<String, Value>) -> ApiResult<String> {
    metadata
        .get("user_id")
        .or_else(|| metadata.get("userId"))
        .and_then(Value::as_str)
        .filter(|user| !user.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request("metadata.user_id is required"))
}

/// `POST /v1/orchestrator/message` — stream one turn; returns injections
pub async fn message(
    State(state): State<AppState>,
    Json(body): Json<MessageBody>,
) -> ApiResult<Json<Value>> {
    let user_id = user_id_from(&body.metadata)?;
    let outcome = state
        .service
        .orchestrator_message(OrchestratorMessage {
            conversation_id: body.conversation_id,
            role: body.role,
            content: body.content,
            user_id,
            metadata: body.metadata,
            flush: body.flush,
        })
        .await?;
    Ok(ok(serde_json::to_value(outcome).map_err(|e| {
        ApiError::from(engram_core::EngramError::Internal(e.to_string()))
    })?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptBody {
    #[serde(alias = "conversation_id")]
    pub conversation_id: String,
    #[serde(alias = "user_id")]
    pub user_id: Option<String>,
    #[serde(alias = "turns")]
    pub history: Vec<Turn>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// `POST /v1/orchestrator/transcript` — replay full history
pub async fn transcript(
    State(state): State<AppState>,
    Json(body): Json<TranscriptBody>,
) -> ApiResult<Json<Value>> {
    let user_id = match body.user_id {
        Some(user) if !user.trim().is_empty() => user,
        _ => user_id_from(&body.metadata)?,
    };
    let counters = state
        .service
        .orchestrator_transcript(&body.conversation_id, &user_id, body.history, body.metadata)
        .await?;
    Ok(ok(json!({ "counters": counters })))
}
