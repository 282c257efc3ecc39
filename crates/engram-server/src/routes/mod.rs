//! HTTP routes.

pub mod health;
pub mod intents;
pub mod maintenance;
pub mod memories;
pub mod orchestrator;
pub mod portfolio;
pub mod profile;
pub mod retrieve;

use axum::http::HeaderValue;
use axum::routing::{get, post, put};
use axum::Router;
use serde_json::Value;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::state::AppState;

/// Merge `status: success` into a JSON payload (every successful response
/// carries a status field)
pub fn ok(value: Value) -> axum::Json<Value> {
    match value {
        Value::Object(mut map) => {
            map.entry("status").or_insert(Value::String("success".into()));
            axum::Json(Value::Object(map))
        }
        other => axum::Json(serde_json::json!({ "status": "success", "data": other })),
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Build the full application router
pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        // Health & operational visibility
        .route("/health", get(health::health))
        .route("/health/full", get(health::health_full))
        .route("/v1/progress", get(health::progress))
        .route("/v1/stats", get(health::stats))
        // Streaming orchestrator
        .route("/v1/orchestrator/message", post(orchestrator::message))
        .route("/v1/orchestrator/transcript", post(orchestrator::transcript))
        .route("/v1/orchestrator/retrieve", post(retrieve::retrieve_post))
        // Memories
        .route("/v1/memories/direct", post(memories::direct))
        .route(
            "/v1/memories/{id}",
            get(memories::get_memory).delete(memories::delete_memory),
        )
        .route("/v1/store", post(memories::store_pipeline))
        // Retrieval
        .route(
            "/v1/retrieve",
            get(retrieve::retrieve_get).post(retrieve::retrieve_post),
        )
        .route("/v1/retrieve/structured", post(retrieve::structured))
        .route("/v1/narrative", post(retrieve::narrative))
        .route("/v1/timeline", get(retrieve::timeline))
        // Profile projection
        .route("/v1/profile", get(profile::view_all))
        .route("/v1/profile/completeness", get(profile::completeness))
        .route("/v1/profile/{category}", get(profile::view_category))
        .route("/v1/profile/{category}/{field}", put(profile::put_field))
        // Portfolio projection
        .route("/v1/portfolio/summary", get(portfolio::summary))
        .route(
            "/v1/portfolio/holding",
            post(portfolio::add_holding)
                .put(portfolio::put_holding)
                .delete(portfolio::delete_holding),
        )
        .route("/v1/portfolio/transactions", get(portfolio::transactions))
        // Maintenance
        .route("/v1/maintenance", post(maintenance::run))
        .route("/v1/maintenance/compact", post(maintenance::compact))
        .route("/v1/maintenance/compact_all", post(maintenance::compact_all))
        .route("/v1/maintenance/unlock", post(maintenance::force_unlock))
        // Scheduled intents
        .route("/v1/intents", post(intents::create).get(intents::list))
        .route("/v1/intents/pending", get(intents::pending))
        .route("/v1/intents/claim", post(intents::claim))
        .route(
            "/v1/intents/{id}",
            get(intents::get_intent)
                .patch(intents::update)
                .delete(intents::delete),
        )
        .route("/v1/intents/{id}/fire", post(intents::fire))
        .route("/v1/intents/{id}/executions", get(intents::executions))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}
