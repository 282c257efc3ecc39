//! Portfolio projection endpoints.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use engram_core::{PortfolioEvent, TradeAction};

use crate::error::{ApiError, ApiResult};
use crate::routes::ok;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UserParams {
    pub user_id: String,
}

/// `GET /v1/portfolio/summary?user_id=`
pub async fn summary(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> ApiResult<Json<Value>> {
    let summary = state.service.portfolio_summary(&params.user_id)?;
    Ok(ok(serde_json::to_value(summary).map_err(internal)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldingBody {
    #[serde(alias = "user_id")]
    pub user_id: String,
    pub ticker: String,
    #[serde(alias = "asset_name")]
    pub asset_name: Option<String>,
    pub shares: f64,
    pub price: Option<f64>,
    pub action: Option<String>,
}

/// `POST /v1/portfolio/holding` — append a buy/sell to the ledger
pub async fn add_holding(
    State(state): State<AppState>,
    Json(body): Json<HoldingBody>,
) -> ApiResult<Json<Value>> {
    let action = match body.action.as_deref() {
        Some(raw) => TradeAction::parse_name(raw)
            .ok_or_else(|| ApiError::bad_request(format!("unknown action: {raw}")))?,
        None => TradeAction::Buy,
    };
    let ticker = body.ticker.to_uppercase();
    state.service.portfolio_apply(
        &body.user_id,
        &PortfolioEvent {
            ticker: ticker.clone(),
            asset_name: body.asset_name,
            shares: body.shares,
            price: body.price,
            action,
        },
    )?;
    let summary = state.service.portfolio_summary(&body.user_id)?;
    Ok(ok(json!({
        "ticker": ticker,
        "positions": summary.positions,
    })))
}

/// `PUT /v1/portfolio/holding` — set the position to an absolute target
pub async fn put_holding(
    State(state): State<AppState>,
    Json(body): Json<HoldingBody>,
) -> ApiResult<Json<Value>> {
    let ticker = body.ticker.to_uppercase();
    state.service.portfolio_set_position(
        &body.user_id,
        &ticker,
        body.shares,
        body.price,
        body.asset_name,
    )?;
    Ok(ok(json!({
        "ticker": ticker,
        "shares": body.shares,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    pub user_id: String,
    pub ticker: String,
}

/// `DELETE /v1/portfolio/holding?user_id=&ticker=` — close the position
pub async fn delete_holding(
    State(state): State<AppState>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<Json<Value>> {
    let ticker = params.ticker.to_uppercase();
    let removed = state.service.portfolio_remove(&params.user_id, &ticker)?;
    Ok(ok(json!({
        "ticker": ticker,
        "removed": removed,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TransactionsParams {
    pub user_id: String,
    pub ticker: Option<String>,
}

/// `GET /v1/portfolio/transactions?user_id=&ticker=` — the ledger
pub async fn transactions(
    State(state): State<AppState>,
    Query(params): Query<TransactionsParams>,
) -> ApiResult<Json<Value>> {
    let summary = state.service.portfolio_summary(&params.user_id)?;
    let rows = state
        .service
        .portfolio_transactions(&params.user_id, params.ticker.as_deref())?;
    Ok(ok(json!({
        "transactions": rows,
        "positions": summary.positions,
    })))
}

fn internal(e: serde_json::Error) -> ApiError {
    ApiError::from(engram_core::EngramError::Internal(e.to_string()))
}
