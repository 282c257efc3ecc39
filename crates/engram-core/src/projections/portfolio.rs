//! Portfolio projector.
//!
//! The current-holdings view is a fold over the append-only transaction
//! ledger; the ledger is the source of truth for position reconstruction.
//! Snapshots are periodically materialized to the time-series store for
//! historical value tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{EngramError, Result};
use crate::memory::{PortfolioEvent, TradeAction};
use crate::stores::relational::{HoldingRow, TransactionRow};
use crate::stores::{RelationalStore, SnapshotRow, TimeSeriesStore};

/// Summary view over a user's holdings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSummary {
    pub user_id: String,
    pub holdings: Vec<HoldingRow>,
    pub positions: usize,
    /// Sum of shares x average price; market pricing lives in the proactive
    /// worker, not here
    pub total_cost_basis: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// The portfolio projector
pub struct PortfolioProjector {
    relational: Arc<RelationalStore>,
    timeseries: Arc<TimeSeriesStore>,
}

impl PortfolioProjector {
    pub fn new(relational: Arc<RelationalStore>, timeseries: Arc<TimeSeriesStore>) -> Self {
        Self {
            relational,
            timeseries,
        }
    }

    fn validate_ticker(ticker: &str) -> Result<()> {
        let valid = (1..=5).contains(&ticker.len())
            && ticker.chars().all(|c| c.is_ascii_uppercase());
        if !valid {
            return Err(EngramError::Validation(format!("invalid ticker: {ticker}")));
        }
        Ok(())
    }

    /// Append a buy/sell to the ledger and fold it into the view
    pub fn apply_event(
        &self,
        user_id: &str,
        event: &PortfolioEvent,
        memory_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        Self::validate_ticker(&event.ticker)?;
        if event.shares <= 0.0 {
            return Err(EngramError::validation("shares must be > 0"));
        }
        self.relational
            .apply_portfolio_event(user_id, event, memory_id, now)?;
        Ok(())
    }

    /// Set a position to an absolute target by appending the correcting
    /// buy/sell to the ledger (PUT semantics without breaking append-only).
    pub fn set_position(
        &self,
        user_id: &str,
        ticker: &str,
        shares: f64,
        price: Option<f64>,
        asset_name: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        Self::validate_ticker(ticker)?;
        if shares < 0.0 {
            return Err(EngramError::validation("shares must be >= 0"));
        }
        let held = self
            .relational
            .get_holding(user_id, ticker)?
            .map(|holding| holding.shares)
            .unwrap_or(0.0);
        let delta = shares - held;
        if delta.abs() <= f64::EPSILON {
            return Ok(());
        }
        let event = PortfolioEvent {
            ticker: ticker.to_string(),
            asset_name,
            shares: delta.abs(),
            price,
            action: if delta > 0.0 {
                TradeAction::Buy
            } else {
                TradeAction::Sell
            },
        };
        self.relational
            .apply_portfolio_event(user_id, &event, None, now)?;
        Ok(())
    }

    /// Close a position: append the closing sell, which folds the row away
    pub fn remove_holding(&self, user_id: &str, ticker: &str, now: DateTime<Utc>) -> Result<bool> {
        Self::validate_ticker(ticker)?;
        let Some(holding) = self.relational.get_holding(user_id, ticker)? else {
            return Ok(false);
        };
        self.relational.apply_portfolio_event(
            user_id,
            &PortfolioEvent {
                ticker: ticker.to_string(),
                asset_name: holding.asset_name.clone(),
                shares: holding.shares,
                price: Some(holding.avg_price),
                action: TradeAction::Sell,
            },
            None,
            now,
        )?;
        Ok(true)
    }

    /// Current summary view
    pub fn summary(&self, user_id: &str) -> Result<PortfolioSummary> {
        let holdings = self.relational.list_holdings(user_id)?;
        let total_cost_basis = holdings.iter().map(|h| h.shares * h.avg_price).sum();
        let last_updated = holdings.iter().map(|h| h.last_updated).max();
        Ok(PortfolioSummary {
            user_id: user_id.to_string(),
            positions: holdings.len(),
            holdings,
            total_cost_basis,
            last_updated,
        })
    }

    /// Rebuild the view by replaying the full ledger
    pub fn rebuild(&self, user_id: &str) -> Result<usize> {
        Ok(self.relational.rebuild_holdings(user_id)?)
    }

    /// Ledger rows, oldest first
    pub fn transactions(&self, user_id: &str, ticker: Option<&str>) -> Result<Vec<TransactionRow>> {
        Ok(self.relational.list_transactions(user_id, ticker)?)
    }

    /// Materialize a snapshot into the time-series store
    pub fn snapshot(&self, user_id: &str, now: DateTime<Utc>) -> Result<SnapshotRow> {
        let summary = self.summary(user_id)?;
        let row = SnapshotRow {
            user_id: user_id.to_string(),
            snapshot_at: now,
            total_value: summary.total_cost_basis,
            holdings: serde_json::to_value(&summary.holdings)?,
        };
        self.timeseries.insert_snapshot(&row)?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn projector() -> (TempDir, PortfolioProjector, Arc<RelationalStore>) {
        let dir = TempDir::new().unwrap();
        let relational =
            Arc::new(RelationalStore::open(&dir.path().join("relational.db")).unwrap());
        let timeseries =
            Arc::new(TimeSeriesStore::open(&dir.path().join("timeseries.db")).unwrap());
        let projector = PortfolioProjector::new(relational.clone(), timeseries);
        (dir, projector, relational)
    }

    fn buy(ticker: &str, shares: f64, price: f64) -> PortfolioEvent {
        PortfolioEvent {
            ticker: ticker.into(),
            asset_name: None,
            shares,
            price: Some(price),
            action: TradeAction::Buy,
        }
    }

    #[test]
    fn test_summary_reflects_ledger() {
        let (_dir, projector, _) = projector();
        let now = Utc::now();
        projector.apply_event("u1", &buy("NVDA", 10.0, 100.0), None, now).unwrap();
        projector.apply_event("u1", &buy("AAPL", 2.0, 200.0), None, now).unwrap();

        let summary = projector.summary("u1").unwrap();
        assert_eq!(summary.positions, 2);
        assert!((summary.total_cost_basis - 1400.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_position_appends_correcting_transactions() {
        let (_dir, projector, relational) = projector();
        let now = Utc::now();
        projector.apply_event("u1", &buy("NVDA", 10.0, 100.0), None, now).unwrap();

        projector
            .set_position("u1", "NVDA", 4.0, Some(110.0), None, now)
            .unwrap();
        let holding = relational.get_holding("u1", "NVDA").unwrap().unwrap();
        assert!((holding.shares - 4.0).abs() < 1e-9);

        // Ledger keeps the full story: original buy + correcting sell
        let transactions = relational.list_transactions("u1", Some("NVDA")).unwrap();
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[1].action, TradeAction::Sell);
    }

    #[test]
    fn test_remove_holding_closes_position() {
        let (_dir, projector, relational) = projector();
        let now = Utc::now();
        projector.apply_event("u1", &buy("NVDA", 10.0, 100.0), None, now).unwrap();

        assert!(projector.remove_holding("u1", "NVDA", now).unwrap());
        assert!(relational.get_holding("u1", "NVDA").unwrap().is_none());
        assert!(!projector.remove_holding("u1", "NVDA", now).unwrap());

        // Rebuild from the ledger converges to the same (empty) position
        projector.rebuild("u1").unwrap();
        assert!(relational.get_holding("u1", "NVDA").unwrap().is_none());
    }

    #[test]
    fn test_invalid_ticker_rejected() {
        let (_dir, projector, _) = projector();
        let err = projector
            .apply_event("u1", &buy("nvda", 1.0, 1.0), None, Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Validation);
    }

    #[test]
    fn test_snapshot_materializes() {
        let (_dir, projector, _) = projector();
        let now = Utc::now();
        projector.apply_event("u1", &buy("NVDA", 10.0, 100.0), None, now).unwrap();
        let snapshot = projector.snapshot("u1", now).unwrap();
        assert!((snapshot.total_value - 1000.0).abs() < 1e-9);
    }
}
