//! Long-running background tasks.
//!
//! Started at boot, cancellable on shutdown via a watch channel:
//! - the orchestrator idle-flush sweep
//! - the per-user maintenance scheduler (skip-if-fresh)
//! - the intent pending-poll for operational visibility

use chrono::Utc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use engram_core::MaintenanceJob;

use crate::state::AppState;

/// Spawn all background loops; dropping the returned sender stops them
pub fn spawn(state: AppState, maintenance_interval_hours: u64) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(idle_flush_loop(state.clone(), shutdown_rx.clone()));
    tokio::spawn(maintenance_loop(
        state.clone(),
        maintenance_interval_hours,
        shutdown_rx.clone(),
    ));
    tokio::spawn(pending_poll_loop(state, shutdown_rx));

    shutdown_tx
}

async fn idle_flush_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("idle-flush sweep stopping");
                return;
            }
        }
        match state.service.sweep_idle_conversations().await {
            Ok(flushed) if flushed > 0 => {
                state.progress.record_idle_flushes(flushed as u64);
            }
            Ok(_) => {}
            Err(e) => warn!("idle flush sweep failed: {e}"),
        }
    }
}

async fn maintenance_loop(
    state: AppState,
    interval_hours: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    // Small delay so startup traffic settles first
    tokio::time::sleep(Duration::from_secs(5)).await;
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("maintenance scheduler stopping");
                return;
            }
        }

        let users = match state.service.known_users() {
            Ok(users) => users,
            Err(e) => {
                warn!("maintenance scheduler could not list users: {e}");
                continue;
            }
        };

        for user_id in users {
            let fresh = match state.service.maintenance_last_run(&user_id) {
                Ok(Some(last)) => {
                    (Utc::now() - last) < chrono::Duration::hours(interval_hours as i64)
                }
                Ok(None) => false,
                Err(e) => {
                    warn!(user_id = %user_id, "could not read maintenance history: {e}");
                    false
                }
            };
            if fresh {
                continue;
            }

            match state
                .service
                .run_maintenance(&user_id, &MaintenanceJob::all())
                .await
            {
                Ok(report) => {
                    state.progress.record_maintenance(Utc::now());
                    info!(
                        user_id = %user_id,
                        replayed = report.counters.replayed,
                        promoted = report.counters.promoted,
                        archived = report.counters.archived,
                        decayed = report.counters.decayed,
                        merged = report.counters.merged,
                        repaired = report.counters.repaired,
                        duration_ms = report.duration_ms,
                        "scheduled maintenance complete"
                    );
                }
                Err(e) => warn!(user_id = %user_id, "scheduled maintenance failed: {e}"),
            }

            // Materialize a portfolio snapshot alongside the daily sweep
            match state.service.portfolio_summary(&user_id) {
                Ok(summary) if summary.positions > 0 => {
                    if let Err(e) = state.service.portfolio_snapshot(&user_id) {
                        warn!(user_id = %user_id, "portfolio snapshot failed: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(user_id = %user_id, "portfolio summary failed: {e}"),
            }
        }
    }
}

async fn pending_poll_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("intent pending-poll stopping");
                return;
            }
        }
        match state.service.intent_pending(None) {
            Ok(pending) => state.progress.set_pending_intents(pending.len() as u64),
            Err(e) => {
                // Proactivity may be disabled; keep the gauge at zero
                tracing::debug!("pending poll skipped: {e}");
                state.progress.pending_intents.store(0, Ordering::Relaxed);
            }
        }
    }
}
