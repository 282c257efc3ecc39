//! Shared application state.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use engram_core::EngramService;

/// Background-work progress, exposed on `/v1/progress`
#[derive(Default)]
pub struct Progress {
    pub maintenance_runs: AtomicU64,
    pub idle_flushes: AtomicU64,
    pub pending_intents: AtomicU64,
    pub last_maintenance_at: RwLock<Option<DateTime<Utc>>>,
}

impl Progress {
    pub fn record_maintenance(&self, at: DateTime<Utc>) {
        self.maintenance_runs.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_maintenance_at.write() {
            *last = Some(at);
        }
    }

    pub fn record_idle_flushes(&self, count: u64) {
        self.idle_flushes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_pending_intents(&self, count: u64) {
        self.pending_intents.store(count, Ordering::Relaxed);
    }
}

/// Process-wide handles shared with every request handler
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EngramService>,
    pub progress: Arc<Progress>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(service: Arc<EngramService>) -> Self {
        Self {
            service,
            progress: Arc::new(Progress::default()),
            started_at: Utc::now(),
        }
    }
}
