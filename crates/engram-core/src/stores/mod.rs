//! Store adapters.
//!
//! Four thin typed adapters over the backing stores: vector, time-series,
//! relational and cache. Adapters are pure — no cross-store logic — and every
//! operation returns an outcome with an error kind instead of raising.
//!
//! The SQLite-backed adapters use the paired reader/writer connection layout:
//! all methods take `&self`, connections live behind mutexes, so each adapter
//! is `Send + Sync` and shared as `Arc<...>`.

pub mod cache;
pub mod migrations;
pub mod relational;
pub mod timeseries;
pub mod vector;

pub use cache::CacheStore;
pub use migrations::{Migration, MigrationOutcome};
pub use relational::RelationalStore;
pub use timeseries::{
    EmotionalRow, EpisodicRow, ScanPage, SnapshotRow, TimeSeriesStore, TimeSeriesTable,
};
pub use vector::{VectorFilter, VectorRow, VectorStore};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;

use crate::error::EngramError;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Adapter-level error
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Row not found
    #[error("not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Store unreachable / lock held
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Caller supplied malformed input
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Uniqueness or domain constraint violated
    #[error("constraint violated: {0}")]
    Constraint(String),
    /// Initialization error
    #[error("initialization error: {0}")]
    Init(String),
}

impl StoreError {
    /// Stable kind string recorded in persistence outcomes
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "database",
            StoreError::NotFound(_) => "not_found",
            StoreError::Io(_) => "io",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::InvalidInput(_) => "invalid_input",
            StoreError::Constraint(_) => "constraint",
            StoreError::Init(_) => "init",
        }
    }
}

/// Adapter result type
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for EngramError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => EngramError::Dependency(msg),
            StoreError::InvalidInput(msg) => EngramError::Validation(msg),
            StoreError::NotFound(msg) => EngramError::NotFound(msg),
            other => EngramError::Storage(other.to_string()),
        }
    }
}

/// Map a poisoned mutex into a store error; the storage layer never
/// panics on lock poisoning
pub(crate) fn lock_poisoned(which: &str) -> StoreError {
    StoreError::Unavailable(format!("{which} lock poisoned"))
}

// ============================================================================
// HEALTH
// ============================================================================

/// Health probe result exposed by every adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    pub ok: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StoreHealth {
    /// Run a probe closure and time it
    pub fn probe<F>(f: F) -> Self
    where
        F: FnOnce() -> StoreResult<()>,
    {
        let started = Instant::now();
        match f() {
            Ok(()) => StoreHealth {
                ok: true,
                latency_ms: started.elapsed().as_millis() as u64,
                detail: None,
            },
            Err(e) => StoreHealth {
                ok: false,
                latency_ms: started.elapsed().as_millis() as u64,
                detail: Some(e.to_string()),
            },
        }
    }
}

// ============================================================================
// SQLITE PLUMBING
// ============================================================================

/// Apply the shared PRAGMA set to a connection
pub(crate) fn configure_connection(conn: &rusqlite::Connection) -> StoreResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

/// Open the reader/writer connection pair for a database file, applying the
/// given migration set on the writer.
pub(crate) fn open_pair(
    path: &Path,
    set_name: &str,
    set: &[Migration],
) -> StoreResult<(rusqlite::Connection, rusqlite::Connection)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let writer = rusqlite::Connection::open(path)?;
    configure_connection(&writer)?;
    migrations::apply_migrations(&writer, set_name, set)?;
    let reader = rusqlite::Connection::open(path)?;
    configure_connection(&reader)?;
    Ok((writer, reader))
}
