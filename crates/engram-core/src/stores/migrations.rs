//! Database migrations.
//!
//! Numbered, paired up/down migrations per store. Each applied migration is
//! recorded with a sha256 checksum; a lock row prevents concurrent
//! migrations; a history table records every action with timing and success.

use sha2::{Digest, Sha256};

use super::{StoreError, StoreResult};

/// How long a migration lock is honored before being treated as stale
const LOCK_TTL_SECONDS: i64 = 300;

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number, unique within a set
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
    /// SQL to revert
    pub down: &'static str,
}

/// Result of an apply pass
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationOutcome {
    pub applied: u32,
    pub current_version: u32,
}

fn checksum(sql: &str) -> String {
    let digest = Sha256::digest(sql.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn ensure_bookkeeping(conn: &rusqlite::Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            set_name TEXT NOT NULL,
            version INTEGER NOT NULL,
            description TEXT NOT NULL,
            checksum TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            PRIMARY KEY (set_name, version)
        );
        CREATE TABLE IF NOT EXISTS migration_lock (
            set_name TEXT PRIMARY KEY,
            locked_at TEXT
        );
        CREATE TABLE IF NOT EXISTS migration_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            set_name TEXT NOT NULL,
            version INTEGER NOT NULL,
            action TEXT NOT NULL,
            started_at TEXT NOT NULL,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            success INTEGER NOT NULL DEFAULT 0
        );",
    )?;
    Ok(())
}

/// Compare-and-set lock acquisition; stale locks (older than the TTL) are
/// taken over.
fn acquire_lock(conn: &rusqlite::Connection, set_name: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO migration_lock (set_name, locked_at) VALUES (?1, NULL)",
        [set_name],
    )?;
    let updated = conn.execute(
        "UPDATE migration_lock
         SET locked_at = datetime('now')
         WHERE set_name = ?1
           AND (locked_at IS NULL
                OR locked_at < datetime('now', ?2))",
        rusqlite::params![set_name, format!("-{LOCK_TTL_SECONDS} seconds")],
    )?;
    if updated == 0 {
        return Err(StoreError::Unavailable(format!(
            "migration lock for '{set_name}' is held"
        )));
    }
    Ok(())
}

fn release_lock(conn: &rusqlite::Connection, set_name: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE migration_lock SET locked_at = NULL WHERE set_name = ?1",
        [set_name],
    )?;
    Ok(())
}

/// Break a stale or stuck migration lock
pub fn force_unlock(conn: &rusqlite::Connection, set_name: &str) -> StoreResult<()> {
    ensure_bookkeeping(conn)?;
    release_lock(conn, set_name)
}

/// Current version of a migration set (0 when nothing applied)
pub fn current_version(conn: &rusqlite::Connection, set_name: &str) -> StoreResult<u32> {
    ensure_bookkeeping(conn)?;
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations WHERE set_name = ?1",
        [set_name],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn record_history(
    conn: &rusqlite::Connection,
    set_name: &str,
    version: u32,
    action: &str,
    started_at: &str,
    duration_ms: i64,
    success: bool,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO migration_history (set_name, version, action, started_at, duration_ms, success)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![set_name, version, action, started_at, duration_ms, success as i64],
    )?;
    Ok(())
}

/// Apply pending migrations from a set.
///
/// Verifies the checksum of every already-applied migration first; a drifted
/// checksum means the on-disk schema no longer matches the code and is an
/// initialization error.
pub fn apply_migrations(
    conn: &rusqlite::Connection,
    set_name: &str,
    set: &[Migration],
) -> StoreResult<MigrationOutcome> {
    ensure_bookkeeping(conn)?;
    acquire_lock(conn, set_name)?;

    let result = apply_locked(conn, set_name, set);
    release_lock(conn, set_name)?;
    result
}

fn apply_locked(
    conn: &rusqlite::Connection,
    set_name: &str,
    set: &[Migration],
) -> StoreResult<MigrationOutcome> {
    let mut outcome = MigrationOutcome::default();

    {
        let mut stmt = conn
            .prepare("SELECT version, checksum FROM schema_migrations WHERE set_name = ?1")?;
        let applied: Vec<(u32, String)> = stmt
            .query_map([set_name], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        for (version, recorded) in applied {
            if let Some(migration) = set.iter().find(|m| m.version == version) {
                if checksum(migration.up) != recorded {
                    return Err(StoreError::Init(format!(
                        "checksum mismatch for {set_name} migration v{version}"
                    )));
                }
            }
        }
    }

    let current = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations WHERE set_name = ?1",
        [set_name],
        |row| row.get::<_, u32>(0),
    )?;
    outcome.current_version = current;

    for migration in set {
        if migration.version <= current {
            continue;
        }
        tracing::info!(
            set = set_name,
            version = migration.version,
            "applying migration: {}",
            migration.description
        );
        let started = std::time::Instant::now();
        let started_at = chrono::Utc::now().to_rfc3339();

        let applied = conn.execute_batch(migration.up);
        let duration_ms = started.elapsed().as_millis() as i64;
        record_history(
            conn,
            set_name,
            migration.version,
            "up",
            &started_at,
            duration_ms,
            applied.is_ok(),
        )?;
        applied?;

        conn.execute(
            "INSERT INTO schema_migrations (set_name, version, description, checksum, applied_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))",
            rusqlite::params![
                set_name,
                migration.version,
                migration.description,
                checksum(migration.up)
            ],
        )?;
        outcome.applied += 1;
        outcome.current_version = migration.version;
    }

    Ok(outcome)
}

/// Revert the most recently applied migration of a set, if any.
pub fn revert_last(
    conn: &rusqlite::Connection,
    set_name: &str,
    set: &[Migration],
) -> StoreResult<Option<u32>> {
    ensure_bookkeeping(conn)?;
    acquire_lock(conn, set_name)?;

    let result = (|| {
        let current = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations WHERE set_name = ?1",
            [set_name],
            |row| row.get::<_, u32>(0),
        )?;
        if current == 0 {
            return Ok(None);
        }
        let migration = set
            .iter()
            .find(|m| m.version == current)
            .ok_or_else(|| StoreError::Init(format!("no definition for {set_name} v{current}")))?;

        let started = std::time::Instant::now();
        let started_at = chrono::Utc::now().to_rfc3339();
        let reverted = conn.execute_batch(migration.down);
        let duration_ms = started.elapsed().as_millis() as i64;
        record_history(
            conn,
            set_name,
            current,
            "down",
            &started_at,
            duration_ms,
            reverted.is_ok(),
        )?;
        reverted?;

        conn.execute(
            "DELETE FROM schema_migrations WHERE set_name = ?1 AND version = ?2",
            rusqlite::params![set_name, current],
        )?;
        Ok(Some(current))
    })();

    release_lock(conn, set_name)?;
    result
}

// ============================================================================
// RELATIONAL SET
// ============================================================================

/// Migrations for the relational store
pub const RELATIONAL_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Typed memory tables: procedural, skills, identity, relations",
        up: RELATIONAL_V1_UP,
        down: RELATIONAL_V1_DOWN,
    },
    Migration {
        version: 2,
        description: "Portfolio ledger, holdings and preferences",
        up: RELATIONAL_V2_UP,
        down: RELATIONAL_V2_DOWN,
    },
    Migration {
        version: 3,
        description: "User profile projection tables",
        up: RELATIONAL_V3_UP,
        down: RELATIONAL_V3_DOWN,
    },
    Migration {
        version: 4,
        description: "Scheduled intents, execution audit, maintenance locks",
        up: RELATIONAL_V4_UP,
        down: RELATIONAL_V4_DOWN,
    },
];

const RELATIONAL_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS procedural_memories (
    memory_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    skill_name TEXT NOT NULL,
    proficiency_level TEXT NOT NULL DEFAULT 'beginner',
    practice_count INTEGER NOT NULL DEFAULT 0,
    success_rate REAL,
    difficulty_rating REAL,
    prerequisites TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_procedural_user ON procedural_memories(user_id);
CREATE INDEX IF NOT EXISTS idx_procedural_skill ON procedural_memories(user_id, skill_name);

-- Append-only proficiency history per skill
CREATE TABLE IF NOT EXISTS skill_progressions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    skill_name TEXT NOT NULL,
    proficiency_level TEXT NOT NULL,
    practice_count INTEGER NOT NULL DEFAULT 0,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_progressions_skill ON skill_progressions(user_id, skill_name);

-- One row per user, merged on write
CREATE TABLE IF NOT EXISTS identity_memories (
    user_id TEXT PRIMARY KEY,
    core_values TEXT NOT NULL DEFAULT '[]',
    self_concept TEXT,
    ideal_self TEXT,
    feared_self TEXT,
    life_roles TEXT NOT NULL DEFAULT '[]',
    personality_traits TEXT NOT NULL DEFAULT '[]',
    growth_edges TEXT NOT NULL DEFAULT '[]',
    contradictions TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
);

-- Memory-to-memory relations (SIMILAR_TO, LED_TO, ...)
CREATE TABLE IF NOT EXISTS memory_relations (
    src_id TEXT NOT NULL,
    dst_id TEXT NOT NULL,
    relation TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    PRIMARY KEY (src_id, dst_id, relation)
);

CREATE INDEX IF NOT EXISTS idx_relations_src ON memory_relations(src_id);
CREATE INDEX IF NOT EXISTS idx_relations_dst ON memory_relations(dst_id);
"#;

const RELATIONAL_V1_DOWN: &str = r#"
DROP TABLE IF EXISTS memory_relations;
DROP TABLE IF EXISTS identity_memories;
DROP TABLE IF EXISTS skill_progressions;
DROP TABLE IF EXISTS procedural_memories;
"#;

const RELATIONAL_V2_UP: &str = r#"
-- Append-only ledger; source of truth for position reconstruction
CREATE TABLE IF NOT EXISTS portfolio_transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    ticker TEXT NOT NULL,
    action TEXT NOT NULL,
    shares REAL NOT NULL,
    price REAL,
    asset_name TEXT,
    memory_id TEXT,
    executed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transactions_user ON portfolio_transactions(user_id, ticker);

-- Folded view of the ledger
CREATE TABLE IF NOT EXISTS portfolio_holdings (
    user_id TEXT NOT NULL,
    ticker TEXT NOT NULL,
    asset_name TEXT,
    shares REAL NOT NULL DEFAULT 0,
    avg_price REAL NOT NULL DEFAULT 0,
    first_acquired TEXT NOT NULL,
    last_updated TEXT NOT NULL,
    PRIMARY KEY (user_id, ticker)
);

CREATE TABLE IF NOT EXISTS portfolio_preferences (
    user_id TEXT PRIMARY KEY,
    preferences TEXT NOT NULL DEFAULT '{}',
    updated_at TEXT NOT NULL
);
"#;

const RELATIONAL_V2_DOWN: &str = r#"
DROP TABLE IF EXISTS portfolio_preferences;
DROP TABLE IF EXISTS portfolio_holdings;
DROP TABLE IF EXISTS portfolio_transactions;
"#;

const RELATIONAL_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS user_profiles (
    user_id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS profile_fields (
    user_id TEXT NOT NULL,
    category TEXT NOT NULL,
    field TEXT NOT NULL,
    value TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0,
    explicitness REAL NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, category, field)
);

-- Audit: which memories contributed to each field
CREATE TABLE IF NOT EXISTS profile_sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    category TEXT NOT NULL,
    field TEXT NOT NULL,
    memory_id TEXT NOT NULL,
    added_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_profile_sources_field
    ON profile_sources(user_id, category, field);

CREATE TABLE IF NOT EXISTS profile_confidence_scores (
    user_id TEXT NOT NULL,
    category TEXT NOT NULL,
    field TEXT NOT NULL,
    frequency REAL NOT NULL DEFAULT 0,
    recency REAL NOT NULL DEFAULT 0,
    explicitness REAL NOT NULL DEFAULT 0,
    diversity REAL NOT NULL DEFAULT 0,
    blended REAL NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, category, field)
);
"#;

const RELATIONAL_V3_DOWN: &str = r#"
DROP TABLE IF EXISTS profile_confidence_scores;
DROP TABLE IF EXISTS profile_sources;
DROP TABLE IF EXISTS profile_fields;
DROP TABLE IF EXISTS user_profiles;
"#;

const RELATIONAL_V4_UP: &str = r#"
CREATE TABLE IF NOT EXISTS scheduled_intents (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    intent_name TEXT NOT NULL,
    description TEXT,
    trigger_type TEXT NOT NULL,
    trigger_schedule TEXT NOT NULL,
    trigger_condition TEXT,
    action_type TEXT NOT NULL DEFAULT 'notify',
    action_context TEXT,
    action_priority TEXT NOT NULL DEFAULT 'normal',
    next_check TEXT,
    last_checked TEXT,
    last_executed TEXT,
    execution_count INTEGER NOT NULL DEFAULT 0,
    last_execution_status TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    disabled_reason TEXT,
    expires_at TEXT,
    max_executions INTEGER,
    last_condition_fire TEXT,
    claimed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_intents_user ON scheduled_intents(user_id);
-- Partial index backing the pending query
CREATE INDEX IF NOT EXISTS idx_intents_due
    ON scheduled_intents(next_check)
    WHERE enabled = 1 AND next_check IS NOT NULL;

-- Immutable execution audit
CREATE TABLE IF NOT EXISTS intent_executions (
    id TEXT PRIMARY KEY,
    intent_id TEXT NOT NULL,
    executed_at TEXT NOT NULL,
    trigger_type TEXT NOT NULL,
    trigger_data TEXT,
    status TEXT NOT NULL,
    gate_result TEXT,
    message_id TEXT,
    message_preview TEXT,
    duration_ms INTEGER,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_executions_intent ON intent_executions(intent_id, executed_at);

CREATE TABLE IF NOT EXISTS maintenance_locks (
    name TEXT PRIMARY KEY,
    locked_at TEXT
);

CREATE TABLE IF NOT EXISTS maintenance_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    run_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    jobs TEXT NOT NULL DEFAULT '[]',
    replayed INTEGER NOT NULL DEFAULT 0,
    promoted INTEGER NOT NULL DEFAULT 0,
    archived INTEGER NOT NULL DEFAULT 0,
    decayed INTEGER NOT NULL DEFAULT 0,
    merged INTEGER NOT NULL DEFAULT 0,
    repaired INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_maintenance_history_user ON maintenance_history(user_id, run_at);
"#;

const RELATIONAL_V4_DOWN: &str = r#"
DROP TABLE IF EXISTS maintenance_history;
DROP TABLE IF EXISTS maintenance_locks;
DROP TABLE IF EXISTS intent_executions;
DROP TABLE IF EXISTS scheduled_intents;
"#;

// ============================================================================
// TIME-SERIES SET
// ============================================================================

/// Migrations for the time-series store (hypertables emulated over SQLite)
pub const TIMESERIES_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Episodic, emotional and portfolio-snapshot hypertables",
    up: TIMESERIES_V1_UP,
    down: TIMESERIES_V1_DOWN,
}];

const TIMESERIES_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS episodic_memories (
    memory_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    event_timestamp TEXT NOT NULL,
    event_type TEXT,
    location TEXT,
    participants TEXT NOT NULL DEFAULT '[]',
    emotional_valence REAL,
    emotional_arousal REAL,
    importance_score REAL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_episodic_user_time
    ON episodic_memories(user_id, event_timestamp);

CREATE TABLE IF NOT EXISTS emotional_memories (
    memory_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    emotional_state TEXT NOT NULL,
    valence REAL NOT NULL,
    arousal REAL NOT NULL,
    dominance REAL,
    intensity REAL,
    duration_seconds INTEGER,
    trigger_event TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_emotional_user_time
    ON emotional_memories(user_id, timestamp);

CREATE TABLE IF NOT EXISTS portfolio_snapshots (
    user_id TEXT NOT NULL,
    snapshot_at TEXT NOT NULL,
    total_value REAL NOT NULL DEFAULT 0,
    holdings TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (user_id, snapshot_at)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_user_time
    ON portfolio_snapshots(user_id, snapshot_at);
"#;

const TIMESERIES_V1_DOWN: &str = r#"
DROP TABLE IF EXISTS portfolio_snapshots;
DROP TABLE IF EXISTS emotional_memories;
DROP TABLE IF EXISTS episodic_memories;
"#;

// ============================================================================
// VECTOR SET
// ============================================================================

/// Migrations for the vector store's SQLite side (rows + embedding blobs)
pub const VECTOR_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Vector collection rows and embedding blobs",
    up: VECTOR_V1_UP,
    down: VECTOR_V1_DOWN,
}];

const VECTOR_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS vector_records (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    document TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vector_user ON vector_records(user_id);
CREATE INDEX IF NOT EXISTS idx_vector_created ON vector_records(created_at);

CREATE TABLE IF NOT EXISTS vector_embeddings (
    id TEXT PRIMARY KEY REFERENCES vector_records(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL
);
"#;

const VECTOR_V1_DOWN: &str = r#"
DROP TABLE IF EXISTS vector_embeddings;
DROP TABLE IF EXISTS vector_records;
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn open_memory() -> rusqlite::Connection {
        rusqlite::Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_apply_is_idempotent() {
        let conn = open_memory();
        let first = apply_migrations(&conn, "relational", RELATIONAL_MIGRATIONS).unwrap();
        assert_eq!(first.applied, RELATIONAL_MIGRATIONS.len() as u32);
        let second = apply_migrations(&conn, "relational", RELATIONAL_MIGRATIONS).unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.current_version, first.current_version);
    }

    #[test]
    fn test_history_records_every_action() {
        let conn = open_memory();
        apply_migrations(&conn, "timeseries", TIMESERIES_MIGRATIONS).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM migration_history", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, TIMESERIES_MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_revert_last_walks_back() {
        let conn = open_memory();
        apply_migrations(&conn, "relational", RELATIONAL_MIGRATIONS).unwrap();
        let reverted = revert_last(&conn, "relational", RELATIONAL_MIGRATIONS).unwrap();
        assert_eq!(reverted, Some(4));
        assert_eq!(current_version(&conn, "relational").unwrap(), 3);

        // scheduled_intents is gone, portfolio tables remain
        assert!(conn
            .prepare("SELECT 1 FROM scheduled_intents LIMIT 1")
            .is_err());
        assert!(conn
            .prepare("SELECT 1 FROM portfolio_holdings LIMIT 1")
            .is_ok());
    }

    #[test]
    fn test_held_lock_blocks_and_force_unlock_recovers() {
        let conn = open_memory();
        ensure_bookkeeping(&conn).unwrap();
        acquire_lock(&conn, "relational").unwrap();

        let blocked = apply_migrations(&conn, "relational", RELATIONAL_MIGRATIONS);
        assert!(matches!(blocked, Err(StoreError::Unavailable(_))));

        force_unlock(&conn, "relational").unwrap();
        assert!(apply_migrations(&conn, "relational", RELATIONAL_MIGRATIONS).is_ok());
    }

    #[test]
    fn test_checksum_is_stable_hex() {
        let sum = checksum("CREATE TABLE t (id TEXT);");
        assert_eq!(sum.len(), 64);
        assert_eq!(sum, checksum("CREATE TABLE t (id TEXT);"));
    }
}
