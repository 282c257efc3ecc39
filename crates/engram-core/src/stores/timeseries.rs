//! Time-series store adapter.
//!
//! Hypertables for episodic memories, emotional memories and portfolio
//! snapshots, emulated over SQLite with time-keyed indexes. Range scans use
//! cursor pagination: the cursor is the timestamp of the last row returned.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use super::{lock_poisoned, migrations, open_pair, StoreHealth, StoreResult};
use crate::memory::{EmotionalFields, EpisodicFields};

// ============================================================================
// TABLES & ROWS
// ============================================================================

/// The hypertables this adapter manages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSeriesTable {
    Episodic,
    Emotional,
    PortfolioSnapshots,
}

impl TimeSeriesTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeSeriesTable::Episodic => "episodic_memories",
            TimeSeriesTable::Emotional => "emotional_memories",
            TimeSeriesTable::PortfolioSnapshots => "portfolio_snapshots",
        }
    }
}

/// Episodic hypertable row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodicRow {
    pub memory_id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub fields: EpisodicFields,
    pub created_at: DateTime<Utc>,
}

/// Emotional hypertable row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionalRow {
    pub memory_id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub fields: EmotionalFields,
    pub created_at: DateTime<Utc>,
}

/// Materialized portfolio snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRow {
    pub user_id: String,
    pub snapshot_at: DateTime<Utc>,
    pub total_value: f64,
    /// JSON-encoded holdings at snapshot time
    pub holdings: serde_json::Value,
}

/// One page of a cursor-paginated range scan
#[derive(Debug, Clone)]
pub struct ScanPage<T> {
    pub rows: Vec<T>,
    /// Pass back to continue the scan; None when exhausted
    pub next_cursor: Option<String>,
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

// ============================================================================
// STORE
// ============================================================================

/// The time-series store adapter
pub struct TimeSeriesStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl TimeSeriesStore {
    /// Open (or create) the time-series store at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        let (writer, reader) = open_pair(path, "timeseries", migrations::TIMESERIES_MIGRATIONS)?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    /// Health probe
    pub fn health(&self) -> StoreHealth {
        StoreHealth::probe(|| {
            let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
            reader.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    /// Upsert an episodic row keyed on memory id
    pub fn insert_episodic(&self, row: &EpisodicRow) -> StoreResult<()> {
        let participants =
            serde_json::to_string(&row.fields.participants).unwrap_or_else(|_| "[]".into());
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT OR REPLACE INTO episodic_memories (
                memory_id, user_id, event_timestamp, event_type, location, participants,
                emotional_valence, emotional_arousal, importance_score, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.memory_id,
                row.user_id,
                ts(row.fields.event_timestamp),
                row.fields.event_type,
                row.fields.location,
                participants,
                row.fields.emotional_valence,
                row.fields.emotional_arousal,
                row.fields.importance_score,
                ts(row.created_at),
            ],
        )?;
        Ok(())
    }

    /// Upsert an emotional row keyed on memory id
    pub fn insert_emotional(&self, row: &EmotionalRow) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT OR REPLACE INTO emotional_memories (
                memory_id, user_id, timestamp, emotional_state, valence, arousal,
                dominance, intensity, duration_seconds, trigger_event, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.memory_id,
                row.user_id,
                ts(row.fields.timestamp.unwrap_or(row.created_at)),
                row.fields.emotional_state,
                row.fields.valence,
                row.fields.arousal,
                row.fields.dominance,
                row.fields.intensity,
                row.fields.duration_seconds,
                row.fields.trigger_event,
                ts(row.created_at),
            ],
        )?;
        Ok(())
    }

    /// Upsert a snapshot keyed on (user, snapshot time)
    pub fn insert_snapshot(&self, row: &SnapshotRow) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT OR REPLACE INTO portfolio_snapshots (user_id, snapshot_at, total_value, holdings)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                row.user_id,
                ts(row.snapshot_at),
                row.total_value,
                row.holdings.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Whether a row for this memory exists in the given hypertable
    /// (reconciliation check)
    pub fn exists(&self, table: TimeSeriesTable, memory_id: &str) -> StoreResult<bool> {
        let sql = match table {
            TimeSeriesTable::Episodic => "SELECT 1 FROM episodic_memories WHERE memory_id = ?1",
            TimeSeriesTable::Emotional => "SELECT 1 FROM emotional_memories WHERE memory_id = ?1",
            TimeSeriesTable::PortfolioSnapshots => {
                return Err(super::StoreError::InvalidInput(
                    "snapshots are not keyed by memory id".into(),
                ))
            }
        };
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let found: Option<i64> = reader.query_row(sql, [memory_id], |row| row.get(0)).optional()?;
        Ok(found.is_some())
    }

    /// Delete the row for a memory; true when one existed
    pub fn delete_for_memory(&self, table: TimeSeriesTable, memory_id: &str) -> StoreResult<bool> {
        let sql = match table {
            TimeSeriesTable::Episodic => "DELETE FROM episodic_memories WHERE memory_id = ?1",
            TimeSeriesTable::Emotional => "DELETE FROM emotional_memories WHERE memory_id = ?1",
            TimeSeriesTable::PortfolioSnapshots => {
                return Err(super::StoreError::InvalidInput(
                    "snapshots are not keyed by memory id".into(),
                ))
            }
        };
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        let deleted = writer.execute(sql, [memory_id])?;
        Ok(deleted > 0)
    }

    /// Cursor-paginated episodic range scan, newest first
    pub fn range_scan_episodic(
        &self,
        user_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: usize,
        cursor: Option<&str>,
    ) -> StoreResult<ScanPage<EpisodicRow>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let mut stmt = reader.prepare(
            "SELECT memory_id, user_id, event_timestamp, event_type, location, participants,
                    emotional_valence, emotional_arousal, importance_score, created_at
             FROM episodic_memories
             WHERE user_id = ?1
               AND event_timestamp >= ?2 AND event_timestamp <= ?3
               AND event_timestamp < ?4
             ORDER BY event_timestamp DESC
             LIMIT ?5",
        )?;
        let floor = from.map(ts).unwrap_or_else(|| "0000".into());
        let ceiling = to.map(ts).unwrap_or_else(|| "9999".into());
        let cursor_bound = cursor.map(str::to_string).unwrap_or_else(|| "9999".into());
        let rows: Vec<EpisodicRow> = stmt
            .query_map(
                params![user_id, floor, ceiling, cursor_bound, limit as i64],
                |row| {
                    let event_timestamp: String = row.get(2)?;
                    let participants: String = row.get(5)?;
                    let created_at: String = row.get(9)?;
                    Ok(EpisodicRow {
                        memory_id: row.get(0)?,
                        user_id: row.get(1)?,
                        fields: EpisodicFields {
                            event_timestamp: parse_ts(&event_timestamp),
                            event_type: row.get(3)?,
                            location: row.get(4)?,
                            participants: serde_json::from_str(&participants).unwrap_or_default(),
                            emotional_valence: row.get(6)?,
                            emotional_arousal: row.get(7)?,
                            importance_score: row.get(8)?,
                        },
                        created_at: parse_ts(&created_at),
                    })
                },
            )?
            .collect::<rusqlite::Result<_>>()?;

        let next_cursor = if rows.len() == limit {
            rows.last().map(|row| ts(row.fields.event_timestamp))
        } else {
            None
        };
        Ok(ScanPage { rows, next_cursor })
    }

    /// Cursor-paginated emotional range scan, newest first
    pub fn range_scan_emotional(
        &self,
        user_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: usize,
        cursor: Option<&str>,
    ) -> StoreResult<ScanPage<EmotionalRow>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let mut stmt = reader.prepare(
            "SELECT memory_id, user_id, timestamp, emotional_state, valence, arousal,
                    dominance, intensity, duration_seconds, trigger_event, created_at
             FROM emotional_memories
             WHERE user_id = ?1
               AND timestamp >= ?2 AND timestamp <= ?3
               AND timestamp < ?4
             ORDER BY timestamp DESC
             LIMIT ?5",
        )?;
        let floor = from.map(ts).unwrap_or_else(|| "0000".into());
        let ceiling = to.map(ts).unwrap_or_else(|| "9999".into());
        let cursor_bound = cursor.map(str::to_string).unwrap_or_else(|| "9999".into());
        let rows: Vec<EmotionalRow> = stmt
            .query_map(
                params![user_id, floor, ceiling, cursor_bound, limit as i64],
                |row| {
                    let timestamp: String = row.get(2)?;
                    let created_at: String = row.get(10)?;
                    Ok(EmotionalRow {
                        memory_id: row.get(0)?,
                        user_id: row.get(1)?,
                        fields: EmotionalFields {
                            timestamp: Some(parse_ts(&timestamp)),
                            emotional_state: row.get(3)?,
                            valence: row.get(4)?,
                            arousal: row.get(5)?,
                            dominance: row.get(6)?,
                            intensity: row.get(7)?,
                            duration_seconds: row.get(8)?,
                            trigger_event: row.get(9)?,
                        },
                        created_at: parse_ts(&created_at),
                    })
                },
            )?
            .collect::<rusqlite::Result<_>>()?;

        let next_cursor = if rows.len() == limit {
            rows.last()
                .and_then(|row| row.fields.timestamp)
                .map(ts)
        } else {
            None
        };
        Ok(ScanPage { rows, next_cursor })
    }

    /// Snapshot history for a user, newest first
    pub fn range_scan_snapshots(
        &self,
        user_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<SnapshotRow>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let mut stmt = reader.prepare(
            "SELECT user_id, snapshot_at, total_value, holdings
             FROM portfolio_snapshots
             WHERE user_id = ?1 AND snapshot_at >= ?2 AND snapshot_at <= ?3
             ORDER BY snapshot_at DESC LIMIT ?4",
        )?;
        let floor = from.map(ts).unwrap_or_else(|| "0000".into());
        let ceiling = to.map(ts).unwrap_or_else(|| "9999".into());
        let rows = stmt
            .query_map(params![user_id, floor, ceiling, limit as i64], |row| {
                let snapshot_at: String = row.get(1)?;
                let holdings: String = row.get(3)?;
                Ok(SnapshotRow {
                    user_id: row.get(0)?,
                    snapshot_at: parse_ts(&snapshot_at),
                    total_value: row.get(2)?,
                    holdings: serde_json::from_str(&holdings)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, TimeSeriesStore) {
        let dir = TempDir::new().unwrap();
        let store = TimeSeriesStore::open(&dir.path().join("timeseries.db")).unwrap();
        (dir, store)
    }

    fn episodic(memory_id: &str, at: DateTime<Utc>) -> EpisodicRow {
        EpisodicRow {
            memory_id: memory_id.into(),
            user_id: "u1".into(),
            fields: EpisodicFields {
                event_timestamp: at,
                event_type: Some("family_milestone".into()),
                location: Some("Stanford".into()),
                participants: vec!["Sarah".into()],
                emotional_valence: Some(0.8),
                emotional_arousal: Some(0.6),
                importance_score: Some(0.9),
            },
            created_at: at,
        }
    }

    #[test]
    fn test_episodic_insert_is_idempotent() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        store.insert_episodic(&episodic("m1", now)).unwrap();
        store.insert_episodic(&episodic("m1", now)).unwrap();

        assert!(store.exists(TimeSeriesTable::Episodic, "m1").unwrap());
        let page = store
            .range_scan_episodic("u1", None, None, 10, None)
            .unwrap();
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].fields.participants, vec!["Sarah"]);
    }

    #[test]
    fn test_range_scan_window_and_cursor() {
        let (_dir, store) = open_store();
        let base = Utc::now();
        for i in 0..5 {
            store
                .insert_episodic(&episodic(&format!("m{i}"), base - Duration::days(i)))
                .unwrap();
        }

        // Window excludes the two oldest
        let page = store
            .range_scan_episodic("u1", Some(base - Duration::days(2)), Some(base), 10, None)
            .unwrap();
        assert_eq!(page.rows.len(), 3);
        assert!(page.next_cursor.is_none());

        // Cursor walks the full set in two pages
        let first = store
            .range_scan_episodic("u1", None, None, 3, None)
            .unwrap();
        assert_eq!(first.rows.len(), 3);
        let cursor = first.next_cursor.expect("full page yields a cursor");
        let second = store
            .range_scan_episodic("u1", None, None, 3, Some(&cursor))
            .unwrap();
        assert_eq!(second.rows.len(), 2);
        assert!(second.rows.iter().all(|row| !first
            .rows
            .iter()
            .any(|seen| seen.memory_id == row.memory_id)));
    }

    #[test]
    fn test_emotional_roundtrip_and_delete() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        store
            .insert_emotional(&EmotionalRow {
                memory_id: "m1".into(),
                user_id: "u1".into(),
                fields: EmotionalFields {
                    timestamp: Some(now),
                    emotional_state: "anxious".into(),
                    valence: -0.6,
                    arousal: 0.8,
                    dominance: Some(0.3),
                    intensity: Some(0.7),
                    duration_seconds: Some(3600),
                    trigger_event: Some("deadline".into()),
                },
                created_at: now,
            })
            .unwrap();

        let page = store
            .range_scan_emotional("u1", None, None, 10, None)
            .unwrap();
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].fields.emotional_state, "anxious");

        assert!(store.delete_for_memory(TimeSeriesTable::Emotional, "m1").unwrap());
        assert!(!store.exists(TimeSeriesTable::Emotional, "m1").unwrap());
    }

    #[test]
    fn test_snapshots_keyed_by_user_and_time() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        let row = SnapshotRow {
            user_id: "u1".into(),
            snapshot_at: now,
            total_value: 12_500.0,
            holdings: serde_json::json!([{"ticker": "NVDA", "shares": 10.0}]),
        };
        store.insert_snapshot(&row).unwrap();
        store.insert_snapshot(&row).unwrap();

        let rows = store.range_scan_snapshots("u1", None, None, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_value, 12_500.0);
    }
}
