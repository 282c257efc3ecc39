//! Relational store adapter.
//!
//! Typed CRUD over the procedural/identity/profile/portfolio/intent tables
//! plus the claim primitive used by the scheduled-intent engine and the
//! compare-and-set lock rows used by the maintenance engine. Multi-table
//! writes for a single memory happen inside one transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use super::{lock_poisoned, migrations, open_pair, StoreError, StoreHealth, StoreResult};
use crate::intents::{ExecutionRecord, ExecutionStatus, IntentRecord, TriggerType};
use crate::memory::{IdentityFields, PortfolioEvent, ProceduralFields, ProficiencyLevel, TradeAction};

// ============================================================================
// ROW TYPES
// ============================================================================

/// Stored procedural projection
#[derive(Debug, Clone)]
pub struct ProceduralRow {
    pub memory_id: String,
    pub user_id: String,
    pub fields: ProceduralFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Folded holdings view row
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldingRow {
    pub user_id: String,
    pub ticker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_name: Option<String>,
    pub shares: f64,
    pub avg_price: f64,
    pub first_acquired: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Append-only ledger row
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRow {
    pub id: i64,
    pub user_id: String,
    pub ticker: String,
    pub action: TradeAction,
    pub shares: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// One populated profile field
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileFieldRow {
    pub category: String,
    pub field: String,
    pub value: String,
    pub confidence: f64,
    pub explicitness: f64,
    pub updated_at: DateTime<Utc>,
}

/// Confidence blend components for one profile field
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceComponents {
    pub frequency: f64,
    pub recency: f64,
    pub explicitness: f64,
    pub diversity: f64,
    pub blended: f64,
}

/// A graph edge between two memories
#[derive(Debug, Clone)]
pub struct RelationRow {
    pub src_id: String,
    pub dst_id: String,
    pub relation: String,
    pub weight: f64,
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

// ============================================================================
// STORE
// ============================================================================

/// The relational store adapter
pub struct RelationalStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl RelationalStore {
    /// Open (or create) the relational store at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        let (writer, reader) = open_pair(path, "relational", migrations::RELATIONAL_MIGRATIONS)?;
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

    // ========================================================================
    // PROCEDURAL
    // ========================================================================

    /// Upsert the procedural projection for a memory, appending a row to the
    /// skill progression history in the same transaction.
    pub fn upsert_procedural(
        &self,
        memory_id: &str,
        user_id: &str,
        fields: &ProceduralFields,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let prerequisites = serde_json::to_string(&fields.prerequisites).unwrap_or_else(|_| "[]".into());
        let mut writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        let tx = writer.transaction()?;
        tx.execute(
            "INSERT INTO procedural_memories (
                memory_id, user_id, skill_name, proficiency_level, practice_count,
                success_rate, difficulty_rating, prerequisites, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT(memory_id) DO UPDATE SET
                skill_name = excluded.skill_name,
                proficiency_level = excluded.proficiency_level,
                practice_count = excluded.practice_count,
                success_rate = excluded.success_rate,
                difficulty_rating = excluded.difficulty_rating,
                prerequisites = excluded.prerequisites,
                updated_at = excluded.updated_at",
            params![
                memory_id,
                user_id,
                fields.skill_name,
                fields.proficiency_level.as_str(),
                fields.practice_count,
                fields.success_rate,
                fields.difficulty_rating,
                prerequisites,
                ts(now),
            ],
        )?;
        tx.execute(
            "INSERT INTO skill_progressions (user_id, skill_name, proficiency_level, practice_count, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                fields.skill_name,
                fields.proficiency_level.as_str(),
                fields.practice_count,
                ts(now),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Fetch the procedural projection for a memory
    pub fn get_procedural(&self, memory_id: &str) -> StoreResult<Option<ProceduralRow>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let row = reader
            .query_row(
                "SELECT memory_id, user_id, skill_name, proficiency_level, practice_count,
                        success_rate, difficulty_rating, prerequisites, created_at, updated_at
                 FROM procedural_memories WHERE memory_id = ?1",
                [memory_id],
                |row| {
                    let prerequisites: String = row.get(7)?;
                    let created_at: String = row.get(8)?;
                    let updated_at: String = row.get(9)?;
                    let level: String = row.get(3)?;
                    Ok(ProceduralRow {
                        memory_id: row.get(0)?,
                        user_id: row.get(1)?,
                        fields: ProceduralFields {
                            skill_name: row.get(2)?,
                            proficiency_level: ProficiencyLevel::parse_name(&level)
                                .unwrap_or_default(),
                            practice_count: row.get(4)?,
                            success_rate: row.get(5)?,
                            difficulty_rating: row.get(6)?,
                            prerequisites: serde_json::from_str(&prerequisites)
                                .unwrap_or_default(),
                        },
                        created_at: parse_ts(Some(created_at)).unwrap_or_else(Utc::now),
                        updated_at: parse_ts(Some(updated_at)).unwrap_or_else(Utc::now),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Whether the procedural row exists (reconciliation check)
    pub fn procedural_exists(&self, memory_id: &str) -> StoreResult<bool> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let found: Option<i64> = reader
            .query_row(
                "SELECT 1 FROM procedural_memories WHERE memory_id = ?1",
                [memory_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Delete the procedural projection; true when a row existed
    pub fn delete_procedural(&self, memory_id: &str) -> StoreResult<bool> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        let deleted =
            writer.execute("DELETE FROM procedural_memories WHERE memory_id = ?1", [memory_id])?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // IDENTITY
    // ========================================================================

    /// Merge an identity projection into the single per-user row. Scalar
    /// fields overwrite when present; list fields are unioned.
    pub fn upsert_identity(
        &self,
        user_id: &str,
        fields: &IdentityFields,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let existing = self.get_identity(user_id)?.unwrap_or_default();
        let merged = IdentityFields {
            core_values: union(existing.core_values, &fields.core_values),
            self_concept: fields.self_concept.clone().or(existing.self_concept),
            ideal_self: fields.ideal_self.clone().or(existing.ideal_self),
            feared_self: fields.feared_self.clone().or(existing.feared_self),
            life_roles: union(existing.life_roles, &fields.life_roles),
            personality_traits: union(existing.personality_traits, &fields.personality_traits),
            growth_edges: union(existing.growth_edges, &fields.growth_edges),
            contradictions: union(existing.contradictions, &fields.contradictions),
        };

        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT INTO identity_memories (
                user_id, core_values, self_concept, ideal_self, feared_self,
                life_roles, personality_traits, growth_edges, contradictions, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(user_id) DO UPDATE SET
                core_values = excluded.core_values,
                self_concept = excluded.self_concept,
                ideal_self = excluded.ideal_self,
                feared_self = excluded.feared_self,
                life_roles = excluded.life_roles,
                personality_traits = excluded.personality_traits,
                growth_edges = excluded.growth_edges,
                contradictions = excluded.contradictions,
                updated_at = excluded.updated_at",
            params![
                user_id,
                serde_json::to_string(&merged.core_values).unwrap_or_else(|_| "[]".into()),
                merged.self_concept,
                merged.ideal_self,
                merged.feared_self,
                serde_json::to_string(&merged.life_roles).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&merged.personality_traits).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&merged.growth_edges).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&merged.contradictions).unwrap_or_else(|_| "[]".into()),
                ts(now),
            ],
        )?;
        Ok(())
    }

    /// Fetch the per-user identity row
    pub fn get_identity(&self, user_id: &str) -> StoreResult<Option<IdentityFields>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let row = reader
            .query_row(
                "SELECT core_values, self_concept, ideal_self, feared_self,
                        life_roles, personality_traits, growth_edges, contradictions
                 FROM identity_memories WHERE user_id = ?1",
                [user_id],
                |row| {
                    let core_values: String = row.get(0)?;
                    let life_roles: String = row.get(4)?;
                    let traits: String = row.get(5)?;
                    let growth: String = row.get(6)?;
                    let contradictions: String = row.get(7)?;
                    Ok(IdentityFields {
                        core_values: serde_json::from_str(&core_values).unwrap_or_default(),
                        self_concept: row.get(1)?,
                        ideal_self: row.get(2)?,
                        feared_self: row.get(3)?,
                        life_roles: serde_json::from_str(&life_roles).unwrap_or_default(),
                        personality_traits: serde_json::from_str(&traits).unwrap_or_default(),
                        growth_edges: serde_json::from_str(&growth).unwrap_or_default(),
                        contradictions: serde_json::from_str(&contradictions).unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ========================================================================
    // GRAPH RELATIONS
    // ========================================================================

    /// Insert or bump a memory-to-memory relation edge
    pub fn add_relation(
        &self,
        src_id: &str,
        dst_id: &str,
        relation: &str,
        weight: f64,
    ) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT INTO memory_relations (src_id, dst_id, relation, weight, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(src_id, dst_id, relation) DO UPDATE SET weight = excluded.weight",
            params![src_id, dst_id, relation, weight, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// All edges touching a memory, in either direction
    pub fn neighbors(&self, id: &str) -> StoreResult<Vec<RelationRow>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let mut stmt = reader.prepare(
            "SELECT src_id, dst_id, relation, weight FROM memory_relations
             WHERE src_id = ?1 OR dst_id = ?1",
        )?;
        let edges = stmt
            .query_map([id], |row| {
                Ok(RelationRow {
                    src_id: row.get(0)?,
                    dst_id: row.get(1)?,
                    relation: row.get(2)?,
                    weight: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(edges)
    }

    /// Drop every edge touching a memory (called on delete)
    pub fn delete_relations_for(&self, id: &str) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "DELETE FROM memory_relations WHERE src_id = ?1 OR dst_id = ?1",
            [id],
        )?;
        Ok(())
    }

    // ========================================================================
    // PORTFOLIO
    // ========================================================================

    /// Append a ledger transaction and fold it into the holdings view in one
    /// transaction. Buys average into the position; sells reduce it; a
    /// position folded to zero shares is removed.
    pub fn apply_portfolio_event(
        &self,
        user_id: &str,
        event: &PortfolioEvent,
        memory_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        let tx = writer.transaction()?;
        // The memory id is the idempotency key: re-applying the same memory's
        // write plan must not double-book the ledger.
        if let Some(memory_id) = memory_id {
            let already: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM portfolio_transactions WHERE memory_id = ?1",
                    [memory_id],
                    |row| row.get(0),
                )
                .optional()?;
            if already.is_some() {
                return Ok(());
            }
        }
        tx.execute(
            "INSERT INTO portfolio_transactions (user_id, ticker, action, shares, price, asset_name, memory_id, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user_id,
                event.ticker,
                event.action.as_str(),
                event.shares,
                event.price,
                event.asset_name,
                memory_id,
                ts(now),
            ],
        )?;
        fold_event_into_holding(&tx, user_id, event, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Rebuild the holdings view for a user by folding the full ledger
    pub fn rebuild_holdings(&self, user_id: &str) -> StoreResult<usize> {
        let transactions = self.list_transactions(user_id, None)?;
        let mut writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        let tx = writer.transaction()?;
        tx.execute("DELETE FROM portfolio_holdings WHERE user_id = ?1", [user_id])?;
        for record in &transactions {
            let event = PortfolioEvent {
                ticker: record.ticker.clone(),
                asset_name: record.asset_name.clone(),
                shares: record.shares,
                price: record.price,
                action: record.action,
            };
            fold_event_into_holding(&tx, user_id, &event, record.executed_at)?;
        }
        tx.commit()?;
        let holdings = self.list_holdings(user_id)?;
        Ok(holdings.len())
    }

    /// Current holdings for a user, ordered by ticker
    pub fn list_holdings(&self, user_id: &str) -> StoreResult<Vec<HoldingRow>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let mut stmt = reader.prepare(
            "SELECT user_id, ticker, asset_name, shares, avg_price, first_acquired, last_updated
             FROM portfolio_holdings WHERE user_id = ?1 ORDER BY ticker",
        )?;
        let holdings = stmt
            .query_map([user_id], holding_from_sql)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(holdings)
    }

    /// One holding, if present
    pub fn get_holding(&self, user_id: &str, ticker: &str) -> StoreResult<Option<HoldingRow>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let row = reader
            .query_row(
                "SELECT user_id, ticker, asset_name, shares, avg_price, first_acquired, last_updated
                 FROM portfolio_holdings WHERE user_id = ?1 AND ticker = ?2",
                params![user_id, ticker],
                holding_from_sql,
            )
            .optional()?;
        Ok(row)
    }

    /// Delete a holding row; true when it existed
    pub fn delete_holding(&self, user_id: &str, ticker: &str) -> StoreResult<bool> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        let deleted = writer.execute(
            "DELETE FROM portfolio_holdings WHERE user_id = ?1 AND ticker = ?2",
            params![user_id, ticker],
        )?;
        Ok(deleted > 0)
    }

    /// Ledger rows for a user, oldest first
    pub fn list_transactions(
        &self,
        user_id: &str,
        ticker: Option<&str>,
    ) -> StoreResult<Vec<TransactionRow>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let mut rows = Vec::new();
        let mut push = |row: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
            let action: String = row.get(3)?;
            let executed_at: String = row.get(8)?;
            rows.push(TransactionRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                ticker: row.get(2)?,
                action: TradeAction::parse_name(&action).unwrap_or_default(),
                shares: row.get(4)?,
                price: row.get(5)?,
                asset_name: row.get(6)?,
                memory_id: row.get(7)?,
                executed_at: parse_ts(Some(executed_at)).unwrap_or_else(Utc::now),
            });
            Ok(())
        };
        match ticker {
            Some(ticker) => {
                let mut stmt = reader.prepare(
                    "SELECT id, user_id, ticker, action, shares, price, asset_name, memory_id, executed_at
                     FROM portfolio_transactions WHERE user_id = ?1 AND ticker = ?2 ORDER BY id",
                )?;
                let mut iter = stmt.query(params![user_id, ticker])?;
                while let Some(row) = iter.next()? {
                    push(row)?;
                }
            }
            None => {
                let mut stmt = reader.prepare(
                    "SELECT id, user_id, ticker, action, shares, price, asset_name, memory_id, executed_at
                     FROM portfolio_transactions WHERE user_id = ?1 ORDER BY id",
                )?;
                let mut iter = stmt.query([user_id])?;
                while let Some(row) = iter.next()? {
                    push(row)?;
                }
            }
        }
        Ok(rows)
    }

    /// Free-form portfolio preferences blob
    pub fn get_portfolio_preferences(&self, user_id: &str) -> StoreResult<Option<Value>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let raw: Option<String> = reader
            .query_row(
                "SELECT preferences FROM portfolio_preferences WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    /// Replace the preferences blob
    pub fn set_portfolio_preferences(&self, user_id: &str, preferences: &Value) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT INTO portfolio_preferences (user_id, preferences, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                preferences = excluded.preferences,
                updated_at = excluded.updated_at",
            params![user_id, preferences.to_string(), ts(Utc::now())],
        )?;
        Ok(())
    }

    // ========================================================================
    // PROFILE
    // ========================================================================

    /// Ensure the per-user profile header row exists
    pub fn ensure_profile(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT INTO user_profiles (user_id, created_at, updated_at)
             VALUES (?1, ?2, ?2)
             ON CONFLICT(user_id) DO UPDATE SET updated_at = excluded.updated_at",
            params![user_id, ts(now)],
        )?;
        Ok(())
    }

    /// Upsert one profile field value
    pub fn upsert_profile_field(
        &self,
        user_id: &str,
        category: &str,
        field: &str,
        value: &str,
        confidence: f64,
        explicitness: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT INTO profile_fields (user_id, category, field, value, confidence, explicitness, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id, category, field) DO UPDATE SET
                value = excluded.value,
                confidence = excluded.confidence,
                explicitness = excluded.explicitness,
                updated_at = excluded.updated_at",
            params![user_id, category, field, value, confidence, explicitness, ts(now)],
        )?;
        Ok(())
    }

    /// Populated fields, optionally restricted to one category
    pub fn get_profile_fields(
        &self,
        user_id: &str,
        category: Option<&str>,
    ) -> StoreResult<Vec<ProfileFieldRow>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ProfileFieldRow> {
            let updated_at: String = row.get(5)?;
            Ok(ProfileFieldRow {
                category: row.get(0)?,
                field: row.get(1)?,
                value: row.get(2)?,
                confidence: row.get(3)?,
                explicitness: row.get(4)?,
                updated_at: parse_ts(Some(updated_at)).unwrap_or_else(Utc::now),
            })
        };
        let rows = match category {
            Some(category) => {
                let mut stmt = reader.prepare(
                    "SELECT category, field, value, confidence, explicitness, updated_at
                     FROM profile_fields WHERE user_id = ?1 AND category = ?2
                     ORDER BY category, field",
                )?;
                let rows = stmt
                    .query_map(params![user_id, category], map_row)?
                    .collect::<rusqlite::Result<_>>()?;
                rows
            }
            None => {
                let mut stmt = reader.prepare(
                    "SELECT category, field, value, confidence, explicitness, updated_at
                     FROM profile_fields WHERE user_id = ?1
                     ORDER BY category, field",
                )?;
                let rows = stmt
                    .query_map([user_id], map_row)?
                    .collect::<rusqlite::Result<_>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// Record a contributing memory for a field (audit trail)
    pub fn add_profile_source(
        &self,
        user_id: &str,
        category: &str,
        field: &str,
        memory_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT INTO profile_sources (user_id, category, field, memory_id, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, category, field, memory_id, ts(now)],
        )?;
        Ok(())
    }

    /// Contributing memory ids with their recording times, newest first
    pub fn list_profile_sources(
        &self,
        user_id: &str,
        category: &str,
        field: &str,
    ) -> StoreResult<Vec<(String, DateTime<Utc>)>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let mut stmt = reader.prepare(
            "SELECT memory_id, added_at FROM profile_sources
             WHERE user_id = ?1 AND category = ?2 AND field = ?3
             ORDER BY added_at DESC",
        )?;
        let sources = stmt
            .query_map(params![user_id, category, field], |row| {
                let added_at: String = row.get(1)?;
                Ok((
                    row.get::<_, String>(0)?,
                    parse_ts(Some(added_at)).unwrap_or_else(Utc::now),
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(sources)
    }

    /// Store the confidence blend components for one field
    pub fn upsert_confidence_scores(
        &self,
        user_id: &str,
        category: &str,
        field: &str,
        components: ConfidenceComponents,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT INTO profile_confidence_scores
                (user_id, category, field, frequency, recency, explicitness, diversity, blended, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id, category, field) DO UPDATE SET
                frequency = excluded.frequency,
                recency = excluded.recency,
                explicitness = excluded.explicitness,
                diversity = excluded.diversity,
                blended = excluded.blended,
                updated_at = excluded.updated_at",
            params![
                user_id,
                category,
                field,
                components.frequency,
                components.recency,
                components.explicitness,
                components.diversity,
                components.blended,
                ts(now),
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // SCHEDULED INTENTS
    // ========================================================================

    /// Insert a new intent
    pub fn insert_intent(&self, intent: &IntentRecord) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT INTO scheduled_intents (
                id, user_id, intent_name, description, trigger_type, trigger_schedule,
                trigger_condition, action_type, action_context, action_priority,
                next_check, last_checked, last_executed, execution_count,
                last_execution_status, enabled, disabled_reason, expires_at,
                max_executions, last_condition_fire, claimed_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            rusqlite::params_from_iter(intent_values(intent)),
        )?;
        Ok(())
    }

    /// Full-row update for an existing intent
    pub fn save_intent(&self, intent: &IntentRecord) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        let updated = writer.execute(
            "UPDATE scheduled_intents SET
                user_id = ?2, intent_name = ?3, description = ?4, trigger_type = ?5,
                trigger_schedule = ?6, trigger_condition = ?7, action_type = ?8,
                action_context = ?9, action_priority = ?10, next_check = ?11,
                last_checked = ?12, last_executed = ?13, execution_count = ?14,
                last_execution_status = ?15, enabled = ?16, disabled_reason = ?17,
                expires_at = ?18, max_executions = ?19, last_condition_fire = ?20,
                claimed_at = ?21, created_at = ?22, updated_at = ?23
             WHERE id = ?1",
            rusqlite::params_from_iter(intent_values(intent)),
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("intent {}", intent.id)));
        }
        Ok(())
    }

    /// Fetch one intent
    pub fn get_intent(&self, id: &str) -> StoreResult<Option<IntentRecord>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let row = reader
            .query_row(
                &format!("{INTENT_SELECT} WHERE id = ?1"),
                [id],
                intent_from_sql,
            )
            .optional()?;
        Ok(row)
    }

    /// Delete an intent and keep its execution audit rows
    pub fn delete_intent(&self, id: &str) -> StoreResult<bool> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        let deleted = writer.execute("DELETE FROM scheduled_intents WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    /// List intents, optionally scoped to a user
    pub fn list_intents(
        &self,
        user_id: Option<&str>,
        include_disabled: bool,
    ) -> StoreResult<Vec<IntentRecord>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let enabled_clause = if include_disabled { "" } else { "AND enabled = 1" };
        let rows = match user_id {
            Some(user_id) => {
                let sql = format!(
                    "{INTENT_SELECT} WHERE user_id = ?1 {enabled_clause} ORDER BY created_at DESC"
                );
                let mut stmt = reader.prepare(&sql)?;
                let rows = stmt
                    .query_map([user_id], intent_from_sql)?
                    .collect::<rusqlite::Result<_>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "{INTENT_SELECT} WHERE 1 = 1 {enabled_clause} ORDER BY created_at DESC"
                );
                let mut stmt = reader.prepare(&sql)?;
                let rows = stmt
                    .query_map([], intent_from_sql)?
                    .collect::<rusqlite::Result<_>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// Due intents: enabled, next_check set and arrived. Uses the partial
    /// index on next_check.
    pub fn pending_intents(
        &self,
        user_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<IntentRecord>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let rows = match user_id {
            Some(user_id) => {
                let sql = format!(
                    "{INTENT_SELECT}
                     WHERE enabled = 1 AND next_check IS NOT NULL AND next_check <= ?1
                       AND user_id = ?2
                     ORDER BY next_check ASC"
                );
                let mut stmt = reader.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![ts(now), user_id], intent_from_sql)?
                    .collect::<rusqlite::Result<_>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "{INTENT_SELECT}
                     WHERE enabled = 1 AND next_check IS NOT NULL AND next_check <= ?1
                     ORDER BY next_check ASC"
                );
                let mut stmt = reader.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![ts(now)], intent_from_sql)?
                    .collect::<rusqlite::Result<_>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// Atomically stamp `claimed_at` on up to `limit` due rows whose claim is
    /// absent or expired, then return the claimed rows. Two workers never
    /// claim the same intent within the TTL.
    pub fn claim_due_intents(
        &self,
        user_id: Option<&str>,
        limit: usize,
        claim_ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<IntentRecord>> {
        let claim_cutoff = ts(now - chrono::Duration::seconds(claim_ttl_secs));
        let mut writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        let tx = writer.transaction()?;

        let ids: Vec<String> = match user_id {
            Some(user_id) => {
                let mut stmt = tx.prepare(
                    "SELECT id FROM scheduled_intents
                     WHERE enabled = 1 AND next_check IS NOT NULL AND next_check <= ?1
                       AND (claimed_at IS NULL OR claimed_at < ?2)
                       AND user_id = ?3
                     ORDER BY next_check ASC LIMIT ?4",
                )?;
                let ids = stmt
                    .query_map(
                        params![ts(now), claim_cutoff, user_id, limit as i64],
                        |row| row.get(0),
                    )?
                    .collect::<rusqlite::Result<_>>()?;
                ids
            }
            None => {
                let mut stmt = tx.prepare(
                    "SELECT id FROM scheduled_intents
                     WHERE enabled = 1 AND next_check IS NOT NULL AND next_check <= ?1
                       AND (claimed_at IS NULL OR claimed_at < ?2)
                     ORDER BY next_check ASC LIMIT ?3",
                )?;
                let ids = stmt
                    .query_map(params![ts(now), claim_cutoff, limit as i64], |row| row.get(0))?
                    .collect::<rusqlite::Result<_>>()?;
                ids
            }
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            let stamped = tx.execute(
                "UPDATE scheduled_intents SET claimed_at = ?1
                 WHERE id = ?2 AND (claimed_at IS NULL OR claimed_at < ?3)",
                params![ts(now), id, claim_cutoff],
            )?;
            if stamped > 0 {
                if let Some(intent) = tx
                    .query_row(&format!("{INTENT_SELECT} WHERE id = ?1"), [id], intent_from_sql)
                    .optional()?
                {
                    claimed.push(intent);
                }
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// Append an immutable execution audit row
    pub fn insert_execution(&self, execution: &ExecutionRecord) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT INTO intent_executions (
                id, intent_id, executed_at, trigger_type, trigger_data, status,
                gate_result, message_id, message_preview, duration_ms, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                execution.id,
                execution.intent_id,
                ts(execution.executed_at),
                execution.trigger_type.as_str(),
                execution.trigger_data.as_ref().map(|v| v.to_string()),
                execution.status.as_str(),
                execution.gate_result,
                execution.message_id,
                execution.message_preview,
                execution.duration_ms,
                execution.error_message,
            ],
        )?;
        Ok(())
    }

    /// Execution audit rows for an intent, newest first
    pub fn list_executions(
        &self,
        intent_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<ExecutionRecord>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let mut stmt = reader.prepare(
            "SELECT id, intent_id, executed_at, trigger_type, trigger_data, status,
                    gate_result, message_id, message_preview, duration_ms, error_message
             FROM intent_executions WHERE intent_id = ?1
             ORDER BY executed_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![intent_id, limit as i64], |row| {
                let executed_at: String = row.get(2)?;
                let trigger_type: String = row.get(3)?;
                let trigger_data: Option<String> = row.get(4)?;
                let status: String = row.get(5)?;
                Ok(ExecutionRecord {
                    id: row.get(0)?,
                    intent_id: row.get(1)?,
                    executed_at: parse_ts(Some(executed_at)).unwrap_or_else(Utc::now),
                    trigger_type: TriggerType::parse_name(&trigger_type)
                        .unwrap_or(TriggerType::Interval),
                    trigger_data: trigger_data.and_then(|raw| serde_json::from_str(&raw).ok()),
                    status: ExecutionStatus::parse_name(&status)
                        .unwrap_or(ExecutionStatus::Failed),
                    gate_result: row.get(6)?,
                    message_id: row.get(7)?,
                    message_preview: row.get(8)?,
                    duration_ms: row.get(9)?,
                    error_message: row.get(10)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    // ========================================================================
    // MAINTENANCE LOCKS & HISTORY
    // ========================================================================

    /// Compare-and-set lock with TTL; true when this caller acquired it
    pub fn try_acquire_lock(
        &self,
        name: &str,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let cutoff = ts(now - chrono::Duration::seconds(ttl_secs));
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT OR IGNORE INTO maintenance_locks (name, locked_at) VALUES (?1, NULL)",
            [name],
        )?;
        let acquired = writer.execute(
            "UPDATE maintenance_locks SET locked_at = ?1
             WHERE name = ?2 AND (locked_at IS NULL OR locked_at < ?3)",
            params![ts(now), name, cutoff],
        )?;
        Ok(acquired > 0)
    }

    /// Release a lock held by this caller
    pub fn release_lock(&self, name: &str) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "UPDATE maintenance_locks SET locked_at = NULL WHERE name = ?1",
            [name],
        )?;
        Ok(())
    }

    /// Stale-lock recovery path
    pub fn force_unlock(&self, name: &str) -> StoreResult<()> {
        self.release_lock(name)
    }

    /// Record a maintenance run
    #[allow(clippy::too_many_arguments)]
    pub fn insert_maintenance_history(
        &self,
        user_id: &str,
        run_at: DateTime<Utc>,
        duration_ms: i64,
        jobs: &[String],
        counters: [i64; 6],
        success: bool,
    ) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        writer.execute(
            "INSERT INTO maintenance_history
                (user_id, run_at, duration_ms, jobs, replayed, promoted, archived, decayed, merged, repaired, success)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                user_id,
                ts(run_at),
                duration_ms,
                serde_json::to_string(jobs).unwrap_or_else(|_| "[]".into()),
                counters[0],
                counters[1],
                counters[2],
                counters[3],
                counters[4],
                counters[5],
                success as i64,
            ],
        )?;
        Ok(())
    }

    /// Most recent maintenance run timestamp for a user
    pub fn last_maintenance_run(&self, user_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let raw: Option<String> = reader
            .query_row(
                "SELECT MAX(run_at) FROM maintenance_history WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(parse_ts(raw))
    }
}

// ============================================================================
// SQL MAPPING HELPERS
// ============================================================================

const INTENT_SELECT: &str = "SELECT id, user_id, intent_name, description, trigger_type,
       trigger_schedule, trigger_condition, action_type, action_context, action_priority,
       next_check, last_checked, last_executed, execution_count, last_execution_status,
       enabled, disabled_reason, expires_at, max_executions, last_condition_fire,
       claimed_at, created_at, updated_at
  FROM scheduled_intents";

fn intent_values(intent: &IntentRecord) -> Vec<rusqlite::types::Value> {
    use rusqlite::types::Value as Sql;
    fn text(value: impl Into<String>) -> Sql {
        Sql::Text(value.into())
    }
    fn opt_text(value: Option<String>) -> Sql {
        value.map(Sql::Text).unwrap_or(Sql::Null)
    }
    fn opt_int(value: Option<i64>) -> Sql {
        value.map(Sql::Integer).unwrap_or(Sql::Null)
    }
    vec![
        text(&intent.id),
        text(&intent.user_id),
        text(&intent.intent_name),
        opt_text(intent.description.clone()),
        text(intent.trigger_type.as_str()),
        text(serde_json::to_string(&intent.trigger_schedule).unwrap_or_else(|_| "{}".into())),
        opt_text(
            intent
                .trigger_condition
                .as_ref()
                .and_then(|c| serde_json::to_string(c).ok()),
        ),
        text(intent.action_type.as_str()),
        opt_text(intent.action_context.clone()),
        text(intent.action_priority.as_str()),
        opt_text(intent.next_check.map(ts)),
        opt_text(intent.last_checked.map(ts)),
        opt_text(intent.last_executed.map(ts)),
        Sql::Integer(intent.execution_count),
        opt_text(intent.last_execution_status.clone()),
        Sql::Integer(intent.enabled as i64),
        opt_text(intent.disabled_reason.clone()),
        opt_text(intent.expires_at.map(ts)),
        opt_int(intent.max_executions),
        opt_text(intent.last_condition_fire.map(ts)),
        opt_text(intent.claimed_at.map(ts)),
        text(ts(intent.created_at)),
        text(ts(intent.updated_at)),
    ]
}

fn intent_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<IntentRecord> {
    let trigger_type: String = row.get(4)?;
    let schedule_json: String = row.get(5)?;
    let condition_json: Option<String> = row.get(6)?;
    let action_type: String = row.get(7)?;
    let action_priority: String = row.get(9)?;
    let enabled: i64 = row.get(15)?;
    Ok(IntentRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        intent_name: row.get(2)?,
        description: row.get(3)?,
        trigger_type: TriggerType::parse_name(&trigger_type).unwrap_or(TriggerType::Interval),
        trigger_schedule: serde_json::from_str(&schedule_json).unwrap_or_default(),
        trigger_condition: condition_json.and_then(|raw| serde_json::from_str(&raw).ok()),
        action_type: crate::intents::ActionType::parse_name(&action_type).unwrap_or_default(),
        action_context: row.get(8)?,
        action_priority: crate::intents::ActionPriority::parse_name(&action_priority)
            .unwrap_or_default(),
        next_check: parse_ts(row.get(10)?),
        last_checked: parse_ts(row.get(11)?),
        last_executed: parse_ts(row.get(12)?),
        execution_count: row.get(13)?,
        last_execution_status: row.get(14)?,
        enabled: enabled != 0,
        disabled_reason: row.get(16)?,
        expires_at: parse_ts(row.get(17)?),
        max_executions: row.get(18)?,
        last_condition_fire: parse_ts(row.get(19)?),
        claimed_at: parse_ts(row.get(20)?),
        created_at: parse_ts(row.get(21)?).unwrap_or_else(Utc::now),
        updated_at: parse_ts(row.get(22)?).unwrap_or_else(Utc::now),
    })
}

fn holding_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<HoldingRow> {
    let first_acquired: String = row.get(5)?;
    let last_updated: String = row.get(6)?;
    Ok(HoldingRow {
        user_id: row.get(0)?,
        ticker: row.get(1)?,
        asset_name: row.get(2)?,
        shares: row.get(3)?,
        avg_price: row.get(4)?,
        first_acquired: parse_ts(Some(first_acquired)).unwrap_or_else(Utc::now),
        last_updated: parse_ts(Some(last_updated)).unwrap_or_else(Utc::now),
    })
}

/// Fold one ledger event into the holdings view inside an open transaction
fn fold_event_into_holding(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    event: &PortfolioEvent,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let existing: Option<(f64, f64, String, Option<String>)> = tx
        .query_row(
            "SELECT shares, avg_price, first_acquired, asset_name
             FROM portfolio_holdings WHERE user_id = ?1 AND ticker = ?2",
            params![user_id, event.ticker],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    match event.action {
        TradeAction::Buy => {
            let (shares, avg_price, first_acquired, asset_name) = match existing {
                Some((held, avg, first, name)) => {
                    let total = held + event.shares;
                    let avg = if total > 0.0 {
                        (held * avg + event.shares * event.price.unwrap_or(avg)) / total
                    } else {
                        0.0
                    };
                    (total, avg, first, event.asset_name.clone().or(name))
                }
                None => (
                    event.shares,
                    event.price.unwrap_or(0.0),
                    ts(now),
                    event.asset_name.clone(),
                ),
            };
            tx.execute(
                "INSERT INTO portfolio_holdings
                    (user_id, ticker, asset_name, shares, avg_price, first_acquired, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(user_id, ticker) DO UPDATE SET
                    asset_name = excluded.asset_name,
                    shares = excluded.shares,
                    avg_price = excluded.avg_price,
                    last_updated = excluded.last_updated",
                params![
                    user_id,
                    event.ticker,
                    asset_name,
                    shares,
                    avg_price,
                    first_acquired,
                    ts(now)
                ],
            )?;
        }
        TradeAction::Sell => {
            if let Some((held, avg, _, _)) = existing {
                let remaining = held - event.shares;
                if remaining > f64::EPSILON {
                    tx.execute(
                        "UPDATE portfolio_holdings
                         SET shares = ?3, avg_price = ?4, last_updated = ?5
                         WHERE user_id = ?1 AND ticker = ?2",
                        params![user_id, event.ticker, remaining, avg, ts(now)],
                    )?;
                } else {
                    tx.execute(
                        "DELETE FROM portfolio_holdings WHERE user_id = ?1 AND ticker = ?2",
                        params![user_id, event.ticker],
                    )?;
                }
            }
        }
    }
    Ok(())
}

fn union(mut base: Vec<String>, additions: &[String]) -> Vec<String> {
    for value in additions {
        if !base.iter().any(|existing| existing == value) {
            base.push(value.clone());
        }
    }
    base
}

/// Fresh execution-record id
pub fn execution_id() -> String {
    format!("exe_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intents::{CreateIntentInput, TriggerCondition, TriggerSchedule};
    use tempfile::TempDir;

    fn open_store() -> (TempDir, RelationalStore) {
        let dir = TempDir::new().unwrap();
        let store = RelationalStore::open(&dir.path().join("relational.db")).unwrap();
        (dir, store)
    }

    fn price_intent(user: &str) -> IntentRecord {
        CreateIntentInput {
            user_id: user.into(),
            trigger_type: "price".into(),
            trigger_condition: Some(TriggerCondition {
                expression: Some("NVDA < 130".into()),
                cooldown_hours: Some(24),
                ..Default::default()
            }),
            trigger_schedule: TriggerSchedule::default(),
            ..Default::default()
        }
        .into_record(Utc::now())
        .unwrap()
    }

    #[test]
    fn test_procedural_upsert_and_progression_history() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        let fields = ProceduralFields {
            skill_name: "sourdough baking".into(),
            proficiency_level: ProficiencyLevel::Intermediate,
            practice_count: 4,
            success_rate: Some(0.75),
            difficulty_rating: Some(0.6),
            prerequisites: vec!["basic baking".into()],
        };
        store.upsert_procedural("m1", "u1", &fields, now).unwrap();
        store.upsert_procedural("m1", "u1", &fields, now).unwrap();

        let row = store.get_procedural("m1").unwrap().unwrap();
        assert_eq!(row.fields.skill_name, "sourdough baking");
        assert_eq!(row.fields.prerequisites, vec!["basic baking"]);
        assert!(store.procedural_exists("m1").unwrap());
        assert!(store.delete_procedural("m1").unwrap());
        assert!(!store.procedural_exists("m1").unwrap());
    }

    #[test]
    fn test_identity_merge_unions_lists() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        store
            .upsert_identity(
                "u1",
                &IdentityFields {
                    core_values: vec!["honesty".into()],
                    self_concept: Some("builder".into()),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        store
            .upsert_identity(
                "u1",
                &IdentityFields {
                    core_values: vec!["honesty".into(), "curiosity".into()],
                    ..Default::default()
                },
                now,
            )
            .unwrap();

        let identity = store.get_identity("u1").unwrap().unwrap();
        assert_eq!(identity.core_values, vec!["honesty", "curiosity"]);
        assert_eq!(identity.self_concept.as_deref(), Some("builder"));
    }

    #[test]
    fn test_portfolio_fold_buy_sell() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        let buy = |shares: f64, price: f64| PortfolioEvent {
            ticker: "NVDA".into(),
            asset_name: Some("NVIDIA".into()),
            shares,
            price: Some(price),
            action: TradeAction::Buy,
        };
        store.apply_portfolio_event("u1", &buy(10.0, 100.0), None, now).unwrap();
        store.apply_portfolio_event("u1", &buy(10.0, 120.0), None, now).unwrap();

        let holding = store.get_holding("u1", "NVDA").unwrap().unwrap();
        assert_eq!(holding.shares, 20.0);
        assert!((holding.avg_price - 110.0).abs() < 1e-9);

        store
            .apply_portfolio_event(
                "u1",
                &PortfolioEvent {
                    ticker: "NVDA".into(),
                    asset_name: None,
                    shares: 20.0,
                    price: Some(130.0),
                    action: TradeAction::Sell,
                },
                None,
                now,
            )
            .unwrap();
        assert!(store.get_holding("u1", "NVDA").unwrap().is_none());
        assert_eq!(store.list_transactions("u1", None).unwrap().len(), 3);
    }

    #[test]
    fn test_rebuild_holdings_replays_ledger() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        store
            .apply_portfolio_event(
                "u1",
                &PortfolioEvent {
                    ticker: "AAPL".into(),
                    asset_name: None,
                    shares: 5.0,
                    price: Some(200.0),
                    action: TradeAction::Buy,
                },
                None,
                now,
            )
            .unwrap();
        // Corrupt the view, then rebuild from the ledger
        store.delete_holding("u1", "AAPL").unwrap();
        let positions = store.rebuild_holdings("u1").unwrap();
        assert_eq!(positions, 1);
        assert_eq!(store.get_holding("u1", "AAPL").unwrap().unwrap().shares, 5.0);
    }

    #[test]
    fn test_intent_roundtrip_and_pending() {
        let (_dir, store) = open_store();
        let mut intent = price_intent("u1");
        intent.next_check = Some(Utc::now() - chrono::Duration::minutes(1));
        store.insert_intent(&intent).unwrap();

        let loaded = store.get_intent(&intent.id).unwrap().unwrap();
        assert_eq!(loaded.trigger_type, TriggerType::Price);
        assert_eq!(
            loaded.trigger_condition.as_ref().unwrap().expression.as_deref(),
            Some("NVDA < 130")
        );

        let pending = store.pending_intents(Some("u1"), Utc::now()).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(store.pending_intents(Some("u2"), Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_claim_excludes_recently_claimed() {
        let (_dir, store) = open_store();
        let mut intent = price_intent("u1");
        intent.next_check = Some(Utc::now() - chrono::Duration::minutes(1));
        store.insert_intent(&intent).unwrap();

        let first = store.claim_due_intents(None, 10, 300, Utc::now()).unwrap();
        assert_eq!(first.len(), 1);
        let second = store.claim_due_intents(None, 10, 300, Utc::now()).unwrap();
        assert!(second.is_empty(), "claim must be worker-exclusive within the TTL");

        // Expired claim is reclaimed
        let later = Utc::now() + chrono::Duration::seconds(301);
        let third = store.claim_due_intents(None, 10, 300, later).unwrap();
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn test_maintenance_lock_cas() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        assert!(store.try_acquire_lock("maintenance:u1", 300, now).unwrap());
        assert!(!store.try_acquire_lock("maintenance:u1", 300, now).unwrap());

        // Stale lock is taken over after the TTL
        let later = now + chrono::Duration::seconds(301);
        assert!(store.try_acquire_lock("maintenance:u1", 300, later).unwrap());

        store.release_lock("maintenance:u1").unwrap();
        assert!(store.try_acquire_lock("maintenance:u1", 300, later).unwrap());
    }

    #[test]
    fn test_profile_fields_and_sources() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        store.ensure_profile("u1", now).unwrap();
        store
            .upsert_profile_field("u1", "basics", "occupation", "engineer", 0.8, 1.0, now)
            .unwrap();
        store
            .add_profile_source("u1", "basics", "occupation", "mem_abc", now)
            .unwrap();

        let fields = store.get_profile_fields("u1", Some("basics")).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].value, "engineer");

        let sources = store.list_profile_sources("u1", "basics", "occupation").unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].0, "mem_abc");
    }
}
