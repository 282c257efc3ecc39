//! Maintenance engine.
//!
//! Scheduled jobs over a user's memories: consolidation, Ebbinghaus-curve
//! forgetting, compaction/dedup, promotion, and cross-store reconciliation.
//! Every job is idempotent: running twice back-to-back leaves the same
//! persisted state. Jobs run under an exclusive per-user compare-and-set
//! lock with a five-minute TTL.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::EngramConfig;
use crate::error::{EngramError, Result};
use crate::memory::{MemoryLayer, MemoryRecord, MemorySource};
use crate::oracle::{
    cosine_similarity, with_deadline, EmbeddingProvider, GroundingMemory, LanguageOracle,
    SynthesisRequest,
};
use crate::persistence::{record_metadata, PersistenceOrchestrator, WriteTarget};
use crate::stores::{RelationalStore, TimeSeriesStore, TimeSeriesTable, VectorFilter, VectorStore};

/// Retention below which a memory decays
const RETENTION_THRESHOLD: f64 = 0.2;

/// Cosine similarity at which two same-layer memories are merged
const COMPACTION_SIMILARITY: f32 = 0.95;

/// Importance at which consolidation replays a memory
const REPLAY_IMPORTANCE: f64 = 0.7;

/// Short-term promotion thresholds
const PROMOTION_ACCESS_COUNT: i64 = 3;
const PROMOTION_AGE_HOURS: i64 = 24;

/// Episodic facts become promotion candidates above this bar
const STABLE_EPISODIC_ACCESS: i64 = 2;
const STABLE_EPISODIC_IMPORTANCE: f64 = 0.6;

// ============================================================================
// JOBS & REPORTS
// ============================================================================

/// Maintenance job types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceJob {
    Consolidation,
    Forgetting,
    Compaction,
    Promotion,
    Reconciliation,
}

impl MaintenanceJob {
    /// The default full sweep, in execution order
    pub fn all() -> Vec<MaintenanceJob> {
        vec![
            MaintenanceJob::Consolidation,
            MaintenanceJob::Promotion,
            MaintenanceJob::Forgetting,
            MaintenanceJob::Compaction,
            MaintenanceJob::Reconciliation,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceJob::Consolidation => "consolidation",
            MaintenanceJob::Forgetting => "forgetting",
            MaintenanceJob::Compaction => "compaction",
            MaintenanceJob::Promotion => "promotion",
            MaintenanceJob::Reconciliation => "reconciliation",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "consolidation" => Some(MaintenanceJob::Consolidation),
            "forgetting" => Some(MaintenanceJob::Forgetting),
            "compaction" | "compact" | "dedup" => Some(MaintenanceJob::Compaction),
            "promotion" => Some(MaintenanceJob::Promotion),
            "reconciliation" => Some(MaintenanceJob::Reconciliation),
            _ => None,
        }
    }
}

/// Counters accumulated across a run
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceCounters {
    pub replayed: i64,
    pub promoted: i64,
    pub archived: i64,
    pub decayed: i64,
    pub merged: i64,
    pub repaired: i64,
}

/// Report for one maintenance run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub user_id: String,
    pub jobs: Vec<String>,
    pub counters: MaintenanceCounters,
    pub memories_processed: usize,
    pub duration_ms: i64,
}

// ============================================================================
// RETENTION CURVE
// ============================================================================

/// Ebbinghaus-style retention:
/// `R = exp(-t / (sigma * 10)) * sqrt(1 + r)`
/// where `t` is days since last access, `sigma` is significance in (0, 1],
/// and `r` is the replay count.
pub fn retention(days_since_access: f64, significance: f64, replay_count: i64) -> f64 {
    let sigma = significance.clamp(0.01, 1.0);
    (-days_since_access / (sigma * 10.0)).exp() * (1.0 + replay_count as f64).sqrt()
}

// ============================================================================
// ENGINE
// ============================================================================

/// The maintenance engine
pub struct MaintenanceEngine {
    vector: Arc<VectorStore>,
    relational: Arc<RelationalStore>,
    timeseries: Arc<TimeSeriesStore>,
    persistence: Arc<PersistenceOrchestrator>,
    embedder: Arc<dyn EmbeddingProvider>,
    oracle: Option<Arc<dyn LanguageOracle>>,
    config: EngramConfig,
}

impl MaintenanceEngine {
    pub fn new(
        vector: Arc<VectorStore>,
        relational: Arc<RelationalStore>,
        timeseries: Arc<TimeSeriesStore>,
        persistence: Arc<PersistenceOrchestrator>,
        embedder: Arc<dyn EmbeddingProvider>,
        oracle: Option<Arc<dyn LanguageOracle>>,
        config: EngramConfig,
    ) -> Self {
        Self {
            vector,
            relational,
            timeseries,
            persistence,
            embedder,
            oracle,
            config,
        }
    }

    /// Run jobs for one user under the exclusive per-user lock
    pub async fn run(&self, user_id: &str, jobs: &[MaintenanceJob]) -> Result<MaintenanceReport> {
        let now = Utc::now();
        let lock_name = format!("maintenance:{user_id}");
        let ttl = self.config.maintenance_lock_ttl.as_secs() as i64;
        if !self.relational.try_acquire_lock(&lock_name, ttl, now)? {
            return Err(EngramError::Dependency(format!(
                "maintenance already running for {user_id}"
            )));
        }

        let started = std::time::Instant::now();
        let result = self.run_locked(user_id, jobs, now).await;
        if let Err(e) = self.relational.release_lock(&lock_name) {
            tracing::warn!("failed to release maintenance lock: {e}");
        }

        let (counters, processed, success) = match &result {
            Ok((counters, processed)) => (*counters, *processed, true),
            Err(_) => (MaintenanceCounters::default(), 0, false),
        };
        let duration_ms = started.elapsed().as_millis() as i64;
        let job_names: Vec<String> = jobs.iter().map(|j| j.as_str().to_string()).collect();
        if let Err(e) = self.relational.insert_maintenance_history(
            user_id,
            now,
            duration_ms,
            &job_names,
            [
                counters.replayed,
                counters.promoted,
                counters.archived,
                counters.decayed,
                counters.merged,
                counters.repaired,
            ],
            success,
        ) {
            tracing::warn!("failed to record maintenance history: {e}");
        }

        let (counters, processed) = result?;
        Ok(MaintenanceReport {
            user_id: user_id.to_string(),
            jobs: job_names,
            counters,
            memories_processed: processed,
            duration_ms,
        })
    }

    /// Break a stale per-user lock
    pub fn force_unlock(&self, user_id: &str) -> Result<()> {
        self.relational
            .force_unlock(&format!("maintenance:{user_id}"))?;
        Ok(())
    }

    /// Compaction across every known user (each user takes its own lock)
    pub async fn compact_all(&self) -> Result<Vec<MaintenanceReport>> {
        let users = self.vector.list_users().map_err(EngramError::from)?;
        let mut reports = Vec::with_capacity(users.len());
        for user_id in users {
            match self.run(&user_id, &[MaintenanceJob::Compaction]).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(user_id = %user_id, "compaction skipped: {e}"),
            }
        }
        Ok(reports)
    }

    async fn run_locked(
        &self,
        user_id: &str,
        jobs: &[MaintenanceJob],
        now: DateTime<Utc>,
    ) -> Result<(MaintenanceCounters, usize)> {
        let mut counters = MaintenanceCounters::default();
        let records = self.load_user_records(user_id)?;
        let processed = records.len();

        for job in jobs {
            // Reload between jobs so each one observes the previous job's writes
            let records = self.load_user_records(user_id)?;
            match job {
                MaintenanceJob::Consolidation => {
                    self.consolidate(user_id, &records, &mut counters, now).await?
                }
                MaintenanceJob::Promotion => self.promote(&records, &mut counters, now)?,
                MaintenanceJob::Forgetting => {
                    self.forget(&records, &mut counters, now).await?
                }
                MaintenanceJob::Compaction => self.compact(&records, &mut counters)?,
                MaintenanceJob::Reconciliation => {
                    self.reconcile(&records, &mut counters).await?
                }
            }
        }
        Ok((counters, processed))
    }

    fn load_user_records(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        let (rows, _) = self
            .vector
            .scan(&VectorFilter::for_user(user_id), 0, usize::MAX, false)
            .map_err(EngramError::from)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let embedding = self
                .vector
                .get_embedding(&row.id)
                .map_err(EngramError::from)?
                .unwrap_or_default();
            records.push(crate::persistence::record_from_row(&row, embedding));
        }
        Ok(records)
    }

    // ========================================================================
    // CONSOLIDATION
    // ========================================================================

    /// Replay high-significance memories and promote stable episodic facts
    /// into semantic rows linked by `source_episodes`.
    async fn consolidate(
        &self,
        user_id: &str,
        records: &[MemoryRecord],
        counters: &mut MaintenanceCounters,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let today = now.format("%Y-%m-%d").to_string();

        // Replay pass: at most once per day per memory to stay idempotent
        for record in records {
            if record.importance < REPLAY_IMPORTANCE {
                continue;
            }
            let replayed_today = record
                .metadata
                .get("last_replayed_at")
                .and_then(Value::as_str)
                == Some(today.as_str());
            if replayed_today {
                continue;
            }
            let mut patch = Map::new();
            patch.insert("replay_count".into(), Value::from(record.replay_count + 1));
            merge_record_metadata(
                &mut patch,
                record,
                &[("last_replayed_at", Value::String(today.clone()))],
            );
            self.vector
                .update_metadata(&record.id, &patch)
                .map_err(EngramError::from)?;
            counters.replayed += 1;
        }

        // Pattern pass: stable episodic facts grouped by dominant tag
        let mut groups: std::collections::BTreeMap<String, Vec<&MemoryRecord>> = Default::default();
        for record in records {
            if record.layer != MemoryLayer::Episodic {
                continue;
            }
            if record.access_count < STABLE_EPISODIC_ACCESS
                || record.importance < STABLE_EPISODIC_IMPORTANCE
            {
                continue;
            }
            if now - record.created_at < Duration::hours(PROMOTION_AGE_HOURS) {
                continue;
            }
            if record.metadata.contains_key("consolidated_into") {
                continue;
            }
            let Some(tag) = record.tags.first().cloned() else {
                continue;
            };
            groups.entry(tag).or_default().push(record);
        }

        for (tag, group) in groups {
            if group.len() < 2 {
                continue;
            }
            let mut source_ids: Vec<String> = group.iter().map(|m| m.id.clone()).collect();
            source_ids.sort();

            let essence = self
                .summarize(
                    &format!("Summarize the recurring pattern across these '{tag}' events."),
                    &group,
                )
                .await;
            let mut semantic = MemoryRecord::new(user_id, essence, MemoryLayer::Semantic);
            // Time-independent id so re-running converges on the same row
            semantic.id = derived_id(user_id, "consolidation", &source_ids);
            semantic.importance = group
                .iter()
                .map(|m| m.importance)
                .fold(0.0f64, f64::max);
            semantic.source = MemorySource::Maintenance;
            semantic.tags = vec![tag];
            semantic
                .metadata
                .insert("source_episodes".into(), serde_json::json!(source_ids));
            semantic.embedding = self.embed(&semantic.content).await?;
            self.persistence.persist(&semantic).await?;

            for record in group {
                let mut patch = Map::new();
                merge_record_metadata(
                    &mut patch,
                    record,
                    &[("consolidated_into", Value::String(semantic.id.clone()))],
                );
                self.vector
                    .update_metadata(&record.id, &patch)
                    .map_err(EngramError::from)?;
            }
            counters.promoted += 1;
        }
        Ok(())
    }

    // ========================================================================
    // FORGETTING
    // ========================================================================

    /// Ebbinghaus decay: low-retention episodic memories are summarized into
    /// a semantic essence and archived in place; low-retention semantic
    /// memories have their confidence multiplied by the retention value.
    /// Identity memories and portfolio holdings never decay.
    async fn forget(
        &self,
        records: &[MemoryRecord],
        counters: &mut MaintenanceCounters,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let today = now.format("%Y-%m-%d").to_string();
        for record in records {
            if record.decay_exempt() {
                continue;
            }
            let r = retention(
                record.days_since_access(now),
                record.importance,
                record.replay_count,
            );
            if r >= RETENTION_THRESHOLD {
                continue;
            }

            match record.layer {
                MemoryLayer::Episodic => {
                    let essence = self
                        .summarize("Distill the lasting fact from this memory.", &[record])
                        .await;
                    let mut archived = record.clone();
                    archived.layer = MemoryLayer::Semantic;
                    archived.metadata.insert(
                        "archived_from_layer".into(),
                        Value::String("episodic".into()),
                    );
                    archived.metadata.insert(
                        "archived_content".into(),
                        Value::String(record.content.clone()),
                    );
                    archived.content = essence;
                    // The rewrite counts as an access; keeps the job idempotent
                    archived.last_accessed_at = now;
                    archived.source = MemorySource::Maintenance;
                    archived.embedding = self.embed(&archived.content).await?;

                    let metadata = record_metadata(&archived);
                    self.vector
                        .upsert(&archived.id, &archived.embedding, &archived.content, &metadata)
                        .map_err(EngramError::from)?;
                    counters.archived += 1;
                }
                MemoryLayer::Semantic => {
                    let decayed_today = record
                        .metadata
                        .get("last_decay_at")
                        .and_then(Value::as_str)
                        == Some(today.as_str());
                    if decayed_today {
                        continue;
                    }
                    let mut patch = Map::new();
                    patch.insert(
                        "confidence".into(),
                        serde_json::Number::from_f64(record.confidence * r)
                            .map(Value::Number)
                            .unwrap_or(Value::Null),
                    );
                    merge_record_metadata(
                        &mut patch,
                        record,
                        &[("last_decay_at", Value::String(today.clone()))],
                    );
                    self.vector
                        .update_metadata(&record.id, &patch)
                        .map_err(EngramError::from)?;
                    counters.decayed += 1;
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ========================================================================
    // COMPACTION
    // ========================================================================

    /// Merge near-duplicate pairs (same layer, cosine >= 0.95) into the
    /// higher-importance memory, accumulating access counts.
    fn compact(
        &self,
        records: &[MemoryRecord],
        counters: &mut MaintenanceCounters,
    ) -> Result<()> {
        let mut removed: std::collections::HashSet<String> = Default::default();
        for (i, a) in records.iter().enumerate() {
            if removed.contains(&a.id) || a.embedding.is_empty() {
                continue;
            }
            for b in records.iter().skip(i + 1) {
                if removed.contains(&b.id) || b.embedding.is_empty() {
                    continue;
                }
                if a.layer != b.layer || a.id == b.id {
                    continue;
                }
                if cosine_similarity(&a.embedding, &b.embedding) < COMPACTION_SIMILARITY {
                    continue;
                }

                let (winner, loser) = if b.importance > a.importance {
                    (b, a)
                } else {
                    (a, b)
                };
                let mut patch = Map::new();
                patch.insert(
                    "access_count".into(),
                    Value::from(winner.access_count + loser.access_count),
                );
                self.vector
                    .update_metadata(&winner.id, &patch)
                    .map_err(EngramError::from)?;

                if let Some(loser_row) =
                    self.vector.get_one(&loser.id).map_err(EngramError::from)?
                {
                    self.persistence.remove(&loser_row)?;
                }
                removed.insert(loser.id.clone());
                counters.merged += 1;

                if removed.contains(&a.id) {
                    break;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // PROMOTION
    // ========================================================================

    /// Short-term memories accessed enough and old enough become semantic
    fn promote(
        &self,
        records: &[MemoryRecord],
        counters: &mut MaintenanceCounters,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for record in records {
            if record.layer != MemoryLayer::ShortTerm {
                continue;
            }
            if record.access_count < PROMOTION_ACCESS_COUNT {
                continue;
            }
            if now - record.created_at < Duration::hours(PROMOTION_AGE_HOURS) {
                continue;
            }
            let mut patch = Map::new();
            patch.insert(
                "layer".into(),
                Value::String(MemoryLayer::Semantic.as_str().into()),
            );
            self.vector
                .update_metadata(&record.id, &patch)
                .map_err(EngramError::from)?;
            counters.promoted += 1;
        }
        Ok(())
    }

    // ========================================================================
    // RECONCILIATION
    // ========================================================================

    /// Repair typed-store rows that went missing: for each memory whose
    /// routing flag is set but whose typed row is absent, re-apply that part
    /// of the write plan.
    async fn reconcile(
        &self,
        records: &[MemoryRecord],
        counters: &mut MaintenanceCounters,
    ) -> Result<()> {
        for record in records {
            let row = match self.vector.get_one(&record.id).map_err(EngramError::from)? {
                Some(row) => row,
                None => continue,
            };
            let mut missing = Vec::new();
            if row.meta_bool("stored_in_episodic").unwrap_or(false)
                && !self
                    .timeseries
                    .exists(TimeSeriesTable::Episodic, &record.id)
                    .unwrap_or(true)
            {
                missing.push(WriteTarget::Episodic);
            }
            if row.meta_bool("stored_in_emotional").unwrap_or(false)
                && !self
                    .timeseries
                    .exists(TimeSeriesTable::Emotional, &record.id)
                    .unwrap_or(true)
            {
                missing.push(WriteTarget::Emotional);
            }
            if row.meta_bool("stored_in_procedural").unwrap_or(false)
                && !self.relational.procedural_exists(&record.id).unwrap_or(true)
            {
                missing.push(WriteTarget::Procedural);
            }
            if missing.is_empty() {
                continue;
            }
            let outcome = self.persistence.reapply(record, &missing).await?;
            counters.repaired += outcome
                .outcomes
                .iter()
                .filter(|adapter| adapter.ok)
                .count() as i64;
        }
        Ok(())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn embed(&self, content: &str) -> Result<Vec<f32>> {
        with_deadline(self.config.llm_timeout, "embedding", async {
            self.embedder.embed(content).await
        })
        .await
        .map_err(|e| match e {
            EngramError::Timeout(msg) => EngramError::Timeout(msg),
            other => EngramError::Embedding(other.to_string()),
        })
    }

    /// Oracle-backed summary with a deterministic fallback when no oracle is
    /// configured (or it fails): first sentences of the joined content.
    async fn summarize(&self, instruction: &str, group: &[&MemoryRecord]) -> String {
        if let Some(oracle) = &self.oracle {
            let request = SynthesisRequest {
                prompt: instruction.to_string(),
                grounding: group
                    .iter()
                    .map(|memory| GroundingMemory {
                        id: memory.id.clone(),
                        content: memory.content.clone(),
                    })
                    .collect(),
            };
            let attempt = with_deadline(self.config.llm_timeout, "consolidation summary", async {
                oracle.synthesize(&request).await
            })
            .await;
            match attempt {
                Ok(text) if !text.trim().is_empty() => return text,
                Ok(_) => {}
                Err(e) => tracing::debug!("summary synthesis unavailable: {e}"),
            }
        }
        let joined = group
            .iter()
            .map(|memory| memory.content.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        joined.chars().take(240).collect()
    }
}

/// Markers like `last_replayed_at` belong to the record's open metadata map,
/// which lives under the single `metadata` key of the vector row. This folds
/// marker entries into that nested map inside an update patch.
fn merge_record_metadata(
    patch: &mut Map<String, Value>,
    record: &MemoryRecord,
    entries: &[(&str, Value)],
) {
    let mut metadata = record.metadata.clone();
    for (key, value) in entries {
        metadata.insert((*key).to_string(), value.clone());
    }
    patch.insert("metadata".into(), Value::Object(metadata));
}

/// Deterministic, time-independent derived-memory id
fn derived_id(user_id: &str, purpose: &str, source_ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(purpose.as_bytes());
    for id in source_ids {
        hasher.update([0x1f]);
        hasher.update(id.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("mem_{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_matches_curve() {
        // significance 0.5, untouched 7 days: exp(-7/5) ~ 0.247, still held
        let week = retention(7.0, 0.5, 0);
        assert!((week - 0.2466).abs() < 0.01);
        assert!(week > RETENTION_THRESHOLD);

        // at 10 days: exp(-2) ~ 0.135, below threshold
        let ten_days = retention(10.0, 0.5, 0);
        assert!((ten_days - 0.1353).abs() < 0.01);
        assert!(ten_days < RETENTION_THRESHOLD);
    }

    #[test]
    fn test_replay_slows_forgetting() {
        let plain = retention(10.0, 0.5, 0);
        let replayed = retention(10.0, 0.5, 3);
        assert!(replayed > plain);
        assert!((replayed / plain - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_retention_clamps_significance() {
        // Zero significance must not divide by zero
        let r = retention(1.0, 0.0, 0);
        assert!(r.is_finite());
        assert!(r < 0.01);
    }

    #[test]
    fn test_derived_id_is_order_independent_after_sort() {
        let a = derived_id("u1", "consolidation", &["m1".into(), "m2".into()]);
        let b = derived_id("u1", "consolidation", &["m1".into(), "m2".into()]);
        assert_eq!(a, b);
        let c = derived_id("u1", "consolidation", &["m1".into(), "m3".into()]);
        assert_ne!(a, c);
        assert!(a.starts_with("mem_"));
    }

    #[test]
    fn test_job_parse_names() {
        assert_eq!(
            MaintenanceJob::parse_name("compact"),
            Some(MaintenanceJob::Compaction)
        );
        assert_eq!(MaintenanceJob::parse_name("nonsense"), None);
        assert_eq!(MaintenanceJob::all().len(), 5);
    }
}
