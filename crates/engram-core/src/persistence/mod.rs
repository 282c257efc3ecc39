//! Persistence orchestrator.
//!
//! Given a memory and the write plan derived from its typed fields, fans out
//! writes to exactly the required adapters and returns one outcome entry per
//! attempted adapter. The vector write is required; typed-store writes are
//! best-effort with exponential backoff and are repaired later by the
//! maintenance reconciliation job if they stay failed.

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{EngramError, Result};
use crate::memory::{
    MemoryLayer, MemoryRecord, MemorySource, MemoryType, TypedFields,
};
use crate::stores::{
    EmotionalRow, EpisodicRow, RelationalStore, StoreError, TimeSeriesStore, TimeSeriesTable,
    VectorRow, VectorStore,
};

// ============================================================================
// WRITE PLAN
// ============================================================================

/// A store a single memory write may target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// The vector collection (always written, required)
    Vector,
    /// Time-series episodic hypertable
    Episodic,
    /// Time-series emotional hypertable
    Emotional,
    /// Relational procedural table
    Procedural,
    /// Relational identity row
    Identity,
    /// Relational portfolio ledger + holdings
    Portfolio,
}

impl WriteTarget {
    /// Key used in outcome maps and API `storage` blocks. The vector store
    /// keeps its historical response key.
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteTarget::Vector => "chromadb",
            WriteTarget::Episodic => "episodic",
            WriteTarget::Emotional => "emotional",
            WriteTarget::Procedural => "procedural",
            WriteTarget::Identity => "identity",
            WriteTarget::Portfolio => "portfolio",
        }
    }

    /// Routing-flag metadata key, where one exists
    fn routing_flag(&self) -> Option<&'static str> {
        match self {
            WriteTarget::Episodic => Some("stored_in_episodic"),
            WriteTarget::Emotional => Some("stored_in_emotional"),
            WriteTarget::Procedural => Some("stored_in_procedural"),
            WriteTarget::Identity => Some("stored_in_identity"),
            WriteTarget::Portfolio => Some("stored_in_portfolio"),
            WriteTarget::Vector => None,
        }
    }
}

/// Which typed stores a memory requires, derived from its typed fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WritePlan {
    pub episodic: bool,
    pub emotional: bool,
    pub procedural: bool,
    pub identity: bool,
    pub portfolio: bool,
}

impl WritePlan {
    /// Derive the plan from a record's typed projections
    pub fn for_memory(memory: &MemoryRecord) -> Self {
        Self {
            episodic: memory.typed.episodic.is_some(),
            emotional: memory.typed.emotional.is_some(),
            procedural: memory.typed.procedural.is_some(),
            identity: memory.typed.identity.is_some(),
            portfolio: memory.typed.portfolio.is_some(),
        }
    }

    /// Typed targets this plan requires, in write order
    pub fn targets(&self) -> Vec<WriteTarget> {
        let mut targets = Vec::new();
        if self.episodic {
            targets.push(WriteTarget::Episodic);
        }
        if self.emotional {
            targets.push(WriteTarget::Emotional);
        }
        if self.procedural {
            targets.push(WriteTarget::Procedural);
        }
        if self.identity {
            targets.push(WriteTarget::Identity);
        }
        if self.portfolio {
            targets.push(WriteTarget::Portfolio);
        }
        targets
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// Result of one adapter write attempt (after retries)
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterOutcome {
    #[serde(serialize_with = "serialize_target")]
    pub target: WriteTarget,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub latency_ms: u64,
    pub attempts: u32,
}

fn serialize_target<S: serde::Serializer>(
    target: &WriteTarget,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(target.as_str())
}

/// Aggregate outcome for one persisted memory
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceOutcome {
    pub memory_id: String,
    pub outcomes: Vec<AdapterOutcome>,
}

impl PersistenceOutcome {
    /// Whether the given target was attempted and succeeded
    pub fn ok(&self, target: WriteTarget) -> bool {
        self.outcomes
            .iter()
            .any(|outcome| outcome.target == target && outcome.ok)
    }

    /// Targets that were attempted and failed
    pub fn failed_targets(&self) -> Vec<WriteTarget> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.ok)
            .map(|outcome| outcome.target)
            .collect()
    }

    /// `storage` block for API responses: one boolean per attempted adapter
    pub fn storage_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for outcome in &self.outcomes {
            map.insert(outcome.target.as_str().to_string(), Value::Bool(outcome.ok));
        }
        map
    }
}

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Exponential backoff for best-effort typed writes
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            factor: 2,
            cap: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given retry (attempt numbering starts at 1;
    /// there is no delay before the first attempt)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(2).min(16);
        let delay = self.initial.saturating_mul(self.factor.saturating_pow(exp));
        delay.min(self.cap)
    }
}

// ============================================================================
// METADATA MAPPING
// ============================================================================

/// Build the vector-store metadata map mirroring a record. Nested values are
/// JSON-encoded by the vector adapter.
pub fn record_metadata(memory: &MemoryRecord) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("user_id".into(), Value::String(memory.user_id.clone()));
    map.insert("layer".into(), Value::String(memory.layer.as_str().into()));
    map.insert("type".into(), Value::String(memory.memory_type.as_str().into()));
    map.insert("importance".into(), json_f64(memory.importance));
    map.insert("confidence".into(), json_f64(memory.confidence));
    map.insert("created_at".into(), Value::String(memory.created_at.to_rfc3339()));
    map.insert(
        "last_accessed_at".into(),
        Value::String(memory.last_accessed_at.to_rfc3339()),
    );
    map.insert("access_count".into(), Value::from(memory.access_count));
    map.insert("replay_count".into(), Value::from(memory.replay_count));
    map.insert("source".into(), Value::String(memory.source.as_str().into()));
    map.insert("tags".into(), serde_json::json!(memory.tags));
    map.insert("persona_tags".into(), serde_json::json!(memory.persona_tags));
    if !memory.metadata.is_empty() {
        map.insert("metadata".into(), Value::Object(memory.metadata.clone()));
    }
    if !memory.typed.is_empty() {
        map.insert(
            "typed".into(),
            serde_json::to_value(&memory.typed).unwrap_or(Value::Null),
        );
    }
    map
}

fn json_f64(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Rebuild a memory record from a stored vector row
pub fn record_from_row(row: &VectorRow, embedding: Vec<f32>) -> MemoryRecord {
    let typed: TypedFields = row
        .meta_str("typed")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    let metadata: Map<String, Value> = row
        .meta_str("metadata")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();

    MemoryRecord {
        id: row.id.clone(),
        user_id: row.user_id.clone(),
        content: row.document.clone(),
        embedding,
        layer: row
            .meta_str("layer")
            .and_then(MemoryLayer::parse_name)
            .unwrap_or_default(),
        memory_type: row
            .meta_str("type")
            .and_then(MemoryType::parse_name)
            .unwrap_or_default(),
        importance: row.meta_f64("importance").unwrap_or(0.5),
        confidence: row.meta_f64("confidence").unwrap_or(0.5),
        created_at: row.created_at,
        last_accessed_at: row
            .meta_str("last_accessed_at")
            .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(row.created_at),
        access_count: row.meta_i64("access_count").unwrap_or(0),
        replay_count: row.meta_i64("replay_count").unwrap_or(0),
        tags: row.meta_string_list("tags"),
        persona_tags: row.meta_string_list("persona_tags"),
        source: row
            .meta_str("source")
            .and_then(MemorySource::parse_name)
            .unwrap_or_default(),
        metadata,
        typed,
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Fans out writes for one memory across the backing stores
pub struct PersistenceOrchestrator {
    vector: Arc<VectorStore>,
    timeseries: Arc<TimeSeriesStore>,
    relational: Arc<RelationalStore>,
    retry: RetryPolicy,
}

impl PersistenceOrchestrator {
    pub fn new(
        vector: Arc<VectorStore>,
        timeseries: Arc<TimeSeriesStore>,
        relational: Arc<RelationalStore>,
    ) -> Self {
        Self {
            vector,
            timeseries,
            relational,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy (tests use a zero-delay policy)
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Persist a memory: vector first (required), then best-effort typed
    /// writes, then routing flags back onto the vector metadata.
    pub async fn persist(&self, memory: &MemoryRecord) -> Result<PersistenceOutcome> {
        if memory.embedding.is_empty() {
            return Err(EngramError::Embedding(
                "memory has no embedding attached".into(),
            ));
        }

        let plan = WritePlan::for_memory(memory);
        let mut outcome = PersistenceOutcome {
            memory_id: memory.id.clone(),
            outcomes: Vec::with_capacity(1 + plan.targets().len()),
        };

        // Required vector write. Failure fails the operation and no typed
        // write is attempted, so a memory can never be visible only in the
        // typed stores.
        let started = Instant::now();
        let metadata = record_metadata(memory);
        match self
            .vector
            .upsert(&memory.id, &memory.embedding, &memory.content, &metadata)
        {
            Ok(()) => outcome.outcomes.push(AdapterOutcome {
                target: WriteTarget::Vector,
                ok: true,
                error_kind: None,
                latency_ms: started.elapsed().as_millis() as u64,
                attempts: 1,
            }),
            Err(StoreError::InvalidInput(msg)) => {
                return Err(EngramError::Validation(msg));
            }
            Err(e) => {
                tracing::error!(memory_id = %memory.id, "vector write failed: {e}");
                return Err(EngramError::Storage(format!("vector store write failed: {e}")));
            }
        }

        // Best-effort typed writes, serialized after the vector write.
        let mut flags = Map::new();
        for target in plan.targets() {
            let adapter_outcome = self.write_typed_with_retry(target, memory).await;
            if let Some(flag) = target.routing_flag() {
                flags.insert(flag.into(), Value::Bool(adapter_outcome.ok));
            }
            if !adapter_outcome.ok {
                tracing::warn!(
                    memory_id = %memory.id,
                    adapter = target.as_str(),
                    error_kind = adapter_outcome.error_kind.as_deref().unwrap_or("unknown"),
                    "typed-store write failed after {} attempts; reconciliation will retry",
                    adapter_outcome.attempts
                );
            }
            outcome.outcomes.push(adapter_outcome);
        }

        // Routing flags let deletion target only the stores actually used.
        if !flags.is_empty() {
            if let Err(e) = self.vector.update_metadata(&memory.id, &flags) {
                tracing::warn!(memory_id = %memory.id, "failed to record routing flags: {e}");
            }
        }

        Ok(outcome)
    }

    /// Re-apply the write plan for the given targets (reconciliation)
    pub async fn reapply(
        &self,
        memory: &MemoryRecord,
        targets: &[WriteTarget],
    ) -> Result<PersistenceOutcome> {
        let mut outcome = PersistenceOutcome {
            memory_id: memory.id.clone(),
            outcomes: Vec::with_capacity(targets.len()),
        };
        let mut flags = Map::new();
        for &target in targets {
            let adapter_outcome = self.write_typed_with_retry(target, memory).await;
            if let Some(flag) = target.routing_flag() {
                flags.insert(flag.into(), Value::Bool(adapter_outcome.ok));
            }
            outcome.outcomes.push(adapter_outcome);
        }
        if !flags.is_empty() {
            let _ = self.vector.update_metadata(&memory.id, &flags);
        }
        Ok(outcome)
    }

    /// Delete a memory from the vector store and, consulting the routing
    /// flags, from the typed stores it actually reached. Typed deletes are
    /// best-effort.
    pub fn remove(&self, row: &VectorRow) -> Result<Map<String, Value>> {
        let mut removed = Map::new();
        let deleted = self.vector.delete(&row.id).map_err(EngramError::from)?;
        removed.insert("chromadb".into(), Value::Bool(deleted));

        if row.meta_bool("stored_in_episodic").unwrap_or(false) {
            let ok = self
                .timeseries
                .delete_for_memory(TimeSeriesTable::Episodic, &row.id)
                .unwrap_or(false);
            removed.insert("episodic".into(), Value::Bool(ok));
        }
        if row.meta_bool("stored_in_emotional").unwrap_or(false) {
            let ok = self
                .timeseries
                .delete_for_memory(TimeSeriesTable::Emotional, &row.id)
                .unwrap_or(false);
            removed.insert("emotional".into(), Value::Bool(ok));
        }
        if row.meta_bool("stored_in_procedural").unwrap_or(false) {
            let ok = self.relational.delete_procedural(&row.id).unwrap_or(false);
            removed.insert("procedural".into(), Value::Bool(ok));
        }
        if let Err(e) = self.relational.delete_relations_for(&row.id) {
            tracing::warn!(memory_id = %row.id, "failed to drop relations: {e}");
        }
        Ok(removed)
    }

    async fn write_typed_with_retry(
        &self,
        target: WriteTarget,
        memory: &MemoryRecord,
    ) -> AdapterOutcome {
        let started = Instant::now();
        let mut attempts = 0;
        let mut last_kind = None;

        while attempts < self.retry.max_attempts {
            attempts += 1;
            let delay = self.retry.delay_before(attempts);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.write_typed_once(target, memory) {
                Ok(()) => {
                    return AdapterOutcome {
                        target,
                        ok: true,
                        error_kind: None,
                        latency_ms: started.elapsed().as_millis() as u64,
                        attempts,
                    };
                }
                Err(e) => {
                    last_kind = Some(e.kind().to_string());
                }
            }
        }

        AdapterOutcome {
            target,
            ok: false,
            error_kind: last_kind,
            latency_ms: started.elapsed().as_millis() as u64,
            attempts,
        }
    }

    fn write_typed_once(
        &self,
        target: WriteTarget,
        memory: &MemoryRecord,
    ) -> std::result::Result<(), StoreError> {
        match target {
            WriteTarget::Vector => Ok(()),
            WriteTarget::Episodic => {
                let fields = memory
                    .typed
                    .episodic
                    .clone()
                    .ok_or_else(|| StoreError::InvalidInput("missing episodic fields".into()))?;
                self.timeseries.insert_episodic(&EpisodicRow {
                    memory_id: memory.id.clone(),
                    user_id: memory.user_id.clone(),
                    fields,
                    created_at: memory.created_at,
                })
            }
            WriteTarget::Emotional => {
                let fields = memory
                    .typed
                    .emotional
                    .clone()
                    .ok_or_else(|| StoreError::InvalidInput("missing emotional fields".into()))?;
                self.timeseries.insert_emotional(&EmotionalRow {
                    memory_id: memory.id.clone(),
                    user_id: memory.user_id.clone(),
                    fields,
                    created_at: memory.created_at,
                })
            }
            WriteTarget::Procedural => {
                let fields = memory
                    .typed
                    .procedural
                    .as_ref()
                    .ok_or_else(|| StoreError::InvalidInput("missing procedural fields".into()))?;
                self.relational
                    .upsert_procedural(&memory.id, &memory.user_id, fields, memory.created_at)
            }
            WriteTarget::Identity => {
                let fields = memory
                    .typed
                    .identity
                    .as_ref()
                    .ok_or_else(|| StoreError::InvalidInput("missing identity fields".into()))?;
                self.relational
                    .upsert_identity(&memory.user_id, fields, memory.created_at)
            }
            WriteTarget::Portfolio => {
                let event = memory
                    .typed
                    .portfolio
                    .as_ref()
                    .ok_or_else(|| StoreError::InvalidInput("missing portfolio event".into()))?;
                self.relational.apply_portfolio_event(
                    &memory.user_id,
                    event,
                    Some(&memory.id),
                    memory.created_at,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        EpisodicFields, MemoryLayer, PortfolioEvent, ProceduralFields, TradeAction,
    };
    use tempfile::TempDir;

    const DIM: usize = 8;

    fn stores() -> (
        TempDir,
        Arc<VectorStore>,
        Arc<TimeSeriesStore>,
        Arc<RelationalStore>,
    ) {
        let dir = TempDir::new().unwrap();
        let vector = Arc::new(VectorStore::open(&dir.path().join("vector.db"), DIM).unwrap());
        let timeseries =
            Arc::new(TimeSeriesStore::open(&dir.path().join("timeseries.db")).unwrap());
        let relational =
            Arc::new(RelationalStore::open(&dir.path().join("relational.db")).unwrap());
        (dir, vector, timeseries, relational)
    }

    fn orchestrator(
        vector: &Arc<VectorStore>,
        timeseries: &Arc<TimeSeriesStore>,
        relational: &Arc<RelationalStore>,
    ) -> PersistenceOrchestrator {
        PersistenceOrchestrator::new(vector.clone(), timeseries.clone(), relational.clone())
            .with_retry(RetryPolicy {
                initial: Duration::ZERO,
                ..Default::default()
            })
    }

    fn memory_with(typed: TypedFields) -> MemoryRecord {
        let mut memory = MemoryRecord::new("u1", "stored something important", MemoryLayer::Episodic);
        memory.embedding = (0..DIM).map(|i| (i as f32 * 0.13).cos()).collect();
        memory.typed = typed;
        memory
    }

    #[tokio::test]
    async fn test_plan_routes_to_required_adapters() {
        let (_dir, vector, timeseries, relational) = stores();
        let orch = orchestrator(&vector, &timeseries, &relational);

        let memory = memory_with(TypedFields {
            episodic: Some(EpisodicFields {
                event_timestamp: Utc::now(),
                event_type: Some("milestone".into()),
                location: None,
                participants: vec![],
                emotional_valence: None,
                emotional_arousal: None,
                importance_score: Some(0.9),
            }),
            procedural: Some(ProceduralFields {
                skill_name: "climbing".into(),
                proficiency_level: Default::default(),
                practice_count: 1,
                success_rate: None,
                difficulty_rating: None,
                prerequisites: vec![],
            }),
            ..Default::default()
        });

        let outcome = orch.persist(&memory).await.unwrap();
        assert!(outcome.ok(WriteTarget::Vector));
        assert!(outcome.ok(WriteTarget::Episodic));
        assert!(outcome.ok(WriteTarget::Procedural));
        assert_eq!(outcome.outcomes.len(), 3);

        // Routing flags recorded on the vector metadata
        let row = vector.get_one(&memory.id).unwrap().unwrap();
        assert_eq!(row.meta_bool("stored_in_episodic"), Some(true));
        assert_eq!(row.meta_bool("stored_in_procedural"), Some(true));
        assert_eq!(row.meta_bool("stored_in_emotional"), None);

        // Typed rows landed
        assert!(timeseries.exists(TimeSeriesTable::Episodic, &memory.id).unwrap());
        assert!(relational.procedural_exists(&memory.id).unwrap());
    }

    #[tokio::test]
    async fn test_persist_is_idempotent_for_portfolio() {
        let (_dir, vector, timeseries, relational) = stores();
        let orch = orchestrator(&vector, &timeseries, &relational);

        let memory = memory_with(TypedFields {
            portfolio: Some(PortfolioEvent {
                ticker: "NVDA".into(),
                asset_name: None,
                shares: 10.0,
                price: Some(120.0),
                action: TradeAction::Buy,
            }),
            ..Default::default()
        });

        orch.persist(&memory).await.unwrap();
        orch.persist(&memory).await.unwrap();

        let holding = relational.get_holding("u1", "NVDA").unwrap().unwrap();
        assert_eq!(holding.shares, 10.0, "double persist must not double-book");
        assert_eq!(relational.list_transactions("u1", None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_embedding_is_an_embedding_error() {
        let (_dir, vector, timeseries, relational) = stores();
        let orch = orchestrator(&vector, &timeseries, &relational);
        let mut memory = memory_with(TypedFields::default());
        memory.embedding.clear();

        let err = orch.persist(&memory).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Embedding);
    }

    #[tokio::test]
    async fn test_remove_consults_routing_flags() {
        let (_dir, vector, timeseries, relational) = stores();
        let orch = orchestrator(&vector, &timeseries, &relational);
        let memory = memory_with(TypedFields {
            episodic: Some(EpisodicFields {
                event_timestamp: Utc::now(),
                event_type: None,
                location: None,
                participants: vec![],
                emotional_valence: None,
                emotional_arousal: None,
                importance_score: None,
            }),
            ..Default::default()
        });
        orch.persist(&memory).await.unwrap();

        let row = vector.get_one(&memory.id).unwrap().unwrap();
        let removed = orch.remove(&row).unwrap();
        assert_eq!(removed.get("chromadb"), Some(&Value::Bool(true)));
        assert_eq!(removed.get("episodic"), Some(&Value::Bool(true)));
        assert!(!removed.contains_key("procedural"));
        assert!(vector.get_one(&memory.id).unwrap().is_none());
        assert!(!timeseries.exists(TimeSeriesTable::Episodic, &memory.id).unwrap());
    }

    #[test]
    fn test_retry_delays_follow_backoff() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_before(1), Duration::ZERO);
        assert_eq!(retry.delay_before(2), Duration::from_millis(100));
        assert_eq!(retry.delay_before(3), Duration::from_millis(200));
        assert_eq!(retry.delay_before(6), Duration::from_millis(1600));
        assert_eq!(retry.delay_before(7), Duration::from_secs(2));
    }

    #[test]
    fn test_record_roundtrip_through_metadata() {
        let memory = memory_with(TypedFields::default());
        let metadata = record_metadata(&memory);

        // Simulate a stored row: the vector adapter canonicalizes nested
        // values to JSON strings.
        let mut canonical = Map::new();
        for (key, value) in &metadata {
            let flattened = match value {
                Value::Object(_) | Value::Array(_) => {
                    Value::String(serde_json::to_string(value).unwrap())
                }
                other => other.clone(),
            };
            canonical.insert(key.clone(), flattened);
        }
        let row = VectorRow {
            id: memory.id.clone(),
            user_id: memory.user_id.clone(),
            document: memory.content.clone(),
            metadata: canonical,
            created_at: memory.created_at,
        };

        let rebuilt = record_from_row(&row, memory.embedding.clone());
        assert_eq!(rebuilt.id, memory.id);
        assert_eq!(rebuilt.layer, memory.layer);
        assert_eq!(rebuilt.importance, memory.importance);
        assert_eq!(rebuilt.access_count, memory.access_count);
    }
}
