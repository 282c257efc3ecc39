//! Service facade.
//!
//! Owns the process-wide store handles and engine instances, wires the
//! dependency graph at startup after health checks, and exposes the
//! operations the HTTP surface calls. Ingestion and maintenance share a
//! bounded worker pool; saturation is reported as a 429-equivalent.

use chrono::Utc;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::EngramConfig;
use crate::error::{EngramError, Result};
use crate::intents::{
    CreateIntentInput, ExecutionRecord, FireOutcome, FireRequest, IntentEngine, IntentRecord,
    PendingIntent, UpdateIntentInput,
};
use crate::maintenance::{MaintenanceEngine, MaintenanceJob, MaintenanceReport};
use crate::memory::{
    DirectStoreInput, ExtractionCounters, MemoryRecord, MemoryStats, PortfolioEvent, Turn,
};
use crate::oracle::{EmbeddingProvider, LanguageOracle};
use crate::orchestrator::{MessageOutcome, OrchestratorMessage, StreamingOrchestrator};
use crate::persistence::{record_from_row, PersistenceOrchestrator};
use crate::pipeline::{enrich, ExtractionPipeline, PipelineInput, PipelineOutcome};
use crate::projections::{
    Narrative, NarrativeBuilder, NarrativeRequest, PortfolioProjector, PortfolioSummary,
    ProfileCompleteness, ProfileObservation, ProfileProjector, ProfileView,
};
use crate::retrieval::{
    RetrievalEngine, RetrievalFilters, RetrievalRequest, RetrievalResults, StructuredResults,
    TimelinePage,
};
use crate::stores::{
    CacheStore, RelationalStore, StoreHealth, TimeSeriesStore, VectorFilter, VectorStore,
};

/// Response for a direct store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectStoreResponse {
    pub status: String,
    pub memory_id: String,
    pub message: String,
    pub storage: Map<String, Value>,
}

/// Aggregated health report
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub ok: bool,
    pub stores: BTreeMap<String, StoreHealth>,
}

/// Outcome of a conversation ingestion
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConversationOutcome {
    pub counters: ExtractionCounters,
    pub memory_ids: Vec<String>,
    pub worthy: bool,
    pub worthiness_reason: String,
}

/// The service facade
pub struct EngramService {
    config: EngramConfig,
    vector: Arc<VectorStore>,
    relational: Arc<RelationalStore>,
    timeseries: Arc<TimeSeriesStore>,
    cache: Arc<CacheStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    persistence: Arc<PersistenceOrchestrator>,
    retrieval: Arc<RetrievalEngine>,
    pipeline: Arc<ExtractionPipeline>,
    orchestrator: StreamingOrchestrator,
    maintenance: MaintenanceEngine,
    intents: IntentEngine,
    profile: ProfileProjector,
    portfolio: PortfolioProjector,
    narrative: NarrativeBuilder,
    worker_pool: Arc<Semaphore>,
}

impl EngramService {
    /// Open the stores under the configured data directory and wire the
    /// engine graph. Called at startup, after which the handles are
    /// process-wide.
    pub fn open(
        config: EngramConfig,
        oracle: Arc<dyn LanguageOracle>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let data_dir = resolve_data_dir(&config)?;
        let dimension = embedder.dimension();
        if dimension != config.embedding_dimension {
            tracing::warn!(
                configured = config.embedding_dimension,
                provider = dimension,
                "embedding dimension mismatch; using the provider's dimension"
            );
        }

        let vector = Arc::new(
            VectorStore::open(&data_dir.join("vector.db"), dimension)
                .map_err(EngramError::from)?,
        );
        let relational = Arc::new(
            RelationalStore::open(&data_dir.join("relational.db")).map_err(EngramError::from)?,
        );
        let timeseries = Arc::new(
            TimeSeriesStore::open(&data_dir.join("timeseries.db")).map_err(EngramError::from)?,
        );
        let cache = Arc::new(CacheStore::default());

        let persistence = Arc::new(PersistenceOrchestrator::new(
            vector.clone(),
            timeseries.clone(),
            relational.clone(),
        ));
        let retrieval = Arc::new(RetrievalEngine::new(
            vector.clone(),
            Some(relational.clone()),
            Some(timeseries.clone()),
            cache.clone(),
            embedder.clone(),
            Some(oracle.clone()),
            config.clone(),
        ));
        let pipeline = Arc::new(ExtractionPipeline::new(
            oracle.clone(),
            embedder.clone(),
            retrieval.clone(),
            persistence.clone(),
            vector.clone(),
            config.clone(),
        ));
        let orchestrator = StreamingOrchestrator::new(
            pipeline.clone(),
            retrieval.clone(),
            cache.clone(),
            config.clone(),
        );
        let maintenance = MaintenanceEngine::new(
            vector.clone(),
            relational.clone(),
            timeseries.clone(),
            persistence.clone(),
            embedder.clone(),
            Some(oracle.clone()),
            config.clone(),
        );
        let intents = IntentEngine::new(relational.clone(), config.clone());
        let profile = ProfileProjector::new(relational.clone());
        let portfolio = PortfolioProjector::new(relational.clone(), timeseries.clone());
        let narrative = NarrativeBuilder::new(retrieval.clone(), Some(oracle), config.clone());
        let worker_pool = Arc::new(Semaphore::new(config.worker_pool_size));

        Ok(Self {
            config,
            vector,
            relational,
            timeseries,
            cache,
            embedder,
            persistence,
            retrieval,
            pipeline,
            orchestrator,
            maintenance,
            intents,
            profile,
            portfolio,
            narrative,
            worker_pool,
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &EngramConfig {
        &self.config
    }

    fn acquire_worker(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        self.worker_pool
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngramError::Saturated)
    }

    // ========================================================================
    // MEMORY OPERATIONS
    // ========================================================================

    /// `POST /v1/memories/direct` — pre-formatted write, no LLM involved
    pub async fn direct_store(&self, input: DirectStoreInput) -> Result<DirectStoreResponse> {
        input.validate(&self.config)?;
        let mut record = input.into_record(Utc::now());
        enrich(&mut record);
        record.embedding =
            crate::oracle::with_deadline(self.config.llm_timeout, "embedding", async {
                self.embedder.embed(&record.content).await
            })
            .await
            .map_err(|e| match e {
                EngramError::Timeout(msg) => EngramError::Timeout(msg),
                other => EngramError::Embedding(other.to_string()),
            })?;

        let outcome = self.persistence.persist(&record).await?;
        self.ingest_profile_observations(&record)?;

        Ok(DirectStoreResponse {
            status: "success".into(),
            memory_id: record.id,
            message: "memory stored".into(),
            storage: outcome.storage_map(),
        })
    }

    /// `GET /v1/memories/{id}` — owner-scoped fetch
    pub fn get_memory(&self, id: &str, user_id: &str) -> Result<MemoryRecord> {
        let row = self
            .vector
            .get_one(id)
            .map_err(EngramError::from)?
            .ok_or_else(|| EngramError::NotFound(format!("memory {id}")))?;
        if row.user_id != user_id {
            return Err(EngramError::Consent(
                "user_id does not match the memory owner".into(),
            ));
        }
        Ok(record_from_row(&row, Vec::new()))
    }

    /// `DELETE /v1/memories/{id}` — authorization enforced against stored
    /// metadata, then vector row plus typed rows per the routing flags.
    pub fn delete_memory(&self, id: &str, user_id: &str) -> Result<Map<String, Value>> {
        let row = self
            .vector
            .get_one(id)
            .map_err(EngramError::from)?
            .ok_or_else(|| EngramError::NotFound(format!("memory {id}")))?;
        if row.user_id != user_id {
            return Err(EngramError::Consent(
                "user_id does not match the memory owner".into(),
            ));
        }
        self.persistence.remove(&row)
    }

    /// `POST /v1/store` — full LLM pipeline over a conversation
    pub async fn store_conversation(
        &self,
        user_id: &str,
        history: Vec<Turn>,
        metadata: Map<String, Value>,
    ) -> Result<StoreConversationOutcome> {
        let _permit = self.acquire_worker()?;
        let outcome = self
            .pipeline
            .run(PipelineInput {
                user_id: user_id.to_string(),
                history,
                metadata,
                source: crate::memory::MemorySource::StorePipeline,
            })
            .await?;
        self.finish_pipeline_outcome(outcome)
    }

    fn finish_pipeline_outcome(&self, outcome: PipelineOutcome) -> Result<StoreConversationOutcome> {
        for record in &outcome.memories {
            self.ingest_profile_observations(record)?;
        }
        Ok(StoreConversationOutcome {
            counters: outcome.counters,
            memory_ids: outcome.memories.iter().map(|m| m.id.clone()).collect(),
            worthy: outcome.worthiness.worthy,
            worthiness_reason: outcome.worthiness.reason,
        })
    }

    /// Profile observations can ride along in memory metadata (a `profile`
    /// object or array); fold them into the projection.
    fn ingest_profile_observations(&self, record: &MemoryRecord) -> Result<()> {
        let Some(value) = record.metadata.get("profile") else {
            return Ok(());
        };
        let observations: Vec<ProfileObservation> = match value {
            Value::Array(_) => serde_json::from_value(value.clone()).unwrap_or_default(),
            Value::Object(_) => serde_json::from_value::<ProfileObservation>(value.clone())
                .map(|obs| vec![obs])
                .unwrap_or_default(),
            _ => vec![],
        };
        let now = Utc::now();
        for mut observation in observations {
            observation.memory_id.get_or_insert(record.id.clone());
            if let Err(e) = self.profile.apply_observation(&record.user_id, &observation, now) {
                tracing::debug!("profile observation skipped: {e}");
            }
        }
        Ok(())
    }

    // ========================================================================
    // RETRIEVAL
    // ========================================================================

    pub async fn retrieve(&self, request: RetrievalRequest) -> Result<RetrievalResults> {
        self.retrieval.retrieve(request).await
    }

    pub fn retrieve_structured(
        &self,
        user_id: &str,
        filters: &RetrievalFilters,
        limit_per_bucket: usize,
    ) -> Result<StructuredResults> {
        self.retrieval.structured(user_id, filters, limit_per_bucket)
    }

    pub fn timeline(
        &self,
        user_id: &str,
        from: Option<chrono::DateTime<Utc>>,
        to: Option<chrono::DateTime<Utc>>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<TimelinePage> {
        self.retrieval.timeline(user_id, from, to, limit, cursor)
    }

    pub async fn narrative(&self, request: NarrativeRequest) -> Result<Narrative> {
        self.narrative.build(request).await
    }

    // ========================================================================
    // ORCHESTRATOR
    // ========================================================================

    pub async fn orchestrator_message(
        &self,
        message: OrchestratorMessage,
    ) -> Result<MessageOutcome> {
        self.orchestrator.on_message(message).await
    }

    pub async fn orchestrator_transcript(
        &self,
        conversation_id: &str,
        user_id: &str,
        turns: Vec<Turn>,
        metadata: Map<String, Value>,
    ) -> Result<ExtractionCounters> {
        let _permit = self.acquire_worker()?;
        self.orchestrator
            .replay_transcript(conversation_id, user_id, turns, metadata)
            .await
    }

    /// Background sweep of idle conversation buffers
    pub async fn sweep_idle_conversations(&self) -> Result<usize> {
        self.orchestrator.sweep_idle().await
    }

    pub async fn buffered_conversations(&self) -> usize {
        self.orchestrator.buffered_conversations().await
    }

    // ========================================================================
    // PROFILE
    // ========================================================================

    pub fn profile_view(&self, user_id: &str, category: Option<&str>) -> Result<ProfileView> {
        self.profile.view(user_id, category)
    }

    pub fn profile_set_field(
        &self,
        user_id: &str,
        category: &str,
        field: &str,
        value: &str,
    ) -> Result<()> {
        self.profile
            .set_field(user_id, category, field, value, Utc::now())
    }

    pub fn profile_completeness(&self, user_id: &str) -> Result<ProfileCompleteness> {
        self.profile.completeness(user_id)
    }

    // ========================================================================
    // PORTFOLIO
    // ========================================================================

    pub fn portfolio_summary(&self, user_id: &str) -> Result<PortfolioSummary> {
        self.portfolio.summary(user_id)
    }

    pub fn portfolio_apply(&self, user_id: &str, event: &PortfolioEvent) -> Result<()> {
        self.portfolio.apply_event(user_id, event, None, Utc::now())
    }

    pub fn portfolio_set_position(
        &self,
        user_id: &str,
        ticker: &str,
        shares: f64,
        price: Option<f64>,
        asset_name: Option<String>,
    ) -> Result<()> {
        self.portfolio
            .set_position(user_id, ticker, shares, price, asset_name, Utc::now())
    }

    pub fn portfolio_remove(&self, user_id: &str, ticker: &str) -> Result<bool> {
        self.portfolio.remove_holding(user_id, ticker, Utc::now())
    }

    pub fn portfolio_snapshot(&self, user_id: &str) -> Result<crate::stores::SnapshotRow> {
        self.portfolio.snapshot(user_id, Utc::now())
    }

    pub fn portfolio_transactions(
        &self,
        user_id: &str,
        ticker: Option<&str>,
    ) -> Result<Vec<crate::stores::relational::TransactionRow>> {
        self.portfolio.transactions(user_id, ticker)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    pub async fn run_maintenance(
        &self,
        user_id: &str,
        jobs: &[MaintenanceJob],
    ) -> Result<MaintenanceReport> {
        let _permit = self.acquire_worker()?;
        self.maintenance.run(user_id, jobs).await
    }

    pub async fn compact(&self, user_id: &str) -> Result<MaintenanceReport> {
        let _permit = self.acquire_worker()?;
        self.maintenance
            .run(user_id, &[MaintenanceJob::Compaction])
            .await
    }

    pub async fn compact_all(&self) -> Result<Vec<MaintenanceReport>> {
        let _permit = self.acquire_worker()?;
        self.maintenance.compact_all().await
    }

    pub fn maintenance_force_unlock(&self, user_id: &str) -> Result<()> {
        self.maintenance.force_unlock(user_id)
    }

    // ========================================================================
    // SCHEDULED INTENTS
    // ========================================================================

    fn require_proactivity(&self) -> Result<()> {
        if !self.config.proactivity_enabled {
            return Err(EngramError::Consent(
                "proactivity is disabled for this deployment".into(),
            ));
        }
        Ok(())
    }

    pub fn intent_create(&self, input: CreateIntentInput) -> Result<IntentRecord> {
        self.intents.create(input, Utc::now())
    }

    pub fn intent_get(&self, id: &str) -> Result<IntentRecord> {
        self.intents.get(id)
    }

    pub fn intent_list(
        &self,
        user_id: Option<&str>,
        include_disabled: bool,
    ) -> Result<Vec<IntentRecord>> {
        self.intents.list(user_id, include_disabled)
    }

    pub fn intent_update(&self, id: &str, patch: UpdateIntentInput) -> Result<IntentRecord> {
        self.intents.update(id, patch, Utc::now())
    }

    pub fn intent_delete(&self, id: &str) -> Result<bool> {
        self.intents.delete(id)
    }

    pub fn intent_pending(&self, user_id: Option<&str>) -> Result<Vec<PendingIntent>> {
        self.require_proactivity()?;
        self.intents.pending(user_id, Utc::now())
    }

    pub fn intent_claim(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<IntentRecord>> {
        self.require_proactivity()?;
        self.intents.claim(user_id, limit, Utc::now())
    }

    pub fn intent_fire(&self, id: &str, request: FireRequest) -> Result<FireOutcome> {
        self.require_proactivity()?;
        self.intents.fire(id, request, Utc::now())
    }

    pub fn intent_executions(&self, intent_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        self.intents.executions(intent_id, limit)
    }

    // ========================================================================
    // STATS & HEALTH
    // ========================================================================

    /// Per-user memory statistics
    pub fn stats(&self, user_id: &str) -> Result<MemoryStats> {
        let (rows, total) = self
            .vector
            .scan(&VectorFilter::for_user(user_id), 0, usize::MAX, false)
            .map_err(EngramError::from)?;

        let mut stats = MemoryStats {
            total_memories: total as i64,
            ..Default::default()
        };
        let mut importance_sum = 0.0;
        let mut confidence_sum = 0.0;
        for row in &rows {
            let record = record_from_row(row, Vec::new());
            *stats
                .by_layer
                .entry(record.layer.as_str().to_string())
                .or_default() += 1;
            importance_sum += record.importance;
            confidence_sum += record.confidence;
            stats.total_access_count += record.access_count;
            stats.oldest_memory = Some(
                stats
                    .oldest_memory
                    .map_or(record.created_at, |oldest| oldest.min(record.created_at)),
            );
            stats.newest_memory = Some(
                stats
                    .newest_memory
                    .map_or(record.created_at, |newest| newest.max(record.created_at)),
            );
        }
        if !rows.is_empty() {
            stats.average_importance = importance_sum / rows.len() as f64;
            stats.average_confidence = confidence_sum / rows.len() as f64;
        }
        Ok(stats)
    }

    /// Users with at least one memory (drives the maintenance scheduler)
    pub fn known_users(&self) -> Result<Vec<String>> {
        Ok(self.vector.list_users().map_err(EngramError::from)?)
    }

    /// Most recent maintenance run for a user, if any
    pub fn maintenance_last_run(
        &self,
        user_id: &str,
    ) -> Result<Option<chrono::DateTime<Utc>>> {
        Ok(self.relational.last_maintenance_run(user_id)?)
    }

    /// Per-store health with latency (`/health/full` and the startup gate)
    pub fn health_full(&self) -> ServiceHealth {
        let mut stores = BTreeMap::new();
        stores.insert("vector".to_string(), self.vector.health());
        stores.insert("relational".to_string(), self.relational.health());
        stores.insert("timeseries".to_string(), self.timeseries.health());
        stores.insert("cache".to_string(), self.cache.health());
        ServiceHealth {
            ok: stores.values().all(|health| health.ok),
            stores,
        }
    }
}

fn resolve_data_dir(config: &EngramConfig) -> Result<PathBuf> {
    if let Some(dir) = &config.data_dir {
        return Ok(dir.clone());
    }
    let dirs = ProjectDirs::from("ai", "engram", "engram")
        .ok_or_else(|| EngramError::internal("could not determine a data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}
