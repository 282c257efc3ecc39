//! Hybrid retrieval engine.
//!
//! Blends semantic, structured, and graph signals into one score:
//! `final = 0.7·semantic + 0.2·structured + 0.1·graph`, with a cutoff below
//! which results are dropped. Optional branches (temporal, graph) degrade to
//! partial results with diagnostics instead of failing the request. Hits
//! increment `access_count` on the way out.

mod graph;
mod persona;

pub use graph::proximity_map;
pub use persona::{
    detect_persona, PersonaRegistry, PersonaSignals, PersonaWeights, PERSONA_DETECTION_THRESHOLD,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngramConfig;
use crate::error::{EngramError, Result};
use crate::memory::{MemoryLayer, MemoryRecord, MemoryType};
use crate::oracle::{
    with_deadline, EmbeddingProvider, GroundingMemory, LanguageOracle, SynthesisRequest,
};
use crate::persistence::record_from_row;
use crate::stores::{
    CacheStore, EpisodicRow, RelationalStore, TimeSeriesStore, VectorFilter, VectorRow,
    VectorStore,
};

/// Signal weights for the blended score
const WEIGHT_SEMANTIC: f64 = 0.7;
const WEIGHT_STRUCTURED: f64 = 0.2;
const WEIGHT_GRAPH: f64 = 0.1;

/// Recency horizon for the persona temporal signal, in days
const RECENCY_HORIZON_DAYS: f64 = 30.0;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

/// Sort order for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Blended score (query path) or newest-first (listing path)
    #[default]
    Relevance,
    Newest,
    Oldest,
}

/// Structured filters; all supplied criteria must match for
/// `structured_match = 1`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetrievalFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<MemoryLayer>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<MemoryType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

impl RetrievalFilters {
    fn is_empty(&self) -> bool {
        self.layer.is_none()
            && self.memory_type.is_none()
            && self.tag.is_none()
            && self.from.is_none()
            && self.to.is_none()
    }

    fn to_vector_filter(&self, user_id: &str) -> VectorFilter {
        VectorFilter {
            user_id: Some(user_id.to_string()),
            layer: self.layer,
            memory_type: self.memory_type,
            tag: self.tag.clone(),
            created_after: self.from,
            created_before: self.to,
        }
    }

    fn matches(&self, row: &VectorRow) -> bool {
        self.to_vector_filter(&row.user_id).matches(row)
    }
}

/// Per-request options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalOptions {
    /// Explicit persona; otherwise detection applies above the threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default)]
    pub synthesize: bool,
    #[serde(default)]
    pub sort: SortOrder,
}

/// One retrieval request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalRequest {
    #[serde(alias = "user_id")]
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub filters: RetrievalFilters,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub options: RetrievalOptions,
}

/// Availability of an optional branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum BranchStatus {
    Ok,
    Unavailable(String),
}

impl BranchStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, BranchStatus::Ok)
    }
}

/// Partial-result diagnostics: which optional branches were skipped and why.
/// Lets clients distinguish "no hits" from "branch skipped".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalDiagnostics {
    pub temporal: BranchStatus,
    pub graph: BranchStatus,
}

impl Default for RetrievalDiagnostics {
    fn default() -> Self {
        Self {
            temporal: BranchStatus::Ok,
            graph: BranchStatus::Ok,
        }
    }
}

impl RetrievalDiagnostics {
    pub fn degraded(&self) -> bool {
        !self.temporal.is_ok() || !self.graph.is_ok()
    }
}

/// One scored result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredMemory {
    pub memory: MemoryRecord,
    pub semantic_score: f64,
    pub structured_match: f64,
    pub graph_proximity: f64,
    pub final_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_factor: Option<f64>,
}

/// Portfolio projection attached to finance-flagged queries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinanceContext {
    pub holdings: Vec<crate::stores::relational::HoldingRow>,
    pub total_cost_basis: f64,
}

/// Synthesis output with cache provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisResult {
    pub text: String,
    pub cached: bool,
    pub memory_ids: Vec<String>,
}

/// Retrieval response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResults {
    pub results: Vec<ScoredMemory>,
    /// Post-cutoff hit count for the semantic branch (pre-pagination)
    pub total: u64,
    pub diagnostics: RetrievalDiagnostics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finance: Option<FinanceContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_persona: Option<String>,
}

/// Category buckets returned by structured retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredResults {
    pub categories: std::collections::BTreeMap<String, Vec<MemoryRecord>>,
    pub total: u64,
    pub diagnostics: RetrievalDiagnostics,
}

/// One page of a pure time-series timeline scan (cursor pagination)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelinePage {
    pub events: Vec<EpisodicRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// ============================================================================
// ENGINE
// ============================================================================

/// The hybrid retrieval engine
pub struct RetrievalEngine {
    vector: Arc<VectorStore>,
    /// Optional: graph edges + portfolio projection. Absence degrades the
    /// graph branch to 0, never fails the request.
    relational: Option<Arc<RelationalStore>>,
    /// Optional: temporal branch
    timeseries: Option<Arc<TimeSeriesStore>>,
    cache: Arc<CacheStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    oracle: Option<Arc<dyn LanguageOracle>>,
    personas: PersonaRegistry,
    config: EngramConfig,
}

impl RetrievalEngine {
    pub fn new(
        vector: Arc<VectorStore>,
        relational: Option<Arc<RelationalStore>>,
        timeseries: Option<Arc<TimeSeriesStore>>,
        cache: Arc<CacheStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        oracle: Option<Arc<dyn LanguageOracle>>,
        config: EngramConfig,
    ) -> Self {
        Self {
            vector,
            relational,
            timeseries,
            cache,
            embedder,
            oracle,
            personas: PersonaRegistry::default(),
            config,
        }
    }

    /// Main entry point
    pub async fn retrieve(&self, request: RetrievalRequest) -> Result<RetrievalResults> {
        if request.user_id.trim().is_empty() {
            return Err(EngramError::validation("user_id is required"));
        }
        let limit = if request.limit == 0 {
            self.config.retrieval_default_limit
        } else {
            request.limit.min(100)
        };

        match request.query.as_deref().map(str::trim) {
            Some(query) if !query.is_empty() => self.scored_retrieve(&request, query, limit).await,
            _ => self.listing_retrieve(&request, limit),
        }
    }

    /// Query-bearing path: semantic candidates, blended scoring, cutoff,
    /// persona weighting, pagination.
    async fn scored_retrieve(
        &self,
        request: &RetrievalRequest,
        query: &str,
        limit: usize,
    ) -> Result<RetrievalResults> {
        let mut diagnostics = RetrievalDiagnostics::default();
        let now = Utc::now();

        let embedding = with_deadline(self.config.llm_timeout, "embedding", async {
            self.embedder.embed(query).await
        })
        .await
        .map_err(|e| match e {
            EngramError::Timeout(msg) => EngramError::Timeout(msg),
            other => EngramError::Embedding(other.to_string()),
        })?;

        // Semantic branch over the user's whole collection; structured
        // filters participate in the score instead of pre-filtering.
        let user_filter = VectorFilter::for_user(&request.user_id);
        let candidate_count = ((request.offset + limit) * 3).max(50);
        let candidates = self
            .vector
            .query(&embedding, &user_filter, candidate_count)
            .map_err(|e| EngramError::Storage(format!("vector query failed: {e}")))?;

        // Temporal branch availability (consulted when a window is supplied)
        if request.filters.from.is_some() || request.filters.to.is_some() {
            match &self.timeseries {
                Some(timeseries) if timeseries.health().ok => {}
                Some(_) => {
                    diagnostics.temporal =
                        BranchStatus::Unavailable("time-series store unreachable".into());
                }
                None => {
                    diagnostics.temporal =
                        BranchStatus::Unavailable("time-series store not configured".into());
                }
            }
        }

        // Graph branch anchored on the top semantic hit
        let graph_scores: HashMap<String, f64> = match (&self.relational, candidates.first()) {
            (Some(relational), Some((anchor, _))) => match proximity_map(relational, &anchor.id) {
                Ok(map) => map,
                Err(e) => {
                    diagnostics.graph = BranchStatus::Unavailable(e.to_string());
                    HashMap::new()
                }
            },
            (None, _) => {
                diagnostics.graph =
                    BranchStatus::Unavailable("graph adapter not configured".into());
                HashMap::new()
            }
            _ => HashMap::new(),
        };

        // Persona selection: explicit, else detected with confidence >= 0.8
        let applied_persona = match &request.options.persona {
            Some(persona) => Some(persona.clone()),
            None => detect_persona(query)
                .filter(|(_, confidence)| *confidence >= PERSONA_DETECTION_THRESHOLD)
                .map(|(persona, _)| persona),
        };
        let persona_weights = applied_persona
            .as_deref()
            .map(|persona| self.personas.weights_for(persona));

        let mut scored: Vec<ScoredMemory> = Vec::with_capacity(candidates.len());
        for (row, similarity) in candidates {
            let semantic_score = similarity.max(0.0) as f64;
            let structured_match = if request.filters.is_empty() || request.filters.matches(&row) {
                1.0
            } else {
                0.0
            };
            let graph_proximity = graph_scores.get(&row.id).copied().unwrap_or(0.0);
            let final_score = WEIGHT_SEMANTIC * semantic_score
                + WEIGHT_STRUCTURED * structured_match
                + WEIGHT_GRAPH * graph_proximity;
            if final_score < self.config.score_cutoff {
                continue;
            }

            let memory = record_from_row(&row, Vec::new());
            let (final_score, persona_factor) = match persona_weights {
                Some(weights) => {
                    let signals = PersonaSignals {
                        semantic: semantic_score,
                        recency: recency_signal(memory.created_at, now),
                        importance: memory.importance,
                        emotional: emotional_signal(&memory),
                    };
                    let factor = weights.factor(&signals);
                    (final_score * factor, Some(factor))
                }
                None => (final_score, None),
            };

            scored.push(ScoredMemory {
                memory,
                semantic_score,
                structured_match,
                graph_proximity,
                final_score,
                persona_factor,
            });
        }

        scored.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let total = scored.len() as u64;
        let page: Vec<ScoredMemory> = scored
            .into_iter()
            .skip(request.offset)
            .take(limit)
            .collect();

        self.bump_access(&page, now);

        let finance = if is_finance_query(query) {
            self.finance_context(&request.user_id)
        } else {
            None
        };

        let synthesis = if request.options.synthesize {
            self.synthesize(&request.user_id, query, &page).await?
        } else {
            None
        };

        Ok(RetrievalResults {
            results: page,
            total,
            diagnostics,
            finance,
            synthesis,
            applied_persona,
        })
    }

    /// No-query path: timestamp-ordered listing, no cutoff
    fn listing_retrieve(
        &self,
        request: &RetrievalRequest,
        limit: usize,
    ) -> Result<RetrievalResults> {
        let oldest_first = request.options.sort == SortOrder::Oldest;
        let filter = request.filters.to_vector_filter(&request.user_id);
        let (rows, total) = self
            .vector
            .scan(&filter, request.offset, limit, oldest_first)
            .map_err(|e| EngramError::Storage(format!("vector scan failed: {e}")))?;

        let now = Utc::now();
        let page: Vec<ScoredMemory> = rows
            .into_iter()
            .map(|row| ScoredMemory {
                memory: record_from_row(&row, Vec::new()),
                semantic_score: 0.0,
                structured_match: 1.0,
                graph_proximity: 0.0,
                final_score: 0.0,
                persona_factor: None,
            })
            .collect();
        self.bump_access(&page, now);

        Ok(RetrievalResults {
            results: page,
            total,
            diagnostics: RetrievalDiagnostics::default(),
            finance: None,
            synthesis: None,
            applied_persona: None,
        })
    }

    /// Structured retrieval: memories grouped into layer buckets
    pub fn structured(
        &self,
        user_id: &str,
        filters: &RetrievalFilters,
        limit_per_bucket: usize,
    ) -> Result<StructuredResults> {
        let filter = filters.to_vector_filter(user_id);
        let (rows, total) = self
            .vector
            .scan(&filter, 0, usize::MAX, false)
            .map_err(|e| EngramError::Storage(format!("vector scan failed: {e}")))?;

        let mut categories: std::collections::BTreeMap<String, Vec<MemoryRecord>> =
            Default::default();
        for row in rows {
            let memory = record_from_row(&row, Vec::new());
            let bucket = categories.entry(memory.layer.as_str().to_string()).or_default();
            if bucket.len() < limit_per_bucket.max(1) {
                bucket.push(memory);
            }
        }
        Ok(StructuredResults {
            categories,
            total,
            diagnostics: RetrievalDiagnostics::default(),
        })
    }

    /// Pure time-series timeline scan with cursor pagination
    pub fn timeline(
        &self,
        user_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<TimelinePage> {
        let timeseries = self.timeseries.as_ref().ok_or_else(|| {
            EngramError::Dependency("time-series store not configured".into())
        })?;
        let page = timeseries
            .range_scan_episodic(user_id, from, to, limit.clamp(1, 500), cursor)
            .map_err(EngramError::from)?;
        Ok(TimelinePage {
            events: page.rows,
            next_cursor: page.next_cursor,
        })
    }

    fn bump_access(&self, page: &[ScoredMemory], now: DateTime<Utc>) {
        for scored in page {
            let mut patch = Map::new();
            patch.insert(
                "access_count".into(),
                Value::from(scored.memory.access_count + 1),
            );
            patch.insert(
                "last_accessed_at".into(),
                Value::String(now.to_rfc3339()),
            );
            if let Err(e) = self.vector.update_metadata(&scored.memory.id, &patch) {
                tracing::debug!(memory_id = %scored.memory.id, "access bump failed: {e}");
            }
        }
    }

    fn finance_context(&self, user_id: &str) -> Option<FinanceContext> {
        let relational = self.relational.as_ref()?;
        let holdings = relational.list_holdings(user_id).ok()?;
        let total_cost_basis = holdings
            .iter()
            .map(|h| h.shares * h.avg_price)
            .sum::<f64>();
        Some(FinanceContext {
            holdings,
            total_cost_basis,
        })
    }

    async fn synthesize(
        &self,
        user_id: &str,
        query: &str,
        page: &[ScoredMemory],
    ) -> Result<Option<SynthesisResult>> {
        if !self.config.synthesis_enabled {
            return Ok(None);
        }
        let Some(oracle) = &self.oracle else {
            return Ok(None);
        };
        if page.is_empty() {
            return Ok(None);
        }

        let memory_ids: Vec<String> = page.iter().map(|s| s.memory.id.clone()).collect();
        let cache_key = synthesis_cache_key(user_id, query, &memory_ids);
        if let Ok(Some(cached)) = self.cache.get(&cache_key) {
            return Ok(Some(SynthesisResult {
                text: cached,
                cached: true,
                memory_ids,
            }));
        }

        let grounding: Vec<GroundingMemory> = page
            .iter()
            .map(|scored| GroundingMemory {
                id: scored.memory.id.clone(),
                content: scored.memory.content.clone(),
            })
            .collect();
        let request = SynthesisRequest {
            prompt: format!(
                "Answer the question using only the memories below. \
                 Cite the id of every memory you draw on.\n\nQuestion: {query}"
            ),
            grounding,
        };
        let text = with_deadline(self.config.llm_timeout, "synthesis", async {
            oracle.synthesize(&request).await
        })
        .await?;

        if let Err(e) = self
            .cache
            .set_ex(&cache_key, &text, self.config.synthesis_cache_ttl)
        {
            tracing::debug!("synthesis cache store failed: {e}");
        }
        Ok(Some(SynthesisResult {
            text,
            cached: false,
            memory_ids,
        }))
    }
}

// ============================================================================
// SIGNAL HELPERS
// ============================================================================

fn recency_signal(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_days = (now - created_at).num_seconds().max(0) as f64 / 86_400.0;
    (1.0 - age_days / RECENCY_HORIZON_DAYS).clamp(0.0, 1.0)
}

fn emotional_signal(memory: &MemoryRecord) -> f64 {
    if let Some(emotional) = &memory.typed.emotional {
        return emotional.intensity.unwrap_or_else(|| emotional.valence.abs());
    }
    if let Some(episodic) = &memory.typed.episodic {
        if let Some(valence) = episodic.emotional_valence {
            return valence.abs();
        }
    }
    0.0
}

/// Cache key for synthesized responses
pub fn synthesis_cache_key(user_id: &str, query: &str, memory_ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    for id in memory_ids {
        hasher.update(id.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("synth:{user_id}:{hex}")
}

const FINANCE_QUERY_KEYWORDS: &[&str] = &[
    "stock", "stocks", "shares", "portfolio", "price", "market", "ticker", "holding",
    "holdings", "dividend", "invest", "invested", "investment",
];

/// Heuristic finance flag: a recognized all-caps ticker or a finance keyword
pub fn is_finance_query(query: &str) -> bool {
    let lower = query.to_lowercase();
    let keyword_hit = FINANCE_QUERY_KEYWORDS.iter().any(|keyword| {
        lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| word == *keyword)
    });
    if keyword_hit {
        return true;
    }
    // $NVDA style, or a bare 2-5 letter all-caps token
    query.split_whitespace().any(|token| {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '$');
        if let Some(stripped) = token.strip_prefix('$') {
            return stripped.len() <= 5 && stripped.chars().all(|c| c.is_ascii_uppercase());
        }
        (2..=5).contains(&token.len()) && token.chars().all(|c| c.is_ascii_uppercase())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_sum_to_one() {
        assert!((WEIGHT_SEMANTIC + WEIGHT_STRUCTURED + WEIGHT_GRAPH - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_recency_signal_decays() {
        let now = Utc::now();
        assert!((recency_signal(now, now) - 1.0).abs() < 1e-6);
        let old = now - chrono::Duration::days(60);
        assert_eq!(recency_signal(old, now), 0.0);
        let mid = now - chrono::Duration::days(15);
        let signal = recency_signal(mid, now);
        assert!(signal > 0.4 && signal < 0.6);
    }

    #[test]
    fn test_finance_query_detection() {
        assert!(is_finance_query("how is my portfolio"));
        assert!(is_finance_query("what did I pay for NVDA"));
        assert!(is_finance_query("$TSLA news"));
        assert!(!is_finance_query("how was sarah's graduation"));
        assert!(!is_finance_query("what did I do yesterday"));
    }

    #[test]
    fn test_synthesis_cache_key_is_stable() {
        let ids = vec!["m1".to_string(), "m2".to_string()];
        let a = synthesis_cache_key("u1", "query", &ids);
        let b = synthesis_cache_key("u1", "query", &ids);
        assert_eq!(a, b);
        assert!(a.starts_with("synth:u1:"));
        assert_ne!(a, synthesis_cache_key("u2", "query", &ids));
        assert_ne!(a, synthesis_cache_key("u1", "other", &ids));
    }

    #[test]
    fn test_branch_status_serializes_with_reason() {
        let status = BranchStatus::Unavailable("store down".into());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "unavailable");
        assert_eq!(json["reason"], "store down");
    }
}
