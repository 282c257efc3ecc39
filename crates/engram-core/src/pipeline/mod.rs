//! Extraction pipeline.
//!
//! Worthiness filter → context retrieval → LLM extraction → classification →
//! enrichment → persistence. Each stage is cheap to skip: unworthy turns
//! never reach the model, and near-duplicates of existing memories are
//! suppressed before any write.

mod classify;
mod enrich;
mod worthiness;

pub use classify::{classify_batch, classify_candidate, strip_pii, ClassificationOutcome, RejectReason};
pub use enrich::{enrich, extract_tickers, infer_personas, infer_valence};
pub use worthiness::{assess as assess_worthiness, prefilter, WorthinessOutcome};

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::EngramConfig;
use crate::error::{EngramError, Result};
use crate::memory::{ExtractionCounters, MemoryRecord, MemorySource, Turn, TurnRole};
use crate::oracle::{
    cosine_similarity, with_deadline, DigestEntry, EmbeddingProvider, ExtractionRequest,
    LanguageOracle,
};
use crate::persistence::PersistenceOrchestrator;
use crate::retrieval::{RetrievalEngine, RetrievalRequest};
use crate::stores::VectorStore;

/// Cosine similarity at which two candidates are considered duplicates
const DEDUP_SIMILARITY: f32 = 0.95;

/// Digest size handed to the extraction prompt
const DIGEST_LIMIT: usize = 5;

/// Input to one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineInput {
    pub user_id: String,
    pub history: Vec<Turn>,
    pub metadata: Map<String, Value>,
    pub source: MemorySource,
}

/// Output of one pipeline run
#[derive(Debug)]
pub struct PipelineOutcome {
    pub memories: Vec<MemoryRecord>,
    pub counters: ExtractionCounters,
    pub worthiness: WorthinessOutcome,
}

/// The ingestion pipeline
pub struct ExtractionPipeline {
    oracle: Arc<dyn LanguageOracle>,
    embedder: Arc<dyn EmbeddingProvider>,
    retrieval: Arc<RetrievalEngine>,
    persistence: Arc<PersistenceOrchestrator>,
    vector: Arc<VectorStore>,
    config: EngramConfig,
}

impl ExtractionPipeline {
    pub fn new(
        oracle: Arc<dyn LanguageOracle>,
        embedder: Arc<dyn EmbeddingProvider>,
        retrieval: Arc<RetrievalEngine>,
        persistence: Arc<PersistenceOrchestrator>,
        vector: Arc<VectorStore>,
        config: EngramConfig,
    ) -> Self {
        Self {
            oracle,
            embedder,
            retrieval,
            persistence,
            vector,
            config,
        }
    }

    /// Run the full pipeline for one batch of turns
    pub async fn run(&self, input: PipelineInput) -> Result<PipelineOutcome> {
        let mut counters = ExtractionCounters::default();

        // Stage 1: worthiness (heuristics first, oracle only if inconclusive)
        let worthiness = match prefilter(&input.history) {
            Some(outcome) => outcome,
            None => {
                with_deadline(self.config.llm_timeout, "worthiness", async {
                    assess_worthiness(self.oracle.as_ref(), &input.history).await
                })
                .await?
            }
        };
        if !worthiness.worthy {
            tracing::debug!(user_id = %input.user_id, reason = %worthiness.reason, "turns not worth persisting");
            return Ok(PipelineOutcome {
                memories: vec![],
                counters,
                worthiness,
            });
        }

        // Stage 2: context retrieval — existing-memories digest for the
        // extraction prompt
        let digest = self.build_digest(&input).await;
        counters.existing_memories_checked = digest.len() as u64;

        // Stage 3: one extraction call
        let request = ExtractionRequest {
            user_id: input.user_id.clone(),
            history: input.history.clone(),
            digest: digest.clone(),
        };
        let candidates = with_deadline(self.config.llm_timeout, "extraction", async {
            self.oracle.extract(&request).await
        })
        .await?;
        if candidates.is_empty() {
            return Ok(PipelineOutcome {
                memories: vec![],
                counters,
                worthiness,
            });
        }

        // Stage 4: classification
        let now = Utc::now();
        let classified = classify_batch(&input.user_id, &candidates, input.source, now);

        // Stage 5: enrichment + embeddings
        let mut records = Vec::with_capacity(classified.records.len());
        for mut record in classified.records {
            if record.content.chars().count() > self.config.max_content_chars {
                record.content.truncate(
                    record
                        .content
                        .char_indices()
                        .nth(self.config.max_content_chars)
                        .map(|(i, _)| i)
                        .unwrap_or(record.content.len()),
                );
            }
            enrich(&mut record);
            for (key, value) in &input.metadata {
                record.metadata.entry(key.clone()).or_insert(value.clone());
            }
            record.embedding = with_deadline(self.config.llm_timeout, "embedding", async {
                self.embedder.embed(&record.content).await
            })
            .await
            .map_err(|e| match e {
                EngramError::Timeout(msg) => EngramError::Timeout(msg),
                other => EngramError::Embedding(other.to_string()),
            })?;
            records.push(record);
        }

        // Intra-batch tie-break: cosine >= 0.95 with the same layer keeps the
        // higher importance, earlier on ties.
        let records = dedup_batch(records, &mut counters);

        // Digest dedup: suppress near-duplicates of memories already stored
        let records = self.suppress_existing(records, &digest, &mut counters)?;

        // Stage 6: persistence
        let mut persisted = Vec::with_capacity(records.len());
        for record in records {
            let existed = self
                .vector
                .get_one(&record.id)
                .map_err(EngramError::from)?
                .is_some();
            self.persistence.persist(&record).await?;
            if existed {
                counters.updates_made += 1;
            } else {
                counters.memories_created += 1;
            }
            persisted.push(record);
        }

        Ok(PipelineOutcome {
            memories: persisted,
            counters,
            worthiness,
        })
    }

    async fn build_digest(&self, input: &PipelineInput) -> Vec<DigestEntry> {
        let Some(query) = input
            .history
            .iter()
            .rev()
            .find(|turn| turn.role == TurnRole::User)
            .map(|turn| turn.content.clone())
        else {
            return vec![];
        };

        let request = RetrievalRequest {
            user_id: input.user_id.clone(),
            query: Some(query),
            limit: DIGEST_LIMIT,
            ..Default::default()
        };
        match self.retrieval.retrieve(request).await {
            Ok(results) => results
                .results
                .into_iter()
                .map(|scored| DigestEntry {
                    id: scored.memory.id,
                    content: scored.memory.content,
                })
                .collect(),
            Err(e) => {
                // The digest is an optimization; extraction proceeds without it
                tracing::debug!("digest retrieval unavailable: {e}");
                vec![]
            }
        }
    }

    fn suppress_existing(
        &self,
        records: Vec<MemoryRecord>,
        digest: &[DigestEntry],
        counters: &mut ExtractionCounters,
    ) -> Result<Vec<MemoryRecord>> {
        if digest.is_empty() {
            return Ok(records);
        }
        let digest_embeddings: Vec<Vec<f32>> = digest
            .iter()
            .filter_map(|entry| self.vector.get_embedding(&entry.id).ok().flatten())
            .collect();
        if digest_embeddings.is_empty() {
            return Ok(records);
        }

        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            let duplicate = digest_embeddings
                .iter()
                .any(|existing| cosine_similarity(&record.embedding, existing) >= DEDUP_SIMILARITY);
            if duplicate {
                counters.duplicates_avoided += 1;
            } else {
                kept.push(record);
            }
        }
        Ok(kept)
    }
}

/// Intra-batch dedup per the tie-break rule
fn dedup_batch(records: Vec<MemoryRecord>, counters: &mut ExtractionCounters) -> Vec<MemoryRecord> {
    let mut kept: Vec<MemoryRecord> = Vec::with_capacity(records.len());
    for record in records {
        let rival = kept.iter().position(|existing| {
            existing.layer == record.layer
                && cosine_similarity(&existing.embedding, &record.embedding) >= DEDUP_SIMILARITY
        });
        match rival {
            Some(index) => {
                counters.duplicates_avoided += 1;
                // Later candidate wins only with strictly higher importance
                if record.importance > kept[index].importance {
                    kept[index] = record;
                }
            }
            None => kept.push(record),
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLayer;

    fn record_with(importance: f64, layer: MemoryLayer, embedding: Vec<f32>) -> MemoryRecord {
        let mut record = MemoryRecord::new("u1", format!("memory {importance}"), layer);
        record.importance = importance;
        record.embedding = embedding;
        record
    }

    #[test]
    fn test_dedup_keeps_higher_importance() {
        let mut counters = ExtractionCounters::default();
        let shared = vec![1.0f32, 0.0, 0.0];
        let records = vec![
            record_with(0.4, MemoryLayer::Semantic, shared.clone()),
            record_with(0.9, MemoryLayer::Semantic, shared.clone()),
        ];
        let kept = dedup_batch(records, &mut counters);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].importance, 0.9);
        assert_eq!(counters.duplicates_avoided, 1);
    }

    #[test]
    fn test_dedup_tie_keeps_earlier() {
        let mut counters = ExtractionCounters::default();
        let shared = vec![0.0f32, 1.0, 0.0];
        let mut first = record_with(0.5, MemoryLayer::Semantic, shared.clone());
        first.content = "earlier".into();
        let mut second = record_with(0.5, MemoryLayer::Semantic, shared.clone());
        second.content = "later".into();

        let kept = dedup_batch(vec![first, second], &mut counters);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].content, "earlier");
    }

    #[test]
    fn test_dedup_respects_layer_boundary() {
        let mut counters = ExtractionCounters::default();
        let shared = vec![0.0f32, 0.0, 1.0];
        let records = vec![
            record_with(0.5, MemoryLayer::Semantic, shared.clone()),
            record_with(0.5, MemoryLayer::Episodic, shared.clone()),
        ];
        let kept = dedup_batch(records, &mut counters);
        assert_eq!(kept.len(), 2);
        assert_eq!(counters.duplicates_avoided, 0);
    }
}
