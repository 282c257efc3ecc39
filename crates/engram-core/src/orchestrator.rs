//! Streaming orchestrator.
//!
//! Maintains an in-memory, bounded per-conversation buffer. A buffer is
//! flushed to the extraction pipeline when the caller asks for it, when the
//! buffer overflows, or when the conversation goes idle (background sweep).
//! After extraction the orchestrator returns injections: top-K retrieval
//! results for the latest turn that are not suppressed by the
//! per-conversation dedupe cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngramConfig;
use crate::error::{EngramError, Result};
use crate::memory::{ExtractionCounters, MemorySource, Turn, TurnRole};
use crate::pipeline::{ExtractionPipeline, PipelineInput};
use crate::retrieval::{RetrievalEngine, RetrievalRequest};
use crate::stores::CacheStore;

/// Injections returned per message
const INJECTION_LIMIT: usize = 3;

/// One streamed turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OrchestratorMessage {
    pub conversation_id: String,
    pub role: TurnRole,
    pub content: String,
    pub user_id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub flush: bool,
}

/// A memory surfaced back into the live conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Injection {
    pub memory_id: String,
    pub content: String,
    pub score: f64,
}

/// Outcome of one streamed message
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageOutcome {
    pub buffered_turns: usize,
    pub flushed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<ExtractionCounters>,
    pub injections: Vec<Injection>,
}

struct ConversationBuffer {
    user_id: String,
    turns: Vec<Turn>,
    metadata: Map<String, Value>,
    last_activity: DateTime<Utc>,
}

/// The streaming orchestrator
pub struct StreamingOrchestrator {
    // Single-writer: each buffer is only mutated under this lock by the
    // owning conversation's handler
    buffers: tokio::sync::Mutex<HashMap<String, ConversationBuffer>>,
    pipeline: Arc<ExtractionPipeline>,
    retrieval: Arc<RetrievalEngine>,
    cache: Arc<CacheStore>,
    config: EngramConfig,
}

impl StreamingOrchestrator {
    pub fn new(
        pipeline: Arc<ExtractionPipeline>,
        retrieval: Arc<RetrievalEngine>,
        cache: Arc<CacheStore>,
        config: EngramConfig,
    ) -> Self {
        Self {
            buffers: tokio::sync::Mutex::new(HashMap::new()),
            pipeline,
            retrieval,
            cache,
            config,
        }
    }

    /// Handle one streamed turn
    pub async fn on_message(&self, message: OrchestratorMessage) -> Result<MessageOutcome> {
        if message.user_id.trim().is_empty() {
            return Err(EngramError::validation("metadata.user_id is required"));
        }
        if message.content.chars().count() > self.config.max_content_chars {
            return Err(EngramError::Validation(format!(
                "content exceeds {} characters",
                self.config.max_content_chars
            )));
        }

        let now = Utc::now();
        let (should_flush, buffered_turns) = {
            let mut buffers = self.buffers.lock().await;
            let buffer = buffers
                .entry(message.conversation_id.clone())
                .or_insert_with(|| ConversationBuffer {
                    user_id: message.user_id.clone(),
                    turns: Vec::new(),
                    metadata: message.metadata.clone(),
                    last_activity: now,
                });
            buffer.turns.push(Turn {
                role: message.role,
                content: message.content.clone(),
            });
            buffer.last_activity = now;
            let overflow = buffer.turns.len() >= self.config.orchestrator_buffer_limit;
            (message.flush || overflow, buffer.turns.len())
        };

        let mut outcome = MessageOutcome {
            buffered_turns,
            ..Default::default()
        };
        if should_flush {
            outcome.counters = self.flush_conversation(&message.conversation_id).await?;
            outcome.flushed = outcome.counters.is_some();
        }

        // Injections for the latest user-visible turn
        if message.role == TurnRole::User {
            outcome.injections = self
                .injections_for(&message.conversation_id, &message.user_id, &message.content)
                .await;
        }
        Ok(outcome)
    }

    /// Flush one conversation's buffer through the extraction pipeline.
    /// Returns None when there was nothing to flush.
    pub async fn flush_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ExtractionCounters>> {
        let drained = {
            let mut buffers = self.buffers.lock().await;
            buffers.remove(conversation_id)
        };
        let Some(buffer) = drained else {
            return Ok(None);
        };
        if buffer.turns.is_empty() {
            return Ok(None);
        }

        let mut metadata = buffer.metadata;
        metadata.insert(
            "conversation_id".into(),
            Value::String(conversation_id.to_string()),
        );
        let outcome = self
            .pipeline
            .run(PipelineInput {
                user_id: buffer.user_id,
                history: buffer.turns,
                metadata,
                source: MemorySource::Orchestrator,
            })
            .await?;
        Ok(Some(outcome.counters))
    }

    /// Replay a full transcript: buffered and flushed in one call, preserving
    /// turn order.
    pub async fn replay_transcript(
        &self,
        conversation_id: &str,
        user_id: &str,
        turns: Vec<Turn>,
        metadata: Map<String, Value>,
    ) -> Result<ExtractionCounters> {
        if turns.is_empty() {
            return Ok(ExtractionCounters::default());
        }
        let mut metadata = metadata;
        metadata.insert(
            "conversation_id".into(),
            Value::String(conversation_id.to_string()),
        );
        let outcome = self
            .pipeline
            .run(PipelineInput {
                user_id: user_id.to_string(),
                history: turns,
                metadata,
                source: MemorySource::Orchestrator,
            })
            .await?;
        Ok(outcome.counters)
    }

    /// Background sweep: flush buffers idle for at least the configured
    /// duration. Returns the number of conversations flushed.
    pub async fn sweep_idle(&self) -> Result<usize> {
        let idle_cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.orchestrator_idle_flush)
                .unwrap_or_else(|_| chrono::Duration::seconds(2));
        let stale: Vec<String> = {
            let buffers = self.buffers.lock().await;
            buffers
                .iter()
                .filter(|(_, buffer)| buffer.last_activity <= idle_cutoff)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut flushed = 0;
        for conversation_id in stale {
            match self.flush_conversation(&conversation_id).await {
                Ok(Some(_)) => flushed += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(conversation_id = %conversation_id, "idle flush failed: {e}")
                }
            }
        }
        Ok(flushed)
    }

    /// Number of live conversation buffers (operational visibility)
    pub async fn buffered_conversations(&self) -> usize {
        self.buffers.lock().await.len()
    }

    async fn injections_for(
        &self,
        conversation_id: &str,
        user_id: &str,
        latest_turn: &str,
    ) -> Vec<Injection> {
        let request = RetrievalRequest {
            user_id: user_id.to_string(),
            query: Some(latest_turn.to_string()),
            limit: INJECTION_LIMIT * 2,
            ..Default::default()
        };
        let results = match self.retrieval.retrieve(request).await {
            Ok(results) => results,
            Err(e) => {
                tracing::debug!("injection retrieval unavailable: {e}");
                return vec![];
            }
        };

        let mut injections = Vec::with_capacity(INJECTION_LIMIT);
        for scored in results.results {
            if injections.len() >= INJECTION_LIMIT {
                break;
            }
            let dedupe_key = format!("inj:{conversation_id}:{}", scored.memory.id);
            match self.cache.contains(&dedupe_key) {
                Ok(true) => continue,
                Ok(false) => {
                    let _ = self.cache.set_ex(
                        &dedupe_key,
                        "1",
                        self.config.injection_dedupe_ttl,
                    );
                }
                Err(_) => {}
            }
            injections.push(Injection {
                memory_id: scored.memory.id,
                content: scored.memory.content,
                score: scored.final_score,
            });
        }
        injections
    }
}
