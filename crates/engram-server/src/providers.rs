//! Collaborator clients: the LLM oracle and the embedding provider.
//!
//! The production implementations speak OpenAI-compatible HTTP (chat
//! completions and embeddings). Deterministic stubs allow offline boot and
//! smoke tests; select them with `ENGRAM_LLM_PROVIDER=stub`.

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use engram_core::{
    CandidateMemory, EmbeddingProvider, EngramError, ExtractionRequest, LanguageOracle, Result,
    SynthesisRequest, Turn, TurnRole, WorthinessVerdict,
};

use crate::settings::{ProviderKind, ServerSettings};

/// Build the oracle + embedder pair from settings
pub fn build_providers(
    settings: &ServerSettings,
    embedding_dimension: usize,
) -> (Arc<dyn LanguageOracle>, Arc<dyn EmbeddingProvider>) {
    match settings.provider {
        ProviderKind::OpenAi => {
            let oracle = Arc::new(OpenAiOracle::new(settings));
            let embedder = Arc::new(OpenAiEmbedder::new(settings, embedding_dimension));
            (oracle, embedder)
        }
        ProviderKind::Stub => {
            tracing::warn!("running with stub providers; extraction will be inert");
            (
                Arc::new(StubOracle),
                Arc::new(StubEmbedder::new(embedding_dimension)),
            )
        }
    }
}

// ============================================================================
// OPENAI-COMPATIBLE ORACLE
// ============================================================================

/// Chat-completions-backed oracle
pub struct OpenAiOracle {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiOracle {
    pub fn new(settings: &ServerSettings) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(180))
                .build()
                .unwrap_or_default(),
            base_url: settings.llm_base_url.clone(),
            api_key: settings.llm_api_key.clone(),
            model: settings.llm_model.clone(),
        }
    }

    async fn chat(&self, system: &str, user: String) -> Result<String> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
                "temperature": 0.2,
            }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngramError::Dependency(format!("llm request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(EngramError::Dependency(format!(
                "llm returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| EngramError::Dependency(format!("llm response unreadable: {e}")))?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngramError::Dependency("llm response missing content".into()))
    }
}

fn render_history(history: &[Turn]) -> String {
    history
        .iter()
        .map(|turn| {
            let role = match turn.role {
                TurnRole::System => "system",
                TurnRole::User => "user",
                TurnRole::Assistant => "assistant",
                TurnRole::Tool => "tool",
            };
            format!("{role}: {}", turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip a markdown code fence if the model wrapped its JSON in one
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|inner| inner.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[async_trait]
impl LanguageOracle for OpenAiOracle {
    async fn worthiness(&self, history: &[Turn]) -> Result<WorthinessVerdict> {
        let content = self
            .chat(
                "You judge whether a conversation fragment contains information worth \
                 persisting as long-term memory about the user. Respond with JSON: \
                 {\"worthy\": bool, \"reason\": string}.",
                render_history(history),
            )
            .await?;
        serde_json::from_str(strip_fence(&content))
            .map_err(|e| EngramError::Dependency(format!("worthiness response malformed: {e}")))
    }

    async fn extract(&self, request: &ExtractionRequest) -> Result<Vec<CandidateMemory>> {
        let digest = request
            .digest
            .iter()
            .map(|entry| format!("- [{}] {}", entry.id, entry.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Extract new long-term memories about the user from the conversation. \
             Suppress anything that near-duplicates the existing memories listed \
             below; focus on new information. Respond with a JSON array of objects \
             with keys: content, layer (short-term|semantic|long-term|episodic|\
             emotional|procedural), type (explicit|implicit), importance, \
             confidence, tags, personaTags, typedFields.\n\n\
             Existing memories:\n{digest}\n\nConversation:\n{}",
            render_history(&request.history)
        );
        let content = self
            .chat("You extract structured memories from conversations.", prompt)
            .await?;
        serde_json::from_str(strip_fence(&content))
            .map_err(|e| EngramError::Dependency(format!("extraction response malformed: {e}")))
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String> {
        let grounding = request
            .grounding
            .iter()
            .map(|memory| format!("- [{}] {}", memory.id, memory.content))
            .collect::<Vec<_>>()
            .join("\n");
        self.chat(
            "You synthesize grounded answers from the user's memories, citing \
             memory ids in square brackets.",
            format!("{}\n\nMemories:\n{grounding}", request.prompt),
        )
        .await
    }
}

// ============================================================================
// OPENAI-COMPATIBLE EMBEDDER
// ============================================================================

/// Embeddings-endpoint-backed provider
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(settings: &ServerSettings, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: settings.embedding_base_url.clone(),
            api_key: settings.llm_api_key.clone(),
            model: settings.embedding_model.clone(),
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&json!({
                "model": self.model,
                "input": text,
                "dimensions": self.dimension,
            }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngramError::Embedding(format!("embedding request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(EngramError::Embedding(format!(
                "embedding provider returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| EngramError::Embedding(format!("embedding response unreadable: {e}")))?;
        let vector: Vec<f32> = body["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| EngramError::Embedding("embedding response missing vector".into()))?
            .iter()
            .filter_map(Value::as_f64)
            .map(|v| v as f32)
            .collect();
        if vector.len() != self.dimension {
            return Err(EngramError::Embedding(format!(
                "expected {} dimensions, provider returned {}",
                self.dimension,
                vector.len()
            )));
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// STUBS
// ============================================================================

/// Inert oracle: nothing is worthy, nothing is extracted, synthesis stitches
/// the grounding together verbatim.
pub struct StubOracle;

#[async_trait]
impl LanguageOracle for StubOracle {
    async fn worthiness(&self, _history: &[Turn]) -> Result<WorthinessVerdict> {
        Ok(WorthinessVerdict {
            worthy: false,
            reason: "stub oracle".into(),
        })
    }

    async fn extract(&self, _request: &ExtractionRequest) -> Result<Vec<CandidateMemory>> {
        Ok(vec![])
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String> {
        let stitched = request
            .grounding
            .iter()
            .map(|memory| format!("[{}] {}", memory.id, memory.content))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(stitched.chars().take(600).collect())
    }
}

/// Deterministic hashed-feature embedder. Not semantically meaningful, but
/// stable across runs, which is what offline boot and smoke tests need.
pub struct StubEmbedder {
    dimension: usize,
}

impl StubEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if word.is_empty() {
                continue;
            }
            let digest = Sha256::digest(word.as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dimension;
            let sign = if digest[4] % 2 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_embedder_is_deterministic() {
        let embedder = StubEmbedder::new(16);
        let a = embedder.embed("sarah's graduation at stanford").await.unwrap();
        let b = embedder.embed("sarah's graduation at stanford").await.unwrap();
        let c = embedder.embed("portfolio rebalancing").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_strip_fence() {
        assert_eq!(strip_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fence("{\"a\":1}"), "{\"a\":1}");
    }
}
