//! External collaborator interfaces.
//!
//! The LLM and the embedding provider are consumed only through these traits;
//! concrete clients live in the server binary and test mocks live in the e2e
//! harness. All calls are suspending and run under the configured deadlines.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::memory::Turn;

// ============================================================================
// EXCHANGE TYPES
// ============================================================================

/// Boolean judgement that a set of turns is worth persisting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorthinessVerdict {
    pub worthy: bool,
    pub reason: String,
}

/// A digest entry describing an already-persisted memory, given to the
/// extraction prompt so the model can suppress near-duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestEntry {
    pub id: String,
    pub content: String,
}

/// Request for one extraction call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRequest {
    pub user_id: String,
    pub history: Vec<Turn>,
    /// Existing-memories digest (most similar first)
    pub digest: Vec<DigestEntry>,
}

/// Semi-structured candidate returned by the model.
///
/// The classification stage is the canonical boundary that converts this into
/// a typed [`crate::memory::MemoryRecord`]; unknown fields are preserved in
/// `extra` and end up in the record metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateMemory {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub persona_tags: Vec<String>,
    /// Type-specific fields, still untyped at this point
    #[serde(default)]
    pub typed_fields: Map<String, Value>,
    /// Anything else the model attached
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One grounding memory handed to the synthesizer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMemory {
    pub id: String,
    pub content: String,
}

/// Request for one synthesis call; the model is instructed to cite memory ids
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisRequest {
    pub prompt: String,
    pub grounding: Vec<GroundingMemory>,
}

// ============================================================================
// TRAITS
// ============================================================================

/// The large language model, treated as an oracle
#[async_trait]
pub trait LanguageOracle: Send + Sync {
    /// Judge whether the turns contain information worth persisting
    async fn worthiness(&self, history: &[Turn]) -> Result<WorthinessVerdict>;

    /// Extract zero or more candidate memories from the history + digest
    async fn extract(&self, request: &ExtractionRequest) -> Result<Vec<CandidateMemory>>;

    /// Produce grounded prose citing the supplied memory ids
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String>;
}

/// The embedding provider: `embed(text) -> vector`
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Dimension of the vectors this provider produces
    fn dimension(&self) -> usize;
}

// ============================================================================
// DEADLINES
// ============================================================================

/// Run a collaborator call under a deadline, mapping expiry into the
/// `TIMEOUT` taxonomy entry. Work already persisted stays persisted; this
/// only abandons the in-flight call.
pub async fn with_deadline<T, F>(
    deadline: std::time::Duration,
    what: &str,
    future: F,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(crate::error::EngramError::Timeout(format!(
            "{what} exceeded {}ms deadline",
            deadline.as_millis()
        ))),
    }
}

// ============================================================================
// VECTOR MATH
// ============================================================================

/// Cosine similarity between two vectors; 0.0 when either norm vanishes
/// or the dimensions disagree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = [1.0, 0.0, 0.0];
        let b = [1.0, 0.0, 0.0];
        let c = [0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_candidate_preserves_unknown_fields() {
        let json = r#"{"content":"likes hiking","layer":"semantic","novelty":0.8}"#;
        let candidate: CandidateMemory = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.content, "likes hiking");
        assert_eq!(candidate.extra.get("novelty"), Some(&serde_json::json!(0.8)));
    }
}
