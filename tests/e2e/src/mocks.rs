//! Mock collaborators: a scripted language oracle and a deterministic
//! hashed-feature embedder.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use engram_core::{
    CandidateMemory, EmbeddingProvider, ExtractionRequest, LanguageOracle, Result,
    SynthesisRequest, Turn, WorthinessVerdict,
};

/// Scripted oracle: pops one candidate batch per extraction call and counts
/// every invocation so tests can assert "the LLM was never called".
#[derive(Default)]
pub struct MockOracle {
    pub worthiness_calls: AtomicU64,
    pub extract_calls: AtomicU64,
    pub synthesize_calls: AtomicU64,
    scripted: Mutex<VecDeque<Vec<CandidateMemory>>>,
    worthy: Mutex<bool>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            worthy: Mutex::new(true),
            ..Default::default()
        }
    }

    /// Queue one extraction batch
    pub fn script_extraction(&self, candidates: Vec<CandidateMemory>) {
        self.scripted.lock().unwrap().push_back(candidates);
    }

    pub fn set_worthy(&self, worthy: bool) {
        *self.worthy.lock().unwrap() = worthy;
    }

    pub fn total_calls(&self) -> u64 {
        self.worthiness_calls.load(Ordering::SeqCst)
            + self.extract_calls.load(Ordering::SeqCst)
            + self.synthesize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageOracle for MockOracle {
    async fn worthiness(&self, _history: &[Turn]) -> Result<WorthinessVerdict> {
        self.worthiness_calls.fetch_add(1, Ordering::SeqCst);
        Ok(WorthinessVerdict {
            worthy: *self.worthy.lock().unwrap(),
            reason: "scripted".into(),
        })
    }

    async fn extract(&self, _request: &ExtractionRequest) -> Result<Vec<CandidateMemory>> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String> {
        self.synthesize_calls.fetch_add(1, Ordering::SeqCst);
        let cited: Vec<String> = request
            .grounding
            .iter()
            .map(|memory| format!("[{}]", memory.id))
            .collect();
        Ok(format!("synthesized answer citing {}", cited.join(" ")))
    }
}

/// Deterministic hashed-feature embedder. Word-overlapping texts land close
/// together, which is enough to exercise retrieval ordering.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
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

/// Builder shorthand for scripted extraction candidates
pub fn candidate(content: &str, layer: &str, importance: f64) -> CandidateMemory {
    CandidateMemory {
        content: content.to_string(),
        layer: Some(layer.to_string()),
        importance: Some(importance),
        confidence: Some(0.8),
        ..Default::default()
    }
}
