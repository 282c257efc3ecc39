//! Memory module - core types and data structures
//!
//! The memory record is the primary unit: user-scoped free text with an
//! embedding, a typed layer, importance/confidence scores, and optional
//! typed projections that route it into the specialized stores.

mod record;
mod typed;

pub use record::{memory_id, DirectStoreInput, MemoryRecord};
pub use typed::{
    EmotionalFields, EpisodicFields, IdentityFields, PortfolioEvent, ProceduralFields,
    ProficiencyLevel, TradeAction, TypedFields,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// MEMORY LAYERS
// ============================================================================

/// Temporal/semantic classification of a memory
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryLayer {
    /// Volatile working memory, candidate for promotion
    ShortTerm,
    /// Stable facts
    #[default]
    Semantic,
    /// Durable summaries
    LongTerm,
    /// Events and experiences
    Episodic,
    /// Emotional states
    Emotional,
    /// Skills and how-to knowledge
    Procedural,
}

impl MemoryLayer {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryLayer::ShortTerm => "short-term",
            MemoryLayer::Semantic => "semantic",
            MemoryLayer::LongTerm => "long-term",
            MemoryLayer::Episodic => "episodic",
            MemoryLayer::Emotional => "emotional",
            MemoryLayer::Procedural => "procedural",
        }
    }

    /// Strict parse; unknown names are rejected by the classification stage
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "short-term" | "short_term" => Some(MemoryLayer::ShortTerm),
            "semantic" => Some(MemoryLayer::Semantic),
            "long-term" | "long_term" => Some(MemoryLayer::LongTerm),
            "episodic" => Some(MemoryLayer::Episodic),
            "emotional" => Some(MemoryLayer::Emotional),
            "procedural" => Some(MemoryLayer::Procedural),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// MEMORY TYPE / SOURCE
// ============================================================================

/// Whether the content was stated by the user or inferred by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// Stated by the user
    Explicit,
    /// Inferred by the model
    #[default]
    Implicit,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Explicit => "explicit",
            MemoryType::Implicit => "implicit",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "explicit" => Some(MemoryType::Explicit),
            "implicit" => Some(MemoryType::Implicit),
            _ => None,
        }
    }
}

/// Which path produced the memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    /// Streaming orchestrator flush
    Orchestrator,
    /// Pre-formatted direct write
    #[default]
    DirectApi,
    /// Full LLM store pipeline
    StorePipeline,
    /// Maintenance-engine mutation
    Maintenance,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySource::Orchestrator => "orchestrator",
            MemorySource::DirectApi => "direct_api",
            MemorySource::StorePipeline => "store_pipeline",
            MemorySource::Maintenance => "maintenance",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "orchestrator" => Some(MemorySource::Orchestrator),
            "direct_api" => Some(MemorySource::DirectApi),
            "store_pipeline" => Some(MemorySource::StorePipeline),
            "maintenance" => Some(MemorySource::Maintenance),
            _ => None,
        }
    }
}

// ============================================================================
// CONVERSATION TURNS
// ============================================================================

/// Role in a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One conversational turn fed to the ingestion pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

// ============================================================================
// COUNTERS & STATS
// ============================================================================

/// Per-call counters aggregated by the extraction pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionCounters {
    pub memories_created: u64,
    pub duplicates_avoided: u64,
    pub updates_made: u64,
    pub existing_memories_checked: u64,
}

impl ExtractionCounters {
    /// Fold another counter set into this one
    pub fn merge(&mut self, other: &ExtractionCounters) {
        self.memories_created += other.memories_created;
        self.duplicates_avoided += other.duplicates_avoided;
        self.updates_made += other.updates_made;
        self.existing_memories_checked += other.existing_memories_checked;
    }
}

/// Per-user memory statistics
#[non_exhaustive]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_memories: i64,
    pub by_layer: std::collections::BTreeMap<String, i64>,
    pub average_importance: f64,
    pub average_confidence: f64,
    pub total_access_count: i64,
    pub oldest_memory: Option<DateTime<Utc>>,
    pub newest_memory: Option<DateTime<Utc>>,
}
