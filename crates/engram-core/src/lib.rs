//! # Engram Core
//!
//! Persistent long-term memory engine for conversational AI agents:
//!
//! - **Typed memory layers**: short-term, semantic, long-term, episodic,
//!   emotional, procedural
//! - **Ingestion pipeline**: worthiness filter → LLM extraction →
//!   classification → enrichment → persistence
//! - **Persistence orchestrator**: fan-out writes across a vector store, a
//!   time-series store and a relational store with per-adapter outcomes,
//!   idempotency keys and best-effort retry
//! - **Hybrid retrieval**: blended semantic + structured + graph scoring
//!   with persona weighting, partial-result diagnostics and optional cited
//!   synthesis
//! - **Maintenance engine**: consolidation, Ebbinghaus forgetting,
//!   compaction, promotion and cross-store reconciliation
//! - **Scheduled intents**: trigger registry, due-check claiming, cooldown
//!   gating and an immutable execution audit
//!
//! The LLM and the embedding provider are external collaborators reached
//! through the [`oracle::LanguageOracle`] and [`oracle::EmbeddingProvider`]
//! traits; concrete clients live in the server binary.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use engram_core::{DirectStoreInput, EngramConfig, EngramService};
//!
//! let service = EngramService::open(EngramConfig::from_env(), oracle, embedder)?;
//!
//! let response = service
//!     .direct_store(DirectStoreInput {
//!         user_id: "u1".into(),
//!         content: "Attended Sarah's graduation at Stanford".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//! assert_eq!(response.status, "success");
//! ```
//!
//! ## Feature Flags
//!
//! - `vector-search` (default): HNSW vector queries with USearch; without it
//!   queries fall back to an exact cosine scan
//! - `bundled-sqlite` (default): bundle SQLite into the binary

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod error;
pub mod intents;
pub mod maintenance;
pub mod memory;
pub mod oracle;
pub mod orchestrator;
pub mod persistence;
pub mod pipeline;
pub mod projections;
pub mod retrieval;
pub mod service;
pub mod stores;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{EngramConfig, DEFAULT_EMBEDDING_DIMENSION, DEFAULT_SCORE_CUTOFF};
pub use error::{EngramError, ErrorCode, Result};

// Memory types
pub use memory::{
    memory_id, DirectStoreInput, EmotionalFields, EpisodicFields, ExtractionCounters,
    IdentityFields, MemoryLayer, MemoryRecord, MemorySource, MemoryStats, MemoryType,
    PortfolioEvent, ProceduralFields, ProficiencyLevel, TradeAction, Turn, TurnRole, TypedFields,
};

// Collaborator interfaces
pub use oracle::{
    cosine_similarity, CandidateMemory, DigestEntry, EmbeddingProvider, ExtractionRequest,
    GroundingMemory, LanguageOracle, SynthesisRequest, WorthinessVerdict,
};

// Store adapters
pub use stores::{
    CacheStore, EmotionalRow, EpisodicRow, Migration, RelationalStore, SnapshotRow, StoreError,
    StoreHealth, StoreResult, TimeSeriesStore, TimeSeriesTable, VectorFilter, VectorRow,
    VectorStore,
};

// Persistence orchestrator
pub use persistence::{
    record_from_row, record_metadata, AdapterOutcome, PersistenceOrchestrator,
    PersistenceOutcome, RetryPolicy, WritePlan, WriteTarget,
};

// Pipeline
pub use pipeline::{ExtractionPipeline, PipelineInput, PipelineOutcome, WorthinessOutcome};

// Retrieval
pub use retrieval::{
    detect_persona, BranchStatus, FinanceContext, PersonaRegistry, PersonaWeights,
    RetrievalDiagnostics, RetrievalEngine, RetrievalFilters, RetrievalOptions, RetrievalRequest,
    RetrievalResults, ScoredMemory, SortOrder, StructuredResults, SynthesisResult, TimelinePage,
};

// Projectors
pub use projections::{
    Narrative, NarrativeBuilder, NarrativeRequest, PortfolioProjector, PortfolioSummary,
    ProfileCompleteness, ProfileObservation, ProfileProjector, ProfileView, PROFILE_CATEGORIES,
};

// Maintenance engine
pub use maintenance::{
    retention, MaintenanceCounters, MaintenanceEngine, MaintenanceJob, MaintenanceReport,
};

// Scheduled intents
pub use intents::{
    ActionPriority, ActionType, CreateIntentInput, ExecutionRecord, ExecutionStatus, FireMode,
    FireOutcome, FireRequest, IntentEngine, IntentRecord, PendingIntent, TriggerCondition,
    TriggerSchedule, TriggerType, UpdateIntentInput,
};

// Streaming orchestrator
pub use orchestrator::{
    Injection, MessageOutcome, OrchestratorMessage, StreamingOrchestrator,
};

// Service facade
pub use service::{
    DirectStoreResponse, EngramService, ServiceHealth, StoreConversationOutcome,
};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        DirectStoreInput, EmbeddingProvider, EngramConfig, EngramError, EngramService,
        ErrorCode, LanguageOracle, MemoryLayer, MemoryRecord, MemoryType, Result,
        RetrievalRequest, Turn, TurnRole,
    };

    pub use crate::{
        CreateIntentInput, FireOutcome, FireRequest, IntentRecord, MaintenanceJob,
        PersistenceOutcome, RetrievalResults, TriggerType,
    };
}
