//! Journey: maintenance engine — forgetting curve (scenario S4), promotion,
//! compaction, reconciliation, and idempotency of the full sweep.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use engram_core::{
    EmbeddingProvider, EngramConfig, EpisodicFields, MaintenanceEngine, MaintenanceJob,
    MemoryLayer, MemoryRecord, PersistenceOrchestrator, RelationalStore, TimeSeriesStore,
    TimeSeriesTable, TypedFields, VectorStore,
};
use engram_e2e_tests::mocks::{HashEmbedder, MockOracle};

const DIM: usize = 32;

struct Stack {
    vector: Arc<VectorStore>,
    relational: Arc<RelationalStore>,
    timeseries: Arc<TimeSeriesStore>,
    persistence: Arc<PersistenceOrchestrator>,
    maintenance: MaintenanceEngine,
    embedder: Arc<HashEmbedder>,
    _dir: TempDir,
}

fn stack() -> Stack {
    let dir = TempDir::new().unwrap();
    let vector = Arc::new(VectorStore::open(&dir.path().join("vector.db"), DIM).unwrap());
    let relational = Arc::new(RelationalStore::open(&dir.path().join("relational.db")).unwrap());
    let timeseries = Arc::new(TimeSeriesStore::open(&dir.path().join("timeseries.db")).unwrap());
    let persistence = Arc::new(PersistenceOrchestrator::new(
        vector.clone(),
        timeseries.clone(),
        relational.clone(),
    ));
    let embedder = Arc::new(HashEmbedder::new(DIM));
    let maintenance = MaintenanceEngine::new(
        vector.clone(),
        relational.clone(),
        timeseries.clone(),
        persistence.clone(),
        embedder.clone(),
        Some(Arc::new(MockOracle::new())),
        EngramConfig::default(),
    );
    Stack {
        vector,
        relational,
        timeseries,
        persistence,
        maintenance,
        embedder,
        _dir: dir,
    }
}

async fn persist_memory(
    stack: &Stack,
    content: &str,
    layer: MemoryLayer,
    importance: f64,
    days_since_access: i64,
    access_count: i64,
) -> MemoryRecord {
    let mut memory = MemoryRecord::new("u1", content, layer);
    memory.importance = importance;
    memory.created_at = Utc::now() - Duration::days(days_since_access);
    memory.last_accessed_at = Utc::now() - Duration::days(days_since_access);
    memory.access_count = access_count;
    memory.embedding = stack.embedder.embed(content).await.unwrap();
    stack.persistence.persist(&memory).await.unwrap();
    memory
}

#[tokio::test]
async fn forgetting_follows_the_retention_curve() {
    let stack = stack();

    // significance 0.5, untouched 7 days: retention ~0.247 — survives
    let week_old = persist_memory(&stack, "debugged the flaky pipeline", MemoryLayer::Episodic, 0.5, 7, 0).await;
    // significance 0.5, untouched 10 days: retention ~0.135 — archived
    let ten_days_old =
        persist_memory(&stack, "missed the train to portland", MemoryLayer::Episodic, 0.5, 10, 0).await;

    let report = stack
        .maintenance
        .run("u1", &[MaintenanceJob::Forgetting])
        .await
        .unwrap();
    assert_eq!(report.counters.archived, 1);

    // The week-old memory still reads as episodic
    let survivor = stack.vector.get_one(&week_old.id).unwrap().unwrap();
    assert_eq!(survivor.meta_str("layer"), Some("episodic"));

    // The stale one became a semantic essence with its original preserved
    let archived = stack.vector.get_one(&ten_days_old.id).unwrap().unwrap();
    assert_eq!(archived.meta_str("layer"), Some("semantic"));
    let metadata_blob = archived.meta_str("metadata").unwrap_or("{}").to_string();
    assert!(metadata_blob.contains("archived_from_layer"));
    assert!(metadata_blob.contains("missed the train"));
}

#[tokio::test]
async fn identity_tagged_memories_never_decay() {
    let stack = stack();
    let mut memory = MemoryRecord::new("u1", "I deeply value honesty", MemoryLayer::Episodic);
    memory.importance = 0.3;
    memory.persona_tags.push("identity".into());
    memory.last_accessed_at = Utc::now() - Duration::days(120);
    memory.created_at = Utc::now() - Duration::days(120);
    memory.embedding = stack.embedder.embed(&memory.content).await.unwrap();
    stack.persistence.persist(&memory).await.unwrap();

    stack
        .maintenance
        .run("u1", &[MaintenanceJob::Forgetting])
        .await
        .unwrap();

    let row = stack.vector.get_one(&memory.id).unwrap().unwrap();
    assert_eq!(row.meta_str("layer"), Some("episodic"));
}

#[tokio::test]
async fn promotion_requires_access_and_age() {
    let stack = stack();
    let eligible =
        persist_memory(&stack, "keeps keys in the blue bowl", MemoryLayer::ShortTerm, 0.5, 2, 3).await;
    let too_fresh =
        persist_memory(&stack, "parked on level four today", MemoryLayer::ShortTerm, 0.5, 0, 5).await;
    let too_cold =
        persist_memory(&stack, "mentioned a podcast once", MemoryLayer::ShortTerm, 0.5, 3, 1).await;

    stack
        .maintenance
        .run("u1", &[MaintenanceJob::Promotion])
        .await
        .unwrap();

    let promoted = stack.vector.get_one(&eligible.id).unwrap().unwrap();
    assert_eq!(promoted.meta_str("layer"), Some("semantic"));
    for id in [&too_fresh.id, &too_cold.id] {
        let row = stack.vector.get_one(id).unwrap().unwrap();
        assert_eq!(row.meta_str("layer"), Some("short-term"));
    }
}

#[tokio::test]
async fn compaction_merges_near_duplicates() {
    let stack = stack();
    // Identical wording hashes to identical embeddings: cosine 1.0
    let low =
        persist_memory(&stack, "allergic to shellfish", MemoryLayer::Semantic, 0.4, 1, 2).await;
    let high =
        persist_memory(&stack, "allergic to shellfish", MemoryLayer::Semantic, 0.9, 1, 3).await;
    // Same content in the same hour folds to the same deterministic id
    assert_eq!(low.id, high.id, "sanity: identical content shares an id");

    // Identical embedding but a different layer: must survive compaction
    let mut other_layer =
        MemoryRecord::new("u1", "shellfish allergy noted at dinner", MemoryLayer::Episodic);
    other_layer.importance = 0.5;
    other_layer.embedding = stack.embedder.embed("allergic to shellfish").await.unwrap();
    stack.persistence.persist(&other_layer).await.unwrap();
    let mut distinct = MemoryRecord::new("u1", "allergic to shellfish and prawns", MemoryLayer::Semantic);
    distinct.importance = 0.2;
    distinct.access_count = 4;
    distinct.embedding = stack.embedder.embed("allergic to shellfish").await.unwrap();
    stack.persistence.persist(&distinct).await.unwrap();

    let report = stack
        .maintenance
        .run("u1", &[MaintenanceJob::Compaction])
        .await
        .unwrap();
    assert_eq!(report.counters.merged, 1);

    // The higher-importance record absorbed the duplicate's access count
    let winner = stack.vector.get_one(&high.id).unwrap().unwrap();
    assert_eq!(winner.meta_i64("access_count"), Some(3 + 4));
    assert!(stack.vector.get_one(&distinct.id).unwrap().is_none());
    assert!(stack.vector.get_one(&other_layer.id).unwrap().is_some());
}

#[tokio::test]
async fn reconciliation_restores_missing_typed_rows() {
    let stack = stack();
    let mut memory = MemoryRecord::new("u1", "watched the eclipse from the roof", MemoryLayer::Episodic);
    memory.typed = TypedFields {
        episodic: Some(EpisodicFields {
            event_timestamp: Utc::now(),
            event_type: Some("event".into()),
            location: Some("roof".into()),
            participants: vec![],
            emotional_valence: None,
            emotional_arousal: None,
            importance_score: Some(0.7),
        }),
        ..Default::default()
    };
    memory.embedding = stack.embedder.embed(&memory.content).await.unwrap();
    stack.persistence.persist(&memory).await.unwrap();
    assert!(stack
        .timeseries
        .exists(TimeSeriesTable::Episodic, &memory.id)
        .unwrap());

    // Simulate the divergence the reconciliation job exists for
    stack
        .timeseries
        .delete_for_memory(TimeSeriesTable::Episodic, &memory.id)
        .unwrap();

    let report = stack
        .maintenance
        .run("u1", &[MaintenanceJob::Reconciliation])
        .await
        .unwrap();
    assert_eq!(report.counters.repaired, 1);
    assert!(stack
        .timeseries
        .exists(TimeSeriesTable::Episodic, &memory.id)
        .unwrap());
}

#[tokio::test]
async fn full_sweep_is_idempotent() {
    let stack = stack();
    persist_memory(&stack, "missed the train to portland", MemoryLayer::Episodic, 0.5, 10, 0).await;
    persist_memory(&stack, "keeps keys in the blue bowl", MemoryLayer::ShortTerm, 0.5, 2, 3).await;
    persist_memory(&stack, "high focus on the rewrite", MemoryLayer::Semantic, 0.9, 0, 1).await;

    let first = stack.maintenance.run("u1", &MaintenanceJob::all()).await.unwrap();
    let second = stack.maintenance.run("u1", &MaintenanceJob::all()).await.unwrap();

    // The second back-to-back run finds nothing left to mutate
    assert_eq!(second.counters.archived, 0);
    assert_eq!(second.counters.promoted, 0);
    assert_eq!(second.counters.merged, 0);
    assert_eq!(second.counters.decayed, 0);
    assert_eq!(second.counters.replayed, 0);
    assert!(first.counters.archived + first.counters.promoted > 0);
}

#[tokio::test]
async fn concurrent_runs_for_one_user_are_excluded() {
    let stack = stack();
    // Hold the user's lock, as a concurrent job would
    assert!(stack
        .relational
        .try_acquire_lock("maintenance:u1", 300, Utc::now())
        .unwrap());

    let err = stack
        .maintenance
        .run("u1", &[MaintenanceJob::Compaction])
        .await
        .unwrap_err();
    assert_eq!(err.code(), engram_core::ErrorCode::DependencyUnavailable);

    // Force-unlock recovers a stale lock
    stack.maintenance.force_unlock("u1").unwrap();
    assert!(stack
        .maintenance
        .run("u1", &[MaintenanceJob::Compaction])
        .await
        .is_ok());
}
