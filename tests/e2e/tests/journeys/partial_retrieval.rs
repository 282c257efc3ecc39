//! Journey: partial-result diagnostics (scenario S6) — optional branches
//! degrade to diagnostics instead of failing the request.

use std::sync::Arc;

use tempfile::TempDir;

use engram_core::{
    record_metadata, BranchStatus, CacheStore, EmbeddingProvider, EngramConfig, MemoryLayer,
    MemoryRecord, RetrievalEngine, RetrievalFilters, RetrievalRequest, VectorStore,
};
use engram_e2e_tests::harness::TEST_DIMENSION;
use engram_e2e_tests::mocks::HashEmbedder;

/// Engine with no relational and no time-series store configured: the
/// semantic branch carries the request alone.
async fn degraded_engine() -> (TempDir, RetrievalEngine, Arc<VectorStore>) {
    let dir = TempDir::new().unwrap();
    let vector =
        Arc::new(VectorStore::open(&dir.path().join("vector.db"), TEST_DIMENSION).unwrap());
    let embedder = Arc::new(HashEmbedder::new(TEST_DIMENSION));

    // Seed a memory straight through the vector adapter
    let mut memory = MemoryRecord::new("u1", "booked flights to lisbon for october", MemoryLayer::Episodic);
    memory.embedding = embedder.embed(&memory.content).await.unwrap();
    vector
        .upsert(
            &memory.id,
            &memory.embedding,
            &memory.content,
            &record_metadata(&memory),
        )
        .unwrap();

    let engine = RetrievalEngine::new(
        vector.clone(),
        None,
        None,
        Arc::new(CacheStore::default()),
        embedder,
        None,
        EngramConfig {
            data_dir: Some(dir.path().to_path_buf()),
            embedding_dimension: TEST_DIMENSION,
            ..Default::default()
        },
    );
    (dir, engine, vector)
}

#[tokio::test]
async fn missing_branches_degrade_to_diagnostics() {
    let (_dir, engine, _vector) = degraded_engine().await;

    let results = engine
        .retrieve(RetrievalRequest {
            user_id: "u1".into(),
            query: Some("flights to lisbon".into()),
            filters: RetrievalFilters {
                from: Some(chrono::Utc::now() - chrono::Duration::days(7)),
                ..Default::default()
            },
            limit: 5,
            ..Default::default()
        })
        .await
        .expect("degraded branches must not fail the request");

    // Semantic results still flow
    assert!(!results.results.is_empty());
    assert!(results.results[0].memory.content.contains("lisbon"));

    // Clients can tell "branch skipped" from "no hits"
    assert!(matches!(
        results.diagnostics.temporal,
        BranchStatus::Unavailable(_)
    ));
    assert!(matches!(
        results.diagnostics.graph,
        BranchStatus::Unavailable(_)
    ));
    assert!(results.diagnostics.degraded());

    // Graph absence scores 0 uniformly
    assert_eq!(results.results[0].graph_proximity, 0.0);
}

#[tokio::test]
async fn healthy_listing_reports_clean_diagnostics() {
    let (_dir, engine, _vector) = degraded_engine().await;

    // The listing path consults neither optional branch
    let results = engine
        .retrieve(RetrievalRequest {
            user_id: "u1".into(),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(results.total, 1);
    assert!(!results.diagnostics.degraded());
}

#[tokio::test]
async fn timeline_without_timeseries_is_a_dependency_error() {
    let (_dir, engine, _vector) = degraded_engine().await;
    let err = engine.timeline("u1", None, None, 10, None).unwrap_err();
    assert_eq!(err.code(), engram_core::ErrorCode::DependencyUnavailable);
}
