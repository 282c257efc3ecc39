//! Journey: direct episodic store and retrieve (scenario S1).

use chrono::Utc;
use engram_core::RetrievalRequest;
use engram_e2e_tests::harness::{direct_input, TestHarness};

#[tokio::test]
async fn direct_episodic_store_then_retrieve() {
    let harness = TestHarness::new();

    let mut input = direct_input("u1", "Attended Sarah's graduation at Stanford");
    input.layer = Some("long-term".into());
    input.event_timestamp = Some(Utc::now());
    input.location = Some("Stanford".into());
    input.participants = vec!["Sarah".into()];
    input.event_type = Some("family_milestone".into());
    input.importance = Some(0.9);

    let response = harness.service.direct_store(input).await.unwrap();
    assert_eq!(response.status, "success");
    assert!(response.memory_id.starts_with("mem_"));
    assert_eq!(
        response.storage.get("chromadb"),
        Some(&serde_json::Value::Bool(true))
    );
    assert_eq!(
        response.storage.get("episodic"),
        Some(&serde_json::Value::Bool(true)),
        "episodic typed field must activate the episodic store"
    );

    // Distractor memories for the same user
    for content in [
        "prefers green tea over coffee in the morning",
        "works on distributed storage systems",
    ] {
        harness
            .service
            .direct_store(direct_input("u1", content))
            .await
            .unwrap();
    }

    let results = harness
        .service
        .retrieve(RetrievalRequest {
            user_id: "u1".into(),
            query: Some("graduation".into()),
            limit: 5,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(!results.results.is_empty());
    assert!(
        results.results[0].memory.content.contains("Sarah's graduation"),
        "top hit should be the graduation memory, got: {}",
        results.results[0].memory.content
    );
    assert_eq!(results.results[0].memory.id, response.memory_id);
    assert!(results.results[0].semantic_score > 0.0);

    // Round-trip law: the stored memory is in the top-K for K >= 5
    let ids: Vec<&str> = results
        .results
        .iter()
        .map(|scored| scored.memory.id.as_str())
        .collect();
    assert!(ids.contains(&response.memory_id.as_str()));
}

#[tokio::test]
async fn retrieval_is_user_scoped() {
    let harness = TestHarness::new();
    harness
        .service
        .direct_store(direct_input("u1", "climbed mount rainier last summer"))
        .await
        .unwrap();

    let results = harness
        .service
        .retrieve(RetrievalRequest {
            user_id: "u2".into(),
            query: Some("rainier".into()),
            limit: 5,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(results.results.is_empty(), "tenants must not see each other");
}

#[tokio::test]
async fn content_over_limit_is_a_validation_error() {
    let harness = TestHarness::new();
    let input = direct_input("u1", &"x".repeat(5001));
    let err = harness.service.direct_store(input).await.unwrap_err();
    assert_eq!(err.code(), engram_core::ErrorCode::Validation);
}

#[tokio::test]
async fn retrieval_hits_increment_access_count() {
    let harness = TestHarness::new();
    let response = harness
        .service
        .direct_store(direct_input("u1", "sourdough starter needs feeding daily"))
        .await
        .unwrap();

    for _ in 0..2 {
        harness
            .service
            .retrieve(RetrievalRequest {
                user_id: "u1".into(),
                query: Some("sourdough starter".into()),
                limit: 5,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let memory = harness
        .service
        .get_memory(&response.memory_id, "u1")
        .unwrap();
    assert!(memory.access_count >= 2);
}
