//! Journey: delete authorization (scenario S2) and full cross-store removal.

use chrono::Utc;
use engram_core::{ErrorCode, RetrievalRequest};
use engram_e2e_tests::harness::{direct_input, TestHarness};

#[tokio::test]
async fn delete_requires_matching_owner() {
    let harness = TestHarness::new();
    let response = harness
        .service
        .direct_store(direct_input("u1", "signed the lease for the new apartment"))
        .await
        .unwrap();

    // Wrong owner: 403-equivalent, memory untouched
    let err = harness
        .service
        .delete_memory(&response.memory_id, "u2")
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConsentDenied);
    assert!(harness
        .service
        .get_memory(&response.memory_id, "u1")
        .is_ok());

    // Right owner: gone for good
    harness
        .service
        .delete_memory(&response.memory_id, "u1")
        .unwrap();
    assert!(harness
        .service
        .get_memory(&response.memory_id, "u1")
        .is_err());
}

#[tokio::test]
async fn delete_removes_typed_rows_and_retrieval_hits() {
    let harness = TestHarness::new();

    let mut input = direct_input("u1", "panic attack before the investor presentation");
    input.emotional_state = Some("anxious".into());
    input.valence = Some(-0.8);
    input.arousal = Some(0.9);
    input.event_timestamp = Some(Utc::now());
    let response = harness.service.direct_store(input).await.unwrap();
    assert_eq!(
        response.storage.get("emotional"),
        Some(&serde_json::Value::Bool(true))
    );
    assert_eq!(
        response.storage.get("episodic"),
        Some(&serde_json::Value::Bool(true))
    );

    let removed = harness
        .service
        .delete_memory(&response.memory_id, "u1")
        .unwrap();
    assert_eq!(removed.get("chromadb"), Some(&serde_json::Value::Bool(true)));
    assert_eq!(removed.get("emotional"), Some(&serde_json::Value::Bool(true)));
    assert_eq!(removed.get("episodic"), Some(&serde_json::Value::Bool(true)));

    // Invariant: no subsequent retrieval returns the deleted id
    let results = harness
        .service
        .retrieve(RetrievalRequest {
            user_id: "u1".into(),
            query: Some("investor presentation panic".into()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(results
        .results
        .iter()
        .all(|scored| scored.memory.id != response.memory_id));

    // Listing path agrees
    let listing = harness
        .service
        .retrieve(RetrievalRequest {
            user_id: "u1".into(),
            limit: 50,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(listing
        .results
        .iter()
        .all(|scored| scored.memory.id != response.memory_id));
}

#[tokio::test]
async fn deleting_missing_memory_is_not_found() {
    let harness = TestHarness::new();
    let err = harness
        .service
        .delete_memory("mem_does_not_exist", "u1")
        .unwrap_err();
    assert!(matches!(err, engram_core::EngramError::NotFound(_)));
}
