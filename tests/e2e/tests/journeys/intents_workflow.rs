//! Journey: scheduled intents — creation, pending, claim, cooldown gating
//! (scenario S3) and self-disabling fire modes (scenario S5).

use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use engram_core::{
    CreateIntentInput, EngramConfig, ExecutionStatus, FireOutcome, FireRequest, IntentEngine,
    RelationalStore, TriggerCondition, TriggerSchedule,
};
use engram_e2e_tests::harness::TestHarness;

fn engine() -> (TempDir, IntentEngine) {
    let dir = TempDir::new().unwrap();
    let relational = Arc::new(RelationalStore::open(&dir.path().join("relational.db")).unwrap());
    (dir, IntentEngine::new(relational, EngramConfig::default()))
}

fn nvda_intent(fire_mode: &str) -> CreateIntentInput {
    CreateIntentInput {
        user_id: "u1".into(),
        intent_name: Some("nvda watch".into()),
        trigger_type: "price".into(),
        trigger_schedule: TriggerSchedule::default(),
        trigger_condition: Some(TriggerCondition {
            condition_type: Some("price".into()),
            expression: Some("NVDA < 130".into()),
            cooldown_hours: Some(24),
            fire_mode: serde_json::from_value(serde_json::json!(fire_mode)).ok(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn success_fire() -> FireRequest {
    FireRequest {
        status: ExecutionStatus::Success,
        trigger_data: Some(serde_json::json!({"price": 127.9})),
        gate_result: Some("passed".into()),
        message_id: Some("msg_1".into()),
        message_preview: Some("NVDA dipped under 130".into()),
        timing_ms: Some(120),
        error_message: None,
    }
}

#[test]
fn condition_cooldown_full_scenario() {
    let (_dir, engine) = engine();
    let t0 = Utc::now();

    // Creation schedules the first check five minutes out
    let intent = engine.create(nvda_intent("recurring"), t0).unwrap();
    assert_eq!(intent.next_check, Some(t0 + Duration::minutes(5)));

    // Due and claimable once next_check passes
    let due_at = t0 + Duration::minutes(6);
    let pending = engine.pending(Some("u1"), due_at).unwrap();
    assert_eq!(pending.len(), 1);
    let claimed = engine.claim(Some("u1"), 10, due_at).unwrap();
    assert_eq!(claimed.len(), 1);
    // A second worker gets nothing inside the claim TTL
    assert!(engine.claim(Some("u1"), 10, due_at).unwrap().is_empty());

    // T0: successful fire records the execution and stamps the fire time
    let outcome = engine.fire(&intent.id, success_fire(), due_at).unwrap();
    let FireOutcome::Recorded { intent: fired, execution } = outcome else {
        panic!("expected a recorded execution");
    };
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(fired.execution_count, 1);
    assert_eq!(fired.last_condition_fire, Some(due_at));

    // T0+1h: inside the window — cooldown_active, remaining about 23h,
    // no new audit row, counter untouched
    let gated_at = due_at + Duration::hours(1);
    let outcome = engine.fire(&intent.id, success_fire(), gated_at).unwrap();
    let FireOutcome::CooldownActive {
        cooldown_remaining_hours,
        intent: gated,
    } = outcome
    else {
        panic!("expected cooldown_active");
    };
    assert!((cooldown_remaining_hours - 23.0).abs() < 0.05);
    assert_eq!(gated.execution_count, 1);
    assert_eq!(engine.executions(&intent.id, 10).unwrap().len(), 1);

    // T0+25h: window has passed — executes again
    let clear_at = due_at + Duration::hours(25);
    let outcome = engine.fire(&intent.id, success_fire(), clear_at).unwrap();
    let FireOutcome::Recorded { intent: fired, .. } = outcome else {
        panic!("expected a recorded execution");
    };
    assert_eq!(fired.execution_count, 2);
    assert_eq!(engine.executions(&intent.id, 10).unwrap().len(), 2);

    // Invariant: the two successful executions are >= 24h apart
    let executions = engine.executions(&intent.id, 10).unwrap();
    let mut times: Vec<_> = executions
        .iter()
        .filter(|e| e.status == ExecutionStatus::Success)
        .map(|e| e.executed_at)
        .collect();
    times.sort();
    assert!(times[1] - times[0] >= Duration::hours(24));
}

#[test]
fn once_intent_disables_itself_and_leaves_pending() {
    let (_dir, engine) = engine();
    let t0 = Utc::now();
    let intent = engine.create(nvda_intent("once"), t0).unwrap();

    let outcome = engine.fire(&intent.id, success_fire(), t0).unwrap();
    let FireOutcome::Recorded { intent: fired, .. } = outcome else {
        panic!("expected a recorded execution");
    };
    assert!(!fired.enabled);
    assert_eq!(fired.disabled_reason.as_deref(), Some("fire_mode_once"));

    // Disabled intents remain (destroyed only on explicit delete) but are
    // never pending again
    assert!(engine.get(&intent.id).is_ok());
    for days in [1, 7, 30] {
        let later = t0 + Duration::days(days);
        assert!(engine.pending(Some("u1"), later).unwrap().is_empty());
    }
}

#[test]
fn cooldown_zero_rejected_via_service_surface() {
    let harness = TestHarness::new();
    let mut input = nvda_intent("recurring");
    input.trigger_condition.as_mut().unwrap().cooldown_hours = Some(0);
    let err = harness.service.intent_create(input).unwrap_err();
    assert_eq!(err.code(), engram_core::ErrorCode::Validation);
}

#[test]
fn service_round_trip_create_and_list() {
    let harness = TestHarness::new();
    let created = harness.service.intent_create(nvda_intent("recurring")).unwrap();
    assert!(created.enabled);
    assert!(created.next_check.is_some());

    let listed = harness.service.intent_list(Some("u1"), true).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, created.id);

    // Freshly created: next_check is five minutes out, so nothing pending yet
    assert!(harness.service.intent_pending(Some("u1")).unwrap().is_empty());

    assert!(harness.service.intent_delete(&created.id).unwrap());
    assert!(harness.service.intent_get(&created.id).is_err());
}

#[test]
fn interval_intent_round_trip_pending_after_next_check() {
    let (_dir, engine) = engine();
    let t0 = Utc::now();
    let intent = engine
        .create(
            CreateIntentInput {
                user_id: "u1".into(),
                trigger_type: "interval".into(),
                trigger_schedule: TriggerSchedule {
                    interval_minutes: Some(15),
                    ..Default::default()
                },
                ..Default::default()
            },
            t0,
        )
        .unwrap();

    // Round-trip law: pending returns it once next_check passes
    let before = engine.pending(Some("u1"), t0 + Duration::minutes(5)).unwrap();
    assert!(before.is_empty());
    let after = engine.pending(Some("u1"), t0 + Duration::minutes(16)).unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].intent.id, intent.id);
}
