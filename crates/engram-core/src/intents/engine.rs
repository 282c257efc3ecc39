//! Scheduled-intent engine: pending query, claim, fire callback, audit.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::{
    initial_next_check, next_cron_occurrence, ExecutionRecord, ExecutionStatus, FireMode,
    IntentRecord, TriggerType, UpdateIntentInput,
};
use crate::config::EngramConfig;
use crate::error::{EngramError, Result};
use crate::stores::relational::execution_id;
use crate::stores::RelationalStore;

/// Fire callback body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FireRequest {
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "trigger_data")]
    pub trigger_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "gate_result")]
    pub gate_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "message_id")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "message_preview")]
    pub message_preview: Option<String>,
    /// Worker-side timing metric in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "timing_ms")]
    pub timing_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "error_message")]
    pub error_message: Option<String>,
}

/// Result of a fire callback. Cooldown is a first-class status, not an error.
#[derive(Debug, Clone)]
pub enum FireOutcome {
    Recorded {
        execution: ExecutionRecord,
        intent: IntentRecord,
    },
    CooldownActive {
        cooldown_remaining_hours: f64,
        intent: IntentRecord,
    },
}

/// A due intent with its cooldown annotation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingIntent {
    #[serde(flatten)]
    pub intent: IntentRecord,
    pub cooldown_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_hours: Option<f64>,
}

/// The scheduled-intent engine
pub struct IntentEngine {
    relational: Arc<RelationalStore>,
    config: EngramConfig,
}

impl IntentEngine {
    pub fn new(relational: Arc<RelationalStore>, config: EngramConfig) -> Self {
        Self { relational, config }
    }

    /// Create a validated intent
    pub fn create(&self, input: super::CreateIntentInput, now: DateTime<Utc>) -> Result<IntentRecord> {
        let record = input.into_record(now)?;
        self.relational.insert_intent(&record)?;
        tracing::info!(
            intent_id = %record.id,
            trigger = record.trigger_type.as_str(),
            "intent created"
        );
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<IntentRecord> {
        self.relational
            .get_intent(id)?
            .ok_or_else(|| EngramError::NotFound(format!("intent {id}")))
    }

    pub fn list(&self, user_id: Option<&str>, include_disabled: bool) -> Result<Vec<IntentRecord>> {
        Ok(self.relational.list_intents(user_id, include_disabled)?)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.relational.delete_intent(id)?)
    }

    /// PATCH an intent; schedule or condition changes re-validate and
    /// recompute `next_check`.
    pub fn update(
        &self,
        id: &str,
        patch: UpdateIntentInput,
        now: DateTime<Utc>,
    ) -> Result<IntentRecord> {
        let mut intent = self.get(id)?;

        if let Some(intent_name) = patch.intent_name {
            intent.intent_name = intent_name;
        }
        if let Some(description) = patch.description {
            intent.description = Some(description);
        }
        if let Some(action_type) = patch.action_type.as_deref() {
            intent.action_type = super::ActionType::parse_name(action_type).ok_or_else(|| {
                EngramError::Validation(format!("unknown action type: {action_type}"))
            })?;
        }
        if let Some(action_context) = patch.action_context {
            intent.action_context = Some(action_context);
        }
        if let Some(priority) = patch.action_priority.as_deref() {
            intent.action_priority = super::ActionPriority::parse_name(priority).ok_or_else(
                || EngramError::Validation(format!("unknown action priority: {priority}")),
            )?;
        }
        if let Some(expires_at) = patch.expires_at {
            intent.expires_at = Some(expires_at);
        }
        if let Some(max_executions) = patch.max_executions {
            intent.max_executions = Some(max_executions);
        }

        let mut reschedule = false;
        if let Some(mut schedule) = patch.trigger_schedule {
            super::parse_timezone(&schedule.timezone)?;
            schedule.check_interval_minutes = schedule
                .check_interval_minutes
                .max(super::MIN_CHECK_INTERVAL_MINUTES);
            if intent.trigger_type == TriggerType::Cron {
                let expr = schedule.cron.as_deref().ok_or_else(|| {
                    EngramError::validation("cron trigger requires a cron expression")
                })?;
                super::parse_cron(expr)?;
            }
            intent.trigger_schedule = schedule;
            reschedule = true;
        }
        if let Some(mut condition) = patch.trigger_condition {
            super::validate_condition(intent.trigger_type, &mut condition)?;
            intent.trigger_condition = Some(condition);
        }

        match patch.enabled {
            Some(true) if !intent.enabled => {
                intent.enabled = true;
                intent.disabled_reason = None;
                reschedule = true;
            }
            Some(false) if intent.enabled => {
                intent.enabled = false;
                intent.disabled_reason = Some("user_disabled".into());
                intent.next_check = None;
            }
            _ => {}
        }

        if reschedule && intent.enabled {
            intent.next_check =
                initial_next_check(intent.trigger_type, &intent.trigger_schedule, now)?;
        }
        intent.updated_at = now;
        self.relational.save_intent(&intent)?;
        Ok(intent)
    }

    /// Due intents ordered by `next_check`. Condition triggers inside their
    /// cooldown window are included with `cooldown_active = true`.
    pub fn pending(&self, user_id: Option<&str>, now: DateTime<Utc>) -> Result<Vec<PendingIntent>> {
        let due = self.relational.pending_intents(user_id, now)?;
        Ok(due
            .into_iter()
            .map(|intent| {
                let remaining = cooldown_remaining_hours(&intent, now);
                PendingIntent {
                    cooldown_active: remaining.is_some(),
                    cooldown_remaining_hours: remaining,
                    intent,
                }
            })
            .collect())
    }

    /// Worker claim: atomically stamp `claimed_at` on due rows so two
    /// workers never fire the same intent within the claim TTL.
    pub fn claim(
        &self,
        user_id: Option<&str>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<IntentRecord>> {
        let ttl = self.config.intent_claim_ttl.as_secs() as i64;
        Ok(self
            .relational
            .claim_due_intents(user_id, limit.clamp(1, 100), ttl, now)?)
    }

    /// Fire callback from the proactive worker
    pub fn fire(&self, id: &str, request: FireRequest, now: DateTime<Utc>) -> Result<FireOutcome> {
        let mut intent = self.get(id)?;
        let is_condition = intent.trigger_type.is_condition();

        // Cooldown gate: two successful condition fires can never land
        // within the window. No execution row, no counter bump.
        if is_condition && request.status == ExecutionStatus::Success {
            if let Some(remaining) = cooldown_remaining_hours(&intent, now) {
                intent.last_checked = Some(now);
                intent.next_check = Some(
                    now + Duration::minutes(intent.trigger_schedule.check_interval_minutes),
                );
                intent.claimed_at = None;
                intent.updated_at = now;
                self.relational.save_intent(&intent)?;
                return Ok(FireOutcome::CooldownActive {
                    cooldown_remaining_hours: remaining,
                    intent,
                });
            }
        }

        let execution = ExecutionRecord {
            id: execution_id(),
            intent_id: intent.id.clone(),
            executed_at: now,
            trigger_type: intent.trigger_type,
            trigger_data: request.trigger_data,
            status: request.status,
            gate_result: request.gate_result,
            message_id: request.message_id,
            message_preview: request.message_preview,
            duration_ms: request.timing_ms,
            error_message: request.error_message,
        };
        self.relational.insert_execution(&execution)?;

        intent.last_checked = Some(now);
        intent.last_execution_status = Some(request.status.as_str().to_string());
        let fired = request.status == ExecutionStatus::Success;
        if fired {
            intent.last_executed = Some(now);
            intent.execution_count += 1;
            if is_condition {
                intent.last_condition_fire = Some(now);
            }
        }

        // Self-disabling transitions, checked in priority order
        if fired && intent.trigger_type == TriggerType::Once {
            intent.enabled = false;
            intent.disabled_reason = Some("trigger_once".into());
        }
        let fire_mode_once = intent
            .trigger_condition
            .as_ref()
            .map(|c| c.effective_fire_mode() == FireMode::Once)
            .unwrap_or(false);
        if fired && is_condition && fire_mode_once {
            intent.enabled = false;
            intent.disabled_reason = Some("fire_mode_once".into());
        }
        if let Some(max) = intent.max_executions {
            if intent.execution_count >= max {
                intent.enabled = false;
                intent.disabled_reason = Some("max_executions_reached".into());
            }
        }
        if let Some(expires_at) = intent.expires_at {
            if expires_at <= now {
                intent.enabled = false;
                intent.disabled_reason = Some("expired".into());
            }
        }

        intent.next_check = if intent.enabled {
            self.next_check_after(&intent, fired, now)?
        } else {
            None
        };
        intent.claimed_at = None;
        intent.updated_at = now;
        self.relational.save_intent(&intent)?;

        Ok(FireOutcome::Recorded { execution, intent })
    }

    /// Execution audit rows
    pub fn executions(&self, intent_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        Ok(self.relational.list_executions(intent_id, limit.clamp(1, 500))?)
    }

    /// Recompute `next_check` after a fire. Monotone for recurring triggers:
    /// every branch moves strictly forward from `now`.
    fn next_check_after(
        &self,
        intent: &IntentRecord,
        fired: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let schedule = &intent.trigger_schedule;
        match intent.trigger_type {
            TriggerType::Cron => {
                let expr = schedule.cron.as_deref().ok_or_else(|| {
                    EngramError::validation("cron trigger requires a cron expression")
                })?;
                next_cron_occurrence(expr, &schedule.timezone, now)
            }
            TriggerType::Interval => Ok(schedule
                .interval_minutes
                .map(|minutes| now + Duration::minutes(minutes))),
            TriggerType::Once => Ok(None),
            TriggerType::Price | TriggerType::Silence | TriggerType::Portfolio => {
                let check = schedule.check_interval_minutes;
                let minutes = if fired {
                    let cooldown_minutes = intent
                        .trigger_condition
                        .as_ref()
                        .map(|c| c.effective_cooldown_hours() * 60)
                        .unwrap_or(0);
                    check.max(cooldown_minutes)
                } else {
                    check
                };
                Ok(Some(now + Duration::minutes(minutes)))
            }
        }
    }
}

/// Hours left in the cooldown window, when one is active
fn cooldown_remaining_hours(intent: &IntentRecord, now: DateTime<Utc>) -> Option<f64> {
    if !intent.trigger_type.is_condition() {
        return None;
    }
    let condition = intent.trigger_condition.as_ref()?;
    let last_fire = intent.last_condition_fire?;
    let cooldown_hours = condition.effective_cooldown_hours() as f64;
    let elapsed_hours = (now - last_fire).num_seconds() as f64 / 3600.0;
    if elapsed_hours < cooldown_hours {
        Some(cooldown_hours - elapsed_hours)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intents::{CreateIntentInput, TriggerCondition, TriggerSchedule};
    use tempfile::TempDir;

    fn engine() -> (TempDir, IntentEngine) {
        let dir = TempDir::new().unwrap();
        let relational =
            Arc::new(RelationalStore::open(&dir.path().join("relational.db")).unwrap());
        (dir, IntentEngine::new(relational, EngramConfig::default()))
    }

    fn price_intent(fire_mode: &str) -> CreateIntentInput {
        CreateIntentInput {
            user_id: "u1".into(),
            trigger_type: "price".into(),
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

    fn success() -> FireRequest {
        FireRequest {
            status: ExecutionStatus::Success,
            trigger_data: Some(serde_json::json!({"price": 128.4})),
            gate_result: None,
            message_id: Some("msg_1".into()),
            message_preview: None,
            timing_ms: Some(45),
            error_message: None,
        }
    }

    #[test]
    fn test_condition_cooldown_scenario() {
        let (_dir, engine) = engine();
        let t0 = Utc::now();
        let intent = engine.create(price_intent("recurring"), t0).unwrap();

        // First fire at T0 records an execution and stamps the fire time
        let outcome = engine.fire(&intent.id, success(), t0).unwrap();
        let FireOutcome::Recorded { intent: fired, .. } = outcome else {
            panic!("expected recorded outcome");
        };
        assert_eq!(fired.execution_count, 1);
        assert_eq!(fired.last_condition_fire, Some(t0));

        // One hour later: cooldown_active, remaining about 23h, no new row
        let t1 = t0 + Duration::hours(1);
        let outcome = engine.fire(&intent.id, success(), t1).unwrap();
        let FireOutcome::CooldownActive {
            cooldown_remaining_hours,
            intent: gated,
        } = outcome
        else {
            panic!("expected cooldown outcome");
        };
        assert!((cooldown_remaining_hours - 23.0).abs() < 0.1);
        assert_eq!(gated.execution_count, 1);
        assert_eq!(gated.last_condition_fire, Some(t0));
        assert_eq!(engine.executions(&intent.id, 10).unwrap().len(), 1);

        // 25 hours later the window has passed
        let t2 = t0 + Duration::hours(25);
        let outcome = engine.fire(&intent.id, success(), t2).unwrap();
        let FireOutcome::Recorded { intent: fired, .. } = outcome else {
            panic!("expected recorded outcome");
        };
        assert_eq!(fired.execution_count, 2);
        assert_eq!(engine.executions(&intent.id, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_fire_mode_once_disables_after_success() {
        let (_dir, engine) = engine();
        let t0 = Utc::now();
        let intent = engine.create(price_intent("once"), t0).unwrap();

        let outcome = engine.fire(&intent.id, success(), t0).unwrap();
        let FireOutcome::Recorded { intent: fired, .. } = outcome else {
            panic!("expected recorded outcome");
        };
        assert!(!fired.enabled);
        assert_eq!(fired.disabled_reason.as_deref(), Some("fire_mode_once"));
        assert_eq!(fired.next_check, None);

        // Pending never returns it again, even far in the future
        let later = t0 + Duration::days(30);
        assert!(engine.pending(Some("u1"), later).unwrap().is_empty());
    }

    #[test]
    fn test_failed_fire_does_not_consume_budget_or_cooldown() {
        let (_dir, engine) = engine();
        let t0 = Utc::now();
        let intent = engine.create(price_intent("recurring"), t0).unwrap();

        let failed = FireRequest {
            status: ExecutionStatus::Failed,
            error_message: Some("worker crashed".into()),
            trigger_data: None,
            gate_result: None,
            message_id: None,
            message_preview: None,
            timing_ms: None,
        };
        let outcome = engine.fire(&intent.id, failed, t0).unwrap();
        let FireOutcome::Recorded { intent: after, execution } = outcome else {
            panic!("expected recorded outcome");
        };
        assert_eq!(after.execution_count, 0);
        assert_eq!(after.last_condition_fire, None);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        // The audit row still exists
        assert_eq!(engine.executions(&intent.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_max_executions_disables() {
        let (_dir, engine) = engine();
        let t0 = Utc::now();
        let mut input = price_intent("recurring");
        input.max_executions = Some(1);
        let intent = engine.create(input, t0).unwrap();

        let outcome = engine.fire(&intent.id, success(), t0).unwrap();
        let FireOutcome::Recorded { intent: fired, .. } = outcome else {
            panic!("expected recorded outcome");
        };
        assert!(!fired.enabled);
        assert_eq!(
            fired.disabled_reason.as_deref(),
            Some("max_executions_reached")
        );
    }

    #[test]
    fn test_next_check_monotone_for_interval() {
        let (_dir, engine) = engine();
        let t0 = Utc::now();
        let intent = engine
            .create(
                CreateIntentInput {
                    user_id: "u1".into(),
                    trigger_type: "interval".into(),
                    trigger_schedule: TriggerSchedule {
                        interval_minutes: Some(30),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                t0,
            )
            .unwrap();
        let first = intent.next_check.unwrap();

        let t1 = t0 + Duration::minutes(31);
        let outcome = engine.fire(&intent.id, success(), t1).unwrap();
        let FireOutcome::Recorded { intent: after, .. } = outcome else {
            panic!("expected recorded outcome");
        };
        let second = after.next_check.unwrap();
        assert!(second > first);
        assert_eq!(second, t1 + Duration::minutes(30));
    }

    #[test]
    fn test_successful_condition_fire_defers_by_cooldown() {
        let (_dir, engine) = engine();
        let t0 = Utc::now();
        let intent = engine.create(price_intent("recurring"), t0).unwrap();

        let outcome = engine.fire(&intent.id, success(), t0).unwrap();
        let FireOutcome::Recorded { intent: after, .. } = outcome else {
            panic!("expected recorded outcome");
        };
        // max(check_interval = 5m, cooldown = 24h) = 24h
        assert_eq!(after.next_check, Some(t0 + Duration::hours(24)));

        // A condition_not_met check polls again on the short interval
        let not_met = FireRequest {
            status: ExecutionStatus::ConditionNotMet,
            trigger_data: None,
            gate_result: None,
            message_id: None,
            message_preview: None,
            timing_ms: None,
            error_message: None,
        };
        let t1 = t0 + Duration::hours(25);
        let outcome = engine.fire(&intent.id, not_met, t1).unwrap();
        let FireOutcome::Recorded { intent: after, .. } = outcome else {
            panic!("expected recorded outcome");
        };
        assert_eq!(after.next_check, Some(t1 + Duration::minutes(5)));
    }

    #[test]
    fn test_claim_then_pending_annotation() {
        let (_dir, engine) = engine();
        let t0 = Utc::now();
        let created = engine.create(price_intent("recurring"), t0).unwrap();

        // Due once next_check passes
        let due_at = created.next_check.unwrap() + Duration::seconds(1);
        let pending = engine.pending(Some("u1"), due_at).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].cooldown_active);

        let claimed = engine.claim(Some("u1"), 10, due_at).unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(claimed[0].claimed_at.is_some());

        // After a successful fire, the pending annotation flags cooldown
        engine.fire(&created.id, success(), due_at).unwrap();
        let recheck_at = due_at + Duration::hours(25);
        let pending = engine.pending(Some("u1"), recheck_at).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].cooldown_active, "cooldown has passed by then");
    }

    #[test]
    fn test_update_reenables_and_reschedules() {
        let (_dir, engine) = engine();
        let t0 = Utc::now();
        let intent = engine.create(price_intent("once"), t0).unwrap();
        engine.fire(&intent.id, success(), t0).unwrap();
        assert!(!engine.get(&intent.id).unwrap().enabled);

        let t1 = t0 + Duration::hours(1);
        let updated = engine
            .update(
                &intent.id,
                UpdateIntentInput {
                    enabled: Some(true),
                    ..Default::default()
                },
                t1,
            )
            .unwrap();
        assert!(updated.enabled);
        assert!(updated.disabled_reason.is_none());
        assert_eq!(updated.next_check, Some(t1 + Duration::minutes(5)));
    }
}
