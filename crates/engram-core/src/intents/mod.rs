//! Scheduled intents - types and validation.
//!
//! An intent is a future obligation: "check this trigger, and when it fires,
//! do that action." The engine (see [`engine`]) schedules, claims, gates on
//! cooldown and records outcomes; evaluating condition expressions against
//! market or calendar data happens in the proactive worker.

mod engine;

pub use engine::{FireOutcome, FireRequest, IntentEngine, PendingIntent};

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{EngramError, Result};

/// Cooldown domain in hours
pub const COOLDOWN_MIN_HOURS: i64 = 1;
pub const COOLDOWN_MAX_HOURS: i64 = 168;

/// Minimum polling interval for condition triggers
pub const MIN_CHECK_INTERVAL_MINUTES: i64 = 5;

/// Default intent timezone when none is supplied
pub const DEFAULT_TIMEZONE: &str = "America/Los_Angeles";

// ============================================================================
// ENUMS
// ============================================================================

/// What makes the intent fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Cron,
    Interval,
    Once,
    Price,
    Silence,
    Portfolio,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Cron => "cron",
            TriggerType::Interval => "interval",
            TriggerType::Once => "once",
            TriggerType::Price => "price",
            TriggerType::Silence => "silence",
            TriggerType::Portfolio => "portfolio",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cron" => Some(TriggerType::Cron),
            "interval" => Some(TriggerType::Interval),
            "once" => Some(TriggerType::Once),
            "price" => Some(TriggerType::Price),
            "silence" => Some(TriggerType::Silence),
            "portfolio" => Some(TriggerType::Portfolio),
            _ => None,
        }
    }

    /// Condition triggers poll on an interval and gate on cooldown
    pub fn is_condition(&self) -> bool {
        matches!(
            self,
            TriggerType::Price | TriggerType::Silence | TriggerType::Portfolio
        )
    }
}

/// What the proactive worker should do when the intent fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    #[default]
    Notify,
    CheckIn,
    Briefing,
    Analysis,
    Reminder,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Notify => "notify",
            ActionType::CheckIn => "check_in",
            ActionType::Briefing => "briefing",
            ActionType::Analysis => "analysis",
            ActionType::Reminder => "reminder",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "notify" => Some(ActionType::Notify),
            "check_in" => Some(ActionType::CheckIn),
            "briefing" => Some(ActionType::Briefing),
            "analysis" => Some(ActionType::Analysis),
            "reminder" => Some(ActionType::Reminder),
            _ => None,
        }
    }
}

/// Priority attached to the action
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl ActionPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionPriority::Low => "low",
            ActionPriority::Normal => "normal",
            ActionPriority::High => "high",
            ActionPriority::Critical => "critical",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(ActionPriority::Low),
            "normal" => Some(ActionPriority::Normal),
            "high" => Some(ActionPriority::High),
            "critical" => Some(ActionPriority::Critical),
            _ => None,
        }
    }
}

/// Whether a condition trigger disables itself after its first success
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FireMode {
    Once,
    #[default]
    Recurring,
}

/// Outcome of one execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    GateBlocked,
    ConditionNotMet,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::GateBlocked => "gate_blocked",
            ExecutionStatus::ConditionNotMet => "condition_not_met",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "success" => Some(ExecutionStatus::Success),
            "failed" => Some(ExecutionStatus::Failed),
            "gate_blocked" => Some(ExecutionStatus::GateBlocked),
            "condition_not_met" => Some(ExecutionStatus::ConditionNotMet),
            _ => None,
        }
    }
}

// ============================================================================
// TRIGGER CONTAINERS
// ============================================================================

/// When to check: a cron expression, an interval, or a one-shot time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSchedule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "interval_minutes")]
    pub interval_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "fire_at")]
    pub fire_at: Option<DateTime<Utc>>,
    /// IANA timezone name; applied only when computing next-check from cron
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Polling interval for condition triggers, floored at 5
    #[serde(default = "default_check_interval")]
    #[serde(alias = "check_interval_minutes")]
    pub check_interval_minutes: i64,
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

fn default_check_interval() -> i64 {
    MIN_CHECK_INTERVAL_MINUTES
}

impl Default for TriggerSchedule {
    fn default() -> Self {
        Self {
            cron: None,
            interval_minutes: None,
            fire_at: None,
            timezone: default_timezone(),
            check_interval_minutes: default_check_interval(),
        }
    }
}

/// What must hold for a condition trigger to fire.
///
/// Accepts either the unified `{condition_type, expression, cooldown_hours,
/// fire_mode}` shape or the legacy structured fields
/// (ticker/operator/value/threshold_hours), which validation rewrites into an
/// expression.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "condition_type")]
    pub condition_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "cooldown_hours")]
    pub cooldown_hours: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "fire_mode")]
    pub fire_mode: Option<FireMode>,

    // legacy structured fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "threshold_hours")]
    pub threshold_hours: Option<i64>,
}

impl TriggerCondition {
    /// Effective cooldown window in hours (default 24 for condition triggers)
    pub fn effective_cooldown_hours(&self) -> i64 {
        self.cooldown_hours.unwrap_or(24)
    }

    /// Effective fire mode
    pub fn effective_fire_mode(&self) -> FireMode {
        self.fire_mode.unwrap_or_default()
    }
}

// ============================================================================
// RECORD
// ============================================================================

/// A scheduled intent as persisted in the relational store
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRecord {
    pub id: String,
    pub user_id: String,
    pub intent_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    pub trigger_schedule: TriggerSchedule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_condition: Option<TriggerCondition>,
    pub action_type: ActionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_context: Option<String>,
    pub action_priority: ActionPriority,
    pub next_check: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_executed: Option<DateTime<Utc>>,
    pub execution_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution_status: Option<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_executions: Option<i64>,
    pub last_condition_fire: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable execution audit row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub intent_id: String,
    pub executed_at: DateTime<Utc>,
    pub trigger_type: TriggerType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_data: Option<Value>,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ============================================================================
// CREATE / PATCH INPUTS
// ============================================================================

/// Request body for intent creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateIntentInput {
    #[serde(alias = "user_id")]
    pub user_id: String,
    #[serde(default)]
    #[serde(alias = "intent_name")]
    pub intent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(alias = "trigger_type")]
    pub trigger_type: String,
    #[serde(default)]
    #[serde(alias = "trigger_schedule")]
    pub trigger_schedule: TriggerSchedule,
    #[serde(alias = "condition", skip_serializing_if = "Option::is_none")]
    #[serde(alias = "trigger_condition")]
    pub trigger_condition: Option<TriggerCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "action_type")]
    pub action_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "action_context")]
    pub action_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "action_priority")]
    pub action_priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "expires_at")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "max_executions")]
    pub max_executions: Option<i64>,
}

/// PATCH body for intent updates; every field optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateIntentInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "intent_name")]
    pub intent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "trigger_schedule")]
    pub trigger_schedule: Option<TriggerSchedule>,
    #[serde(alias = "condition", skip_serializing_if = "Option::is_none")]
    #[serde(alias = "trigger_condition")]
    pub trigger_condition: Option<TriggerCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "action_type")]
    pub action_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "action_context")]
    pub action_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "action_priority")]
    pub action_priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "expires_at")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "max_executions")]
    pub max_executions: Option<i64>,
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Parse and validate the timezone name
pub fn parse_timezone(name: &str) -> Result<Tz> {
    Tz::from_str(name)
        .map_err(|_| EngramError::Validation(format!("invalid IANA timezone: {name}")))
}

/// Parse a cron expression; 5-field expressions get a seconds column
/// prepended so both classic and extended forms are accepted.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| EngramError::Validation(format!("invalid cron expression: {e}")))
}

/// Next cron occurrence after `now`, computed in the intent timezone and
/// returned in UTC.
pub fn next_cron_occurrence(
    expression: &str,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_cron(expression)?;
    let tz = parse_timezone(timezone)?;
    Ok(schedule
        .after(&now.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc)))
}

fn validate_condition(trigger_type: TriggerType, condition: &mut TriggerCondition) -> Result<()> {
    // Rewrite legacy structured fields into an expression
    if condition.expression.is_none() {
        match trigger_type {
            TriggerType::Price => {
                if let (Some(ticker), Some(operator), Some(value)) =
                    (&condition.ticker, &condition.operator, condition.value)
                {
                    condition.expression = Some(format!("{ticker} {operator} {value}"));
                }
            }
            TriggerType::Silence => {
                if let Some(hours) = condition.threshold_hours {
                    condition.expression = Some(format!("inactive_hours > {hours}"));
                }
            }
            _ => {}
        }
    }

    let expression = condition
        .expression
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| EngramError::validation("condition trigger requires an expression"))?
        .to_string();

    match trigger_type {
        TriggerType::Price => {
            let re = regex::Regex::new(r"^[A-Z]{1,5}\s*(<=|>=|<|>|=)\s*\d+(\.\d+)?$")
                .map_err(|e| EngramError::internal(e.to_string()))?;
            if !re.is_match(&expression) {
                return Err(EngramError::Validation(format!(
                    "price expression must match 'TICKER (< | > | <= | >= | =) VALUE': {expression}"
                )));
            }
        }
        TriggerType::Silence => {
            let re = regex::Regex::new(r"^inactive_hours\s*>\s*\d+$")
                .map_err(|e| EngramError::internal(e.to_string()))?;
            if !re.is_match(&expression) {
                return Err(EngramError::Validation(format!(
                    "silence expression must match 'inactive_hours > N': {expression}"
                )));
            }
        }
        TriggerType::Portfolio => {
            const AGGREGATES: &[&str] = &[
                "any_holding_change",
                "any_holding_down",
                "any_holding_up",
                "total_value",
                "total_change",
            ];
            if !AGGREGATES.iter().any(|agg| expression.starts_with(agg)) {
                return Err(EngramError::Validation(format!(
                    "portfolio expression must reference one of {AGGREGATES:?}: {expression}"
                )));
            }
        }
        _ => {}
    }
    condition.expression = Some(expression);

    // Cooldown: reject below the domain, clamp above it
    if let Some(hours) = condition.cooldown_hours {
        if hours < COOLDOWN_MIN_HOURS {
            return Err(EngramError::Validation(format!(
                "cooldownHours must be >= {COOLDOWN_MIN_HOURS}, got {hours}"
            )));
        }
        if hours > COOLDOWN_MAX_HOURS {
            condition.cooldown_hours = Some(COOLDOWN_MAX_HOURS);
        }
    }
    Ok(())
}

impl CreateIntentInput {
    /// Validate and convert into a record with its initial `next_check`
    pub fn into_record(mut self, now: DateTime<Utc>) -> Result<IntentRecord> {
        if self.user_id.trim().is_empty() {
            return Err(EngramError::validation("user_id is required"));
        }
        let trigger_type = TriggerType::parse_name(&self.trigger_type).ok_or_else(|| {
            EngramError::Validation(format!("unknown trigger type: {}", self.trigger_type))
        })?;

        parse_timezone(&self.trigger_schedule.timezone)?;
        self.trigger_schedule.check_interval_minutes = self
            .trigger_schedule
            .check_interval_minutes
            .max(MIN_CHECK_INTERVAL_MINUTES);

        match trigger_type {
            TriggerType::Cron => {
                let expr = self.trigger_schedule.cron.as_deref().ok_or_else(|| {
                    EngramError::validation("cron trigger requires a cron expression")
                })?;
                parse_cron(expr)?;
            }
            TriggerType::Interval => {
                let minutes = self.trigger_schedule.interval_minutes.ok_or_else(|| {
                    EngramError::validation("interval trigger requires intervalMinutes")
                })?;
                if minutes < 1 {
                    return Err(EngramError::validation("intervalMinutes must be >= 1"));
                }
            }
            TriggerType::Once => {
                if self.trigger_schedule.fire_at.is_none() {
                    return Err(EngramError::validation("once trigger requires fireAt"));
                }
            }
            TriggerType::Price | TriggerType::Silence | TriggerType::Portfolio => {
                let condition = self
                    .trigger_condition
                    .get_or_insert_with(TriggerCondition::default);
                validate_condition(trigger_type, condition)?;
            }
        }

        let action_type = match self.action_type.as_deref() {
            Some(raw) => ActionType::parse_name(raw)
                .ok_or_else(|| EngramError::Validation(format!("unknown action type: {raw}")))?,
            None => ActionType::default(),
        };
        let action_priority = match self.action_priority.as_deref() {
            Some(raw) => ActionPriority::parse_name(raw).ok_or_else(|| {
                EngramError::Validation(format!("unknown action priority: {raw}"))
            })?,
            None => ActionPriority::default(),
        };

        let next_check = initial_next_check(trigger_type, &self.trigger_schedule, now)?;

        Ok(IntentRecord {
            id: format!("int_{}", Uuid::new_v4().simple()),
            user_id: self.user_id,
            intent_name: self
                .intent_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("{}_intent", trigger_type.as_str())),
            description: self.description,
            trigger_type,
            trigger_schedule: self.trigger_schedule,
            trigger_condition: self.trigger_condition,
            action_type,
            action_context: self.action_context,
            action_priority,
            next_check,
            last_checked: None,
            last_executed: None,
            execution_count: 0,
            last_execution_status: None,
            enabled: true,
            disabled_reason: None,
            expires_at: self.expires_at,
            max_executions: self.max_executions,
            last_condition_fire: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// First `next_check` for a newly created or re-enabled intent
pub fn initial_next_check(
    trigger_type: TriggerType,
    schedule: &TriggerSchedule,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match trigger_type {
        TriggerType::Cron => {
            let expr = schedule
                .cron
                .as_deref()
                .ok_or_else(|| EngramError::validation("cron trigger requires a cron expression"))?;
            next_cron_occurrence(expr, &schedule.timezone, now)
        }
        TriggerType::Interval => Ok(schedule
            .interval_minutes
            .map(|minutes| now + Duration::minutes(minutes))),
        TriggerType::Once => Ok(schedule.fire_at),
        TriggerType::Price | TriggerType::Silence | TriggerType::Portfolio => {
            Ok(Some(now + Duration::minutes(schedule.check_interval_minutes)))
        }
    }
}
