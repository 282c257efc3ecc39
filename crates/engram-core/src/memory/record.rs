//! Memory record and direct-store input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::config::EngramConfig;
use crate::error::{EngramError, Result};
use crate::memory::{
    EmotionalFields, EpisodicFields, MemoryLayer, MemorySource, MemoryType, PortfolioEvent,
    ProceduralFields, ProficiencyLevel, TypedFields,
};

/// Ticker pattern accepted anywhere a portfolio symbol appears
pub(crate) const TICKER_PATTERN: &str = r"^[A-Z]{1,5}$";

/// Deterministic memory id: hash of user, content and a coarse (hourly)
/// timestamp bucket. Re-ingesting the same content within the hour maps to
/// the same id, which is what gives every store upsert its idempotency key.
pub fn memory_id(user_id: &str, content: &str, created_at: DateTime<Utc>) -> String {
    let bucket = created_at.format("%Y-%m-%dT%H").to_string();
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(content.as_bytes());
    hasher.update([0x1f]);
    hasher.update(bucket.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("mem_{hex}")
}

// ============================================================================
// MEMORY RECORD
// ============================================================================

/// The primary unit of memory
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    /// Deterministic id (see [`memory_id`])
    pub id: String,
    /// Tenant key; all retrieval is user-scoped
    #[serde(alias = "user_id")]
    pub user_id: String,
    /// Free-text content
    pub content: String,
    /// Fixed-dimension embedding; omitted from API payloads
    #[serde(default, skip_serializing)]
    pub embedding: Vec<f32>,
    pub layer: MemoryLayer,
    #[serde(rename = "type")]
    #[serde(alias = "memory_type")]
    pub memory_type: MemoryType,
    /// 0.0 to 1.0
    pub importance: f64,
    /// 0.0 to 1.0; decays over time unless reinforced
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: i64,
    pub replay_count: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    #[serde(alias = "persona_tags")]
    pub persona_tags: Vec<String>,
    pub source: MemorySource,
    /// Open key-value map; includes routing flags after persistence
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Typed projections routed to the specialized stores
    #[serde(default, skip_serializing_if = "TypedFields::is_empty")]
    pub typed: TypedFields,
}

impl MemoryRecord {
    /// Create a record with a freshly computed deterministic id
    pub fn new(user_id: impl Into<String>, content: impl Into<String>, layer: MemoryLayer) -> Self {
        let user_id = user_id.into();
        let content = content.into();
        let now = Utc::now();
        Self {
            id: memory_id(&user_id, &content, now),
            user_id,
            content,
            embedding: Vec::new(),
            layer,
            memory_type: MemoryType::default(),
            importance: 0.5,
            confidence: 0.7,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            replay_count: 0,
            tags: Vec::new(),
            persona_tags: Vec::new(),
            source: MemorySource::default(),
            metadata: Map::new(),
            typed: TypedFields::default(),
        }
    }

    /// Age in whole days since last access (used by the forgetting job)
    pub fn days_since_access(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_accessed_at).num_seconds().max(0) as f64 / 86_400.0
    }

    /// True when the maintenance forgetting job must never touch this memory
    pub fn decay_exempt(&self) -> bool {
        self.typed.identity.is_some()
            || self.typed.portfolio.is_some()
            || self.persona_tags.iter().any(|t| t == "identity")
    }
}

// ============================================================================
// DIRECT STORE INPUT
// ============================================================================

/// Pre-formatted write accepted by `POST /v1/memories/direct`.
///
/// Type-specific fields are flattened at the top level of the request; any
/// present episodic/emotional/procedural/portfolio field activates the
/// corresponding typed store. Uses `deny_unknown_fields` to prevent field
/// injection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DirectStoreInput {
    #[serde(alias = "user_id")]
    pub user_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, alias = "persona_tags")]
    pub persona_tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,

    // ---- episodic ----
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "event_timestamp")]
    pub event_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "event_type")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "emotional_valence")]
    pub emotional_valence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "emotional_arousal")]
    pub emotional_arousal: Option<f64>,

    // ---- emotional ----
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "emotional_state")]
    pub emotional_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arousal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "duration_seconds")]
    pub duration_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "trigger_event")]
    pub trigger_event: Option<String>,

    // ---- procedural ----
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "skill_name")]
    pub skill_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "proficiency_level")]
    pub proficiency_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "practice_count")]
    pub practice_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "success_rate")]
    pub success_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "difficulty_rating")]
    pub difficulty_rating: Option<f64>,
    #[serde(default)]
    pub prerequisites: Vec<String>,

    // ---- identity / portfolio ----
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<crate::memory::IdentityFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portfolio: Option<PortfolioEvent>,
}

impl DirectStoreInput {
    /// Validate domain constraints. Direct writes are strict: out-of-range
    /// values are rejected rather than clamped.
    pub fn validate(&self, config: &EngramConfig) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(EngramError::validation("user_id is required"));
        }
        if self.content.trim().is_empty() {
            return Err(EngramError::validation("content is required"));
        }
        if self.content.chars().count() > config.max_content_chars {
            return Err(EngramError::Validation(format!(
                "content exceeds {} characters",
                config.max_content_chars
            )));
        }
        if let Some(layer) = &self.layer {
            if MemoryLayer::parse_name(layer).is_none() {
                return Err(EngramError::Validation(format!("unknown layer: {layer}")));
            }
        }
        if let Some(mt) = &self.memory_type {
            if MemoryType::parse_name(mt).is_none() {
                return Err(EngramError::Validation(format!("unknown type: {mt}")));
            }
        }
        check_unit("importance", self.importance)?;
        check_unit("confidence", self.confidence)?;
        check_signed_unit("emotionalValence", self.emotional_valence)?;
        check_unit("emotionalArousal", self.emotional_arousal)?;
        check_signed_unit("valence", self.valence)?;
        check_unit("arousal", self.arousal)?;
        check_unit("dominance", self.dominance)?;
        check_unit("intensity", self.intensity)?;
        check_unit("successRate", self.success_rate)?;
        check_unit("difficultyRating", self.difficulty_rating)?;
        if let Some(d) = self.duration_seconds {
            if d < 0 {
                return Err(EngramError::validation("durationSeconds must be >= 0"));
            }
        }
        if let Some(p) = self.practice_count {
            if p < 0 {
                return Err(EngramError::validation("practiceCount must be >= 0"));
            }
        }
        if let Some(level) = &self.proficiency_level {
            if ProficiencyLevel::parse_name(level).is_none() {
                return Err(EngramError::Validation(format!(
                    "unknown proficiency level: {level}"
                )));
            }
        }
        if self.emotional_state.is_some() && (self.valence.is_none() || self.arousal.is_none()) {
            return Err(EngramError::validation(
                "emotionalState requires valence and arousal",
            ));
        }
        if let Some(portfolio) = &self.portfolio {
            let ticker_re = regex::Regex::new(TICKER_PATTERN)
                .map_err(|e| EngramError::internal(e.to_string()))?;
            if !ticker_re.is_match(&portfolio.ticker) {
                return Err(EngramError::Validation(format!(
                    "invalid ticker: {}",
                    portfolio.ticker
                )));
            }
            if portfolio.shares <= 0.0 {
                return Err(EngramError::validation("portfolio shares must be > 0"));
            }
        }
        Ok(())
    }

    /// Convert a validated input into a memory record
    pub fn into_record(self, now: DateTime<Utc>) -> MemoryRecord {
        let layer = self
            .layer
            .as_deref()
            .and_then(MemoryLayer::parse_name)
            .unwrap_or_default();
        let memory_type = self
            .memory_type
            .as_deref()
            .and_then(MemoryType::parse_name)
            // Direct writes carry user-stated content unless told otherwise
            .unwrap_or(MemoryType::Explicit);

        let typed = TypedFields {
            episodic: self.event_timestamp.map(|event_timestamp| EpisodicFields {
                event_timestamp,
                event_type: self.event_type.clone(),
                location: self.location.clone(),
                participants: self.participants.clone(),
                emotional_valence: self.emotional_valence,
                emotional_arousal: self.emotional_arousal,
                importance_score: self.importance,
            }),
            emotional: self.emotional_state.clone().map(|emotional_state| {
                EmotionalFields {
                    timestamp: Some(now),
                    emotional_state,
                    valence: self.valence.unwrap_or(0.0),
                    arousal: self.arousal.unwrap_or(0.0),
                    dominance: self.dominance,
                    intensity: self.intensity,
                    duration_seconds: self.duration_seconds,
                    trigger_event: self.trigger_event.clone(),
                }
            }),
            procedural: self.skill_name.clone().map(|skill_name| ProceduralFields {
                skill_name,
                proficiency_level: self
                    .proficiency_level
                    .as_deref()
                    .and_then(ProficiencyLevel::parse_name)
                    .unwrap_or_default(),
                practice_count: self.practice_count.unwrap_or(0),
                success_rate: self.success_rate,
                difficulty_rating: self.difficulty_rating,
                prerequisites: self.prerequisites.clone(),
            }),
            identity: self.identity.clone(),
            portfolio: self.portfolio.clone(),
        };

        MemoryRecord {
            id: memory_id(&self.user_id, &self.content, now),
            user_id: self.user_id,
            content: self.content,
            embedding: Vec::new(),
            layer,
            memory_type,
            importance: self.importance.unwrap_or(0.5),
            confidence: self.confidence.unwrap_or(0.9),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            replay_count: 0,
            tags: self.tags,
            persona_tags: self.persona_tags,
            source: MemorySource::DirectApi,
            metadata: self.metadata,
            typed,
        }
    }
}

fn check_unit(name: &str, value: Option<f64>) -> Result<()> {
    if let Some(v) = value {
        if !(0.0..=1.0).contains(&v) {
            return Err(EngramError::Validation(format!(
                "{name} must be within [0, 1], got {v}"
            )));
        }
    }
    Ok(())
}

fn check_signed_unit(name: &str, value: Option<f64>) -> Result<()> {
    if let Some(v) = value {
        if !(-1.0..=1.0).contains(&v) {
            return Err(EngramError::Validation(format!(
                "{name} must be within [-1, 1], got {v}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_input() -> DirectStoreInput {
        DirectStoreInput {
            user_id: "u1".into(),
            content: "Attended Sarah's graduation at Stanford".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_memory_id_is_deterministic_within_hour() {
        let at = Utc.with_ymd_and_hms(2025, 6, 15, 14, 3, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 6, 15, 14, 58, 0).unwrap();
        let next_hour = Utc.with_ymd_and_hms(2025, 6, 15, 15, 0, 0).unwrap();

        assert_eq!(memory_id("u1", "hello", at), memory_id("u1", "hello", later));
        assert_ne!(memory_id("u1", "hello", at), memory_id("u1", "hello", next_hour));
        assert_ne!(memory_id("u1", "hello", at), memory_id("u2", "hello", at));
        assert!(memory_id("u1", "hello", at).starts_with("mem_"));
    }

    #[test]
    fn test_validate_accepts_boundary_valence() {
        let config = EngramConfig::default();
        let mut input = base_input();
        input.emotional_state = Some("joy".into());
        input.valence = Some(1.0);
        input.arousal = Some(0.0);
        assert!(input.validate(&config).is_ok());

        input.valence = Some(-1.0);
        assert!(input.validate(&config).is_ok());

        input.valence = Some(1.01);
        assert!(input.validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_long_content() {
        let config = EngramConfig::default();
        let mut input = base_input();
        input.content = "x".repeat(5001);
        let err = input.validate(&config).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Validation);
    }

    #[test]
    fn test_validate_rejects_bad_ticker() {
        let config = EngramConfig::default();
        let mut input = base_input();
        input.portfolio = Some(PortfolioEvent {
            ticker: "nvda".into(),
            asset_name: None,
            shares: 10.0,
            price: Some(130.0),
            action: TradeAction::Buy,
        });
        assert!(input.validate(&config).is_err());

        input.portfolio.as_mut().unwrap().ticker = "NVDA".into();
        assert!(input.validate(&config).is_ok());
    }

    use crate::memory::TradeAction;

    #[test]
    fn test_into_record_builds_typed_fields() {
        let now = Utc::now();
        let mut input = base_input();
        input.layer = Some("long-term".into());
        input.event_timestamp = Some(now);
        input.location = Some("Stanford".into());
        input.participants = vec!["Sarah".into()];
        input.importance = Some(0.9);

        let record = input.into_record(now);
        assert_eq!(record.layer, MemoryLayer::LongTerm);
        assert_eq!(record.memory_type, MemoryType::Explicit);
        assert!(record.typed.episodic.is_some());
        assert!(record.typed.emotional.is_none());
        let episodic = record.typed.episodic.unwrap();
        assert_eq!(episodic.location.as_deref(), Some("Stanford"));
        assert_eq!(episodic.importance_score, Some(0.9));
    }

    #[test]
    fn test_deny_unknown_fields() {
        let json = r#"{"userId":"u1","content":"x","maliciousField":"attack"}"#;
        let parsed: std::result::Result<DirectStoreInput, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_decay_exempt() {
        let mut record = MemoryRecord::new("u1", "I value honesty", MemoryLayer::Semantic);
        assert!(!record.decay_exempt());
        record.persona_tags.push("identity".into());
        assert!(record.decay_exempt());
    }
}
