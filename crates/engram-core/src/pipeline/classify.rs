//! Classification stage.
//!
//! The canonical boundary between the model's semi-structured output and the
//! typed memory record. Clamps numeric fields to their domains, rejects
//! unknown enum values, strips disallowed PII patterns, assigns the
//! deterministic id, and preserves unknown fields in metadata.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::memory::{
    memory_id, EmotionalFields, EpisodicFields, IdentityFields, MemoryLayer, MemoryRecord,
    MemorySource, MemoryType, PortfolioEvent, ProceduralFields, ProficiencyLevel, TypedFields,
};
use crate::oracle::CandidateMemory;

/// Card-like digit runs (13-16 digits, optional separators)
const CARD_PATTERN: &str = r"\b(?:\d[ -]?){13,16}\b";
/// SSN-like triplets
const SSN_PATTERN: &str = r"\b\d{3}-\d{2}-\d{4}\b";

const REDACTION: &str = "[redacted]";

/// Why a candidate was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    EmptyContent,
    UnknownLayer(String),
    UnknownType(String),
    UnknownProficiency(String),
}

/// Outcome of classifying one extraction batch
#[derive(Debug, Default)]
pub struct ClassificationOutcome {
    pub records: Vec<MemoryRecord>,
    pub rejected: Vec<RejectReason>,
}

/// Strip credit-card-like and SSN-like sequences
pub fn strip_pii(content: &str) -> String {
    let card = regex::Regex::new(CARD_PATTERN).expect("valid card pattern");
    let ssn = regex::Regex::new(SSN_PATTERN).expect("valid ssn pattern");
    let pass = card.replace_all(content, REDACTION);
    ssn.replace_all(&pass, REDACTION).into_owned()
}

fn clamp_unit(value: Option<f64>) -> Option<f64> {
    value.map(|v| v.clamp(0.0, 1.0))
}

fn clamp_signed_unit(value: Option<f64>) -> Option<f64> {
    value.map(|v| v.clamp(-1.0, 1.0))
}

fn get_f64(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key).and_then(Value::as_f64)
}

fn get_str(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_string_list(map: &Map<String, Value>, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn get_ts(map: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    map.get(key)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Convert typed_fields from the model into typed projections, clamping
/// domains. Returns Err only for unknown enum values (candidate rejected);
/// recognized keys are consumed, everything else is left for metadata.
fn typed_from_map(
    map: &Map<String, Value>,
    now: DateTime<Utc>,
) -> std::result::Result<(TypedFields, Map<String, Value>), RejectReason> {
    let mut leftovers = map.clone();

    let episodic = get_ts(map, "eventTimestamp")
        .or_else(|| get_ts(map, "event_timestamp"))
        .map(|event_timestamp| {
            for key in [
                "eventTimestamp",
                "event_timestamp",
                "eventType",
                "location",
                "participants",
                "emotionalValence",
                "emotionalArousal",
                "importanceScore",
            ] {
                leftovers.remove(key);
            }
            EpisodicFields {
                event_timestamp,
                event_type: get_str(map, "eventType").or_else(|| get_str(map, "event_type")),
                location: get_str(map, "location"),
                participants: get_string_list(map, "participants"),
                emotional_valence: clamp_signed_unit(get_f64(map, "emotionalValence")),
                emotional_arousal: clamp_unit(get_f64(map, "emotionalArousal")),
                importance_score: clamp_unit(get_f64(map, "importanceScore")),
            }
        });

    let emotional = get_str(map, "emotionalState")
        .or_else(|| get_str(map, "emotional_state"))
        .map(|emotional_state| {
            for key in [
                "emotionalState",
                "emotional_state",
                "valence",
                "arousal",
                "dominance",
                "intensity",
                "durationSeconds",
                "triggerEvent",
            ] {
                leftovers.remove(key);
            }
            EmotionalFields {
                timestamp: Some(now),
                emotional_state,
                valence: clamp_signed_unit(get_f64(map, "valence")).unwrap_or(0.0),
                arousal: clamp_unit(get_f64(map, "arousal")).unwrap_or(0.0),
                dominance: clamp_unit(get_f64(map, "dominance")),
                intensity: clamp_unit(get_f64(map, "intensity")),
                duration_seconds: map
                    .get("durationSeconds")
                    .and_then(Value::as_i64)
                    .map(|d| d.max(0)),
                trigger_event: get_str(map, "triggerEvent"),
            }
        });

    let procedural = match get_str(map, "skillName").or_else(|| get_str(map, "skill_name")) {
        Some(skill_name) => {
            let level = match get_str(map, "proficiencyLevel") {
                Some(raw) => match ProficiencyLevel::parse_name(&raw) {
                    Some(level) => level,
                    None => return Err(RejectReason::UnknownProficiency(raw)),
                },
                None => ProficiencyLevel::default(),
            };
            for key in [
                "skillName",
                "skill_name",
                "proficiencyLevel",
                "practiceCount",
                "successRate",
                "difficultyRating",
                "prerequisites",
            ] {
                leftovers.remove(key);
            }
            Some(ProceduralFields {
                skill_name,
                proficiency_level: level,
                practice_count: map
                    .get("practiceCount")
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
                    .max(0),
                success_rate: clamp_unit(get_f64(map, "successRate")),
                difficulty_rating: clamp_unit(get_f64(map, "difficultyRating")),
                prerequisites: get_string_list(map, "prerequisites"),
            })
        }
        None => None,
    };

    let identity = map.get("identity").and_then(|value| {
        leftovers.remove("identity");
        serde_json::from_value::<IdentityFields>(value.clone()).ok()
    });

    let portfolio = map.get("portfolio").and_then(|value| {
        leftovers.remove("portfolio");
        serde_json::from_value::<PortfolioEvent>(value.clone())
            .ok()
            .filter(|event| {
                event.shares > 0.0
                    && event.ticker.len() <= 5
                    && !event.ticker.is_empty()
                    && event.ticker.chars().all(|c| c.is_ascii_uppercase())
            })
    });

    Ok((
        TypedFields {
            episodic,
            emotional,
            procedural,
            identity,
            portfolio,
        },
        leftovers,
    ))
}

/// Classify one candidate into a typed record
pub fn classify_candidate(
    user_id: &str,
    candidate: &CandidateMemory,
    source: MemorySource,
    now: DateTime<Utc>,
) -> std::result::Result<MemoryRecord, RejectReason> {
    let content = strip_pii(candidate.content.trim());
    if content.is_empty() {
        return Err(RejectReason::EmptyContent);
    }

    let layer = match &candidate.layer {
        Some(raw) => {
            MemoryLayer::parse_name(raw).ok_or_else(|| RejectReason::UnknownLayer(raw.clone()))?
        }
        None => MemoryLayer::Semantic,
    };
    let memory_type = match &candidate.memory_type {
        Some(raw) => {
            MemoryType::parse_name(raw).ok_or_else(|| RejectReason::UnknownType(raw.clone()))?
        }
        None => MemoryType::Implicit,
    };

    let (typed, typed_leftovers) = typed_from_map(&candidate.typed_fields, now)?;

    let mut metadata = Map::new();
    for (key, value) in &candidate.extra {
        metadata.insert(key.clone(), value.clone());
    }
    if !typed_leftovers.is_empty() {
        metadata.insert("unrecognized_typed_fields".into(), Value::Object(typed_leftovers));
    }

    Ok(MemoryRecord {
        id: memory_id(user_id, &content, now),
        user_id: user_id.to_string(),
        content,
        embedding: Vec::new(),
        layer,
        memory_type,
        importance: candidate.importance.unwrap_or(0.5).clamp(0.0, 1.0),
        confidence: candidate.confidence.unwrap_or(0.7).clamp(0.0, 1.0),
        created_at: now,
        last_accessed_at: now,
        access_count: 0,
        replay_count: 0,
        tags: candidate.tags.clone(),
        persona_tags: candidate.persona_tags.clone(),
        source,
        metadata,
        typed,
    })
}

/// Classify a full extraction batch
pub fn classify_batch(
    user_id: &str,
    candidates: &[CandidateMemory],
    source: MemorySource,
    now: DateTime<Utc>,
) -> ClassificationOutcome {
    let mut outcome = ClassificationOutcome::default();
    for candidate in candidates {
        match classify_candidate(user_id, candidate, source, now) {
            Ok(record) => outcome.records.push(record),
            Err(reason) => {
                tracing::debug!("rejected candidate: {reason:?}");
                outcome.rejected.push(reason);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(content: &str) -> CandidateMemory {
        CandidateMemory {
            content: content.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_pii_stripping() {
        let cleaned = strip_pii("my card is 4111 1111 1111 1111 and ssn 123-45-6789 ok");
        assert!(!cleaned.contains("4111"));
        assert!(!cleaned.contains("123-45-6789"));
        assert!(cleaned.contains("[redacted]"));
        assert!(cleaned.ends_with("ok"));
    }

    #[test]
    fn test_unknown_layer_is_rejected() {
        let mut c = candidate("user prefers tea");
        c.layer = Some("subconscious".into());
        let outcome = classify_batch("u1", &[c], MemorySource::StorePipeline, Utc::now());
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.rejected.len(), 1);
        assert!(matches!(outcome.rejected[0], RejectReason::UnknownLayer(_)));
    }

    #[test]
    fn test_numeric_fields_are_clamped() {
        let mut c = candidate("felt fantastic after the marathon");
        c.importance = Some(3.5);
        c.confidence = Some(-0.2);
        c.typed_fields.insert("emotionalState".into(), "elated".into());
        c.typed_fields.insert("valence".into(), serde_json::json!(2.0));
        c.typed_fields.insert("arousal".into(), serde_json::json!(1.8));

        let record = classify_candidate("u1", &c, MemorySource::StorePipeline, Utc::now()).unwrap();
        assert_eq!(record.importance, 1.0);
        assert_eq!(record.confidence, 0.0);
        let emotional = record.typed.emotional.unwrap();
        assert_eq!(emotional.valence, 1.0);
        assert_eq!(emotional.arousal, 1.0);
    }

    #[test]
    fn test_unknown_fields_preserved_in_metadata() {
        let json = serde_json::json!({
            "content": "learned to kayak",
            "layer": "procedural",
            "novelty": 0.9,
            "typedFields": { "skillName": "kayaking", "mystery": true }
        });
        let c: CandidateMemory = serde_json::from_value(json).unwrap();
        let record = classify_candidate("u1", &c, MemorySource::StorePipeline, Utc::now()).unwrap();

        assert_eq!(record.typed.procedural.as_ref().unwrap().skill_name, "kayaking");
        assert_eq!(record.metadata.get("novelty"), Some(&serde_json::json!(0.9)));
        let leftovers = record
            .metadata
            .get("unrecognized_typed_fields")
            .and_then(Value::as_object)
            .unwrap();
        assert_eq!(leftovers.get("mystery"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_deterministic_id_assignment() {
        let now = Utc::now();
        let a = classify_candidate("u1", &candidate("likes tea"), MemorySource::StorePipeline, now)
            .unwrap();
        let b = classify_candidate("u1", &candidate("likes tea"), MemorySource::StorePipeline, now)
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_bad_portfolio_ticker_is_dropped_not_fatal() {
        let mut c = candidate("bought some nvidia");
        c.typed_fields.insert(
            "portfolio".into(),
            serde_json::json!({"ticker": "nvidia", "shares": 10.0, "action": "buy"}),
        );
        let record = classify_candidate("u1", &c, MemorySource::StorePipeline, Utc::now()).unwrap();
        assert!(record.typed.portfolio.is_none());
    }
}
