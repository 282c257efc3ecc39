//! Typed projections attached to a memory record.
//!
//! When a memory carries type-specific fields it is additionally written to
//! the specialized store for that type; the write plan is derived from which
//! of these projections are present.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// EPISODIC
// ============================================================================

/// Event-memory projection (routed to the episodic hypertable)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodicFields {
    /// When the event happened
    pub event_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    /// -1.0 (negative) to 1.0 (positive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotional_valence: Option<f64>,
    /// 0.0 to 1.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotional_arousal: Option<f64>,
    /// 0.0 to 1.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance_score: Option<f64>,
}

// ============================================================================
// EMOTIONAL
// ============================================================================

/// Emotional-state projection (routed to the emotional hypertable)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionalFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub emotional_state: String,
    /// -1.0 to 1.0
    pub valence: f64,
    /// 0.0 to 1.0
    pub arousal: f64,
    /// 0.0 to 1.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominance: Option<f64>,
    /// 0.0 to 1.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
    /// Seconds, >= 0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<String>,
}

// ============================================================================
// PROCEDURAL
// ============================================================================

/// Skill proficiency ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProficiencyLevel {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
    Expert,
    Master,
}

impl ProficiencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProficiencyLevel::Beginner => "beginner",
            ProficiencyLevel::Intermediate => "intermediate",
            ProficiencyLevel::Advanced => "advanced",
            ProficiencyLevel::Expert => "expert",
            ProficiencyLevel::Master => "master",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "beginner" => Some(ProficiencyLevel::Beginner),
            "intermediate" => Some(ProficiencyLevel::Intermediate),
            "advanced" => Some(ProficiencyLevel::Advanced),
            "expert" => Some(ProficiencyLevel::Expert),
            "master" => Some(ProficiencyLevel::Master),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProficiencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Skill projection (routed to the relational procedural table)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProceduralFields {
    pub skill_name: String,
    #[serde(default)]
    pub proficiency_level: ProficiencyLevel,
    /// >= 0
    #[serde(default)]
    pub practice_count: i64,
    /// 0.0 to 1.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    /// 0.0 to 1.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty_rating: Option<f64>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

// ============================================================================
// IDENTITY
// ============================================================================

/// Identity projection — one row per user, merged on write
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityFields {
    #[serde(default)]
    pub core_values: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_concept: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ideal_self: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feared_self: Option<String>,
    #[serde(default)]
    pub life_roles: Vec<String>,
    #[serde(default)]
    pub personality_traits: Vec<String>,
    #[serde(default)]
    pub growth_edges: Vec<String>,
    #[serde(default)]
    pub contradictions: Vec<String>,
}

// ============================================================================
// PORTFOLIO
// ============================================================================

/// Direction of a portfolio transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    #[default]
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" => Some(TradeAction::Buy),
            "sell" => Some(TradeAction::Sell),
            _ => None,
        }
    }
}

/// Portfolio projection: one ledger event appended to the transactions log
/// and folded into the holdings view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioEvent {
    /// Uppercase ticker, 1-5 letters
    pub ticker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "asset_name")]
    pub asset_name: Option<String>,
    pub shares: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default)]
    pub action: TradeAction,
}

// ============================================================================
// BUNDLE
// ============================================================================

/// All typed projections a memory may carry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episodic: Option<EpisodicFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotional: Option<EmotionalFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedural: Option<ProceduralFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portfolio: Option<PortfolioEvent>,
}

impl TypedFields {
    /// True when no projection is present
    pub fn is_empty(&self) -> bool {
        self.episodic.is_none()
            && self.emotional.is_none()
            && self.procedural.is_none()
            && self.identity.is_none()
            && self.portfolio.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proficiency_roundtrip() {
        for level in [
            ProficiencyLevel::Beginner,
            ProficiencyLevel::Intermediate,
            ProficiencyLevel::Advanced,
            ProficiencyLevel::Expert,
            ProficiencyLevel::Master,
        ] {
            assert_eq!(ProficiencyLevel::parse_name(level.as_str()), Some(level));
        }
        assert_eq!(ProficiencyLevel::parse_name("grandmaster"), None);
    }

    #[test]
    fn test_typed_fields_empty() {
        assert!(TypedFields::default().is_empty());
        let typed = TypedFields {
            procedural: Some(ProceduralFields {
                skill_name: "rust".into(),
                proficiency_level: ProficiencyLevel::Advanced,
                practice_count: 10,
                success_rate: None,
                difficulty_rating: None,
                prerequisites: vec![],
            }),
            ..Default::default()
        };
        assert!(!typed.is_empty());
    }
}
