//! Persona weighting.
//!
//! A persona is a weighting profile applied to retrieval scoring. The scorer
//! multiplies the blended final score by the persona factor, a weighted blend
//! of the semantic, temporal, importance and emotional signals.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Detection confidence required before an inferred persona is applied
pub const PERSONA_DETECTION_THRESHOLD: f64 = 0.8;

/// Weight profile for one persona
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaWeights {
    pub semantic: f64,
    pub temporal: f64,
    pub importance: f64,
    pub emotional: f64,
}

impl Default for PersonaWeights {
    fn default() -> Self {
        // The default persona
        Self {
            semantic: 0.4,
            temporal: 0.2,
            importance: 0.3,
            emotional: 0.1,
        }
    }
}

/// Signals the persona factor blends, each in [0, 1]
#[derive(Debug, Clone, Copy, Default)]
pub struct PersonaSignals {
    pub semantic: f64,
    pub recency: f64,
    pub importance: f64,
    pub emotional: f64,
}

impl PersonaWeights {
    /// Weighted blend of the signals
    pub fn factor(&self, signals: &PersonaSignals) -> f64 {
        self.semantic * signals.semantic
            + self.temporal * signals.recency
            + self.importance * signals.importance
            + self.emotional * signals.emotional
    }
}

/// Registry of configured personas; extensible at construction
#[derive(Debug, Clone)]
pub struct PersonaRegistry {
    weights: HashMap<String, PersonaWeights>,
}

impl Default for PersonaRegistry {
    fn default() -> Self {
        let mut weights = HashMap::new();
        weights.insert("default".to_string(), PersonaWeights::default());
        weights.insert(
            "finance".to_string(),
            PersonaWeights {
                semantic: 0.45,
                temporal: 0.35,
                importance: 0.15,
                emotional: 0.05,
            },
        );
        weights.insert(
            "health".to_string(),
            PersonaWeights {
                semantic: 0.35,
                temporal: 0.2,
                importance: 0.2,
                emotional: 0.25,
            },
        );
        weights.insert(
            "work".to_string(),
            PersonaWeights {
                semantic: 0.45,
                temporal: 0.25,
                importance: 0.25,
                emotional: 0.05,
            },
        );
        weights.insert(
            "relationships".to_string(),
            PersonaWeights {
                semantic: 0.3,
                temporal: 0.15,
                importance: 0.25,
                emotional: 0.3,
            },
        );
        Self { weights }
    }
}

impl PersonaRegistry {
    /// Weights for a persona name, falling back to the default profile
    pub fn weights_for(&self, persona: &str) -> PersonaWeights {
        self.weights
            .get(&persona.to_lowercase())
            .copied()
            .unwrap_or_default()
    }

    /// Register or replace a persona profile
    pub fn register(&mut self, persona: impl Into<String>, weights: PersonaWeights) {
        self.weights.insert(persona.into().to_lowercase(), weights);
    }

    /// Whether a persona name is configured
    pub fn contains(&self, persona: &str) -> bool {
        self.weights.contains_key(&persona.to_lowercase())
    }
}

const FINANCE_KEYWORDS: &[&str] = &[
    "stock", "stocks", "shares", "portfolio", "invest", "investment", "ticker", "dividend",
    "market", "price", "etf", "crypto", "earnings",
];

const HEALTH_KEYWORDS: &[&str] = &[
    "doctor", "health", "sleep", "workout", "exercise", "diet", "medication", "symptom",
    "therapy", "anxiety",
];

const WORK_KEYWORDS: &[&str] = &[
    "meeting", "deadline", "project", "manager", "coworker", "interview", "promotion",
    "standup", "sprint",
];

const RELATIONSHIP_KEYWORDS: &[&str] = &[
    "wife", "husband", "partner", "friend", "family", "mom", "dad", "daughter", "son",
    "anniversary",
];

/// Keyword-vote persona detection. Confidence grows with the share of
/// matched keywords; a persona is only applied above
/// [`PERSONA_DETECTION_THRESHOLD`].
pub fn detect_persona(query: &str) -> Option<(String, f64)> {
    let lower = query.to_lowercase();
    let votes = [
        ("finance", count_hits(&lower, FINANCE_KEYWORDS)),
        ("health", count_hits(&lower, HEALTH_KEYWORDS)),
        ("work", count_hits(&lower, WORK_KEYWORDS)),
        ("relationships", count_hits(&lower, RELATIONSHIP_KEYWORDS)),
    ];
    let (persona, hits) = votes.into_iter().max_by_key(|(_, hits)| *hits)?;
    if hits == 0 {
        return None;
    }
    // One hit is suggestive, two or more is conclusive
    let confidence = match hits {
        1 => 0.6,
        2 => 0.85,
        _ => 0.95,
    };
    Some((persona.to_string(), confidence))
}

fn count_hits(lower: &str, keywords: &[&str]) -> usize {
    keywords
        .iter()
        .filter(|keyword| {
            lower
                .split(|c: char| !c.is_alphanumeric())
                .any(|word| word == **keyword)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_persona_weights() {
        let weights = PersonaWeights::default();
        assert_eq!(weights.semantic, 0.4);
        assert_eq!(weights.temporal, 0.2);
        assert_eq!(weights.importance, 0.3);
        assert_eq!(weights.emotional, 0.1);
    }

    #[test]
    fn test_factor_blends_signals() {
        let weights = PersonaWeights::default();
        let factor = weights.factor(&PersonaSignals {
            semantic: 1.0,
            recency: 1.0,
            importance: 1.0,
            emotional: 1.0,
        });
        assert!((factor - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_registry_falls_back_to_default() {
        let registry = PersonaRegistry::default();
        assert!(registry.contains("finance"));
        let unknown = registry.weights_for("astrology");
        assert_eq!(unknown.semantic, PersonaWeights::default().semantic);
    }

    #[test]
    fn test_detection_requires_strong_signal() {
        let weak = detect_persona("how was my day");
        assert!(weak.is_none());

        let (persona, confidence) =
            detect_persona("how is my portfolio doing against the market").unwrap();
        assert_eq!(persona, "finance");
        assert!(confidence >= PERSONA_DETECTION_THRESHOLD);

        let (_, weak_confidence) = detect_persona("the market was busy").unwrap();
        assert!(weak_confidence < PERSONA_DETECTION_THRESHOLD);
    }
}
