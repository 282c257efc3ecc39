//! Enrichment stage.
//!
//! Lexicon sentiment for emotional fields, persona-tag inference (auto
//! persona plus at most ten tags), and portfolio-entity extraction with
//! ticker normalization.

use serde_json::Value;

use crate::memory::MemoryRecord;

/// Cap on persona tags after inference
const MAX_PERSONA_TAGS: usize = 10;

/// Sentiment strong enough to backfill emotional valence
const VALENCE_BACKFILL_THRESHOLD: f64 = 0.3;

const POSITIVE_WORDS: &[&str] = &[
    "great", "love", "loved", "excited", "happy", "amazing", "wonderful", "fantastic",
    "proud", "glad", "pleased", "excellent", "perfect", "enjoyed", "thrilled", "success",
    "celebrated", "beautiful", "grateful", "relieved",
];

const NEGATIVE_WORDS: &[&str] = &[
    "frustrated", "worried", "anxious", "sad", "angry", "terrible", "awful", "hate",
    "stressed", "scared", "failed", "failure", "lost", "broken", "hurt", "sick",
    "exhausted", "disappointed", "grief", "afraid",
];

const NEGATIONS: &[&str] = &["not", "no", "never", "without"];

/// Persona keyword vocabulary (fixed but extensible)
const PERSONA_LEXICON: &[(&str, &[&str])] = &[
    (
        "finance",
        &[
            "stock", "stocks", "shares", "bought", "sold", "portfolio", "invest", "market",
            "dividend", "crypto", "savings", "budget",
        ],
    ),
    (
        "health",
        &[
            "doctor", "gym", "workout", "run", "running", "sleep", "diet", "medication",
            "therapy", "anxious", "anxiety", "sick",
        ],
    ),
    (
        "work",
        &[
            "meeting", "deadline", "project", "manager", "promotion", "interview", "sprint",
            "launch", "coworker", "client",
        ],
    ),
    (
        "family",
        &[
            "wife", "husband", "partner", "mom", "dad", "daughter", "son", "sister", "brother",
            "family", "graduation", "wedding",
        ],
    ),
    (
        "learning",
        &[
            "learned", "learning", "course", "class", "studied", "practice", "practicing",
            "skill", "book", "tutorial",
        ],
    ),
];

// ============================================================================
// SENTIMENT
// ============================================================================

/// Keyword-lexicon valence in [-1, 1] with a two-word negation lookback.
/// Intentionally rough; it seeds emotional fields, it does not replace a
/// sentiment model.
pub fn infer_valence(content: &str) -> f64 {
    let lower = content.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut score = 0.0f64;
    for (i, word) in words.iter().enumerate() {
        let negated = (i > 0 && NEGATIONS.contains(&words[i - 1]))
            || (i > 1 && NEGATIONS.contains(&words[i - 2]));

        if POSITIVE_WORDS.contains(word) {
            score += if negated { -0.1 } else { 0.2 };
        } else if NEGATIVE_WORDS.contains(word) {
            score += if negated { 0.1 } else { -0.2 };
        }
    }

    let exclamations = content.chars().filter(|&c| c == '!').count() as f64;
    score += (exclamations * 0.05).min(0.15) * score.signum();

    score.clamp(-1.0, 1.0)
}

/// Sentiment magnitude in [0, 1]
pub fn infer_magnitude(content: &str) -> f64 {
    infer_valence(content).abs()
}

// ============================================================================
// PERSONA INFERENCE
// ============================================================================

/// Infer persona tags from content; returns (auto persona, tags)
pub fn infer_personas(content: &str) -> (Option<String>, Vec<String>) {
    let lower = content.to_lowercase();
    let mut scored: Vec<(&str, usize)> = PERSONA_LEXICON
        .iter()
        .map(|(persona, keywords)| {
            let hits = keywords
                .iter()
                .filter(|keyword| {
                    lower
                        .split(|c: char| !c.is_alphanumeric())
                        .any(|word| word == **keyword)
                })
                .count();
            (*persona, hits)
        })
        .filter(|(_, hits)| *hits > 0)
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1));

    let auto = scored.first().map(|(persona, _)| persona.to_string());
    let tags = scored
        .into_iter()
        .map(|(persona, _)| persona.to_string())
        .collect();
    (auto, tags)
}

// ============================================================================
// TICKERS
// ============================================================================

/// Extract normalized tickers: `$NVDA` style always counts; bare all-caps
/// tokens count only in a trading context. Anything outside `[A-Z]{1,5}` is
/// rejected.
pub fn extract_tickers(content: &str) -> Vec<String> {
    let trading_context = {
        let lower = content.to_lowercase();
        ["bought", "sold", "buy", "sell", "shares", "stock", "position"]
            .iter()
            .any(|kw| lower.contains(kw))
    };

    let mut tickers = Vec::new();
    for token in content.split_whitespace() {
        let trimmed = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '$');
        let (candidate, dollar) = match trimmed.strip_prefix('$') {
            Some(stripped) => (stripped, true),
            None => (trimmed, false),
        };
        let valid = (1..=5).contains(&candidate.len())
            && candidate.chars().all(|c| c.is_ascii_uppercase());
        if !valid {
            continue;
        }
        // Bare tokens like "I" or "OK" only count with trading context and
        // at least two letters
        if !dollar && (!trading_context || candidate.len() < 2) {
            continue;
        }
        let ticker = candidate.to_string();
        if !tickers.contains(&ticker) {
            tickers.push(ticker);
        }
    }
    tickers
}

// ============================================================================
// RECORD ENRICHMENT
// ============================================================================

/// Enrich a classified record in place
pub fn enrich(record: &mut MemoryRecord) {
    let valence = infer_valence(&record.content);
    let magnitude = valence.abs();

    // Backfill emotional signal onto typed fields that lack one
    if let Some(emotional) = &mut record.typed.emotional {
        if emotional.intensity.is_none() {
            emotional.intensity = Some(magnitude);
        }
    }
    if let Some(episodic) = &mut record.typed.episodic {
        if episodic.emotional_valence.is_none() && magnitude >= VALENCE_BACKFILL_THRESHOLD {
            episodic.emotional_valence = Some(valence);
            episodic.emotional_arousal.get_or_insert(magnitude);
        }
    }
    if magnitude > 0.0 {
        record.metadata.insert(
            "sentiment".into(),
            serde_json::json!({ "valence": valence, "magnitude": magnitude }),
        );
    }

    // Persona inference: auto persona plus capped tag set
    let (auto_persona, inferred) = infer_personas(&record.content);
    for tag in inferred {
        if !record.persona_tags.contains(&tag) {
            record.persona_tags.push(tag);
        }
    }
    record.persona_tags.truncate(MAX_PERSONA_TAGS);
    if let Some(persona) = auto_persona {
        record
            .metadata
            .insert("auto_persona".into(), Value::String(persona));
    }

    // Portfolio-entity extraction
    let tickers = extract_tickers(&record.content);
    if !tickers.is_empty() {
        record
            .metadata
            .insert("tickers".into(), serde_json::json!(tickers));
    }
}
