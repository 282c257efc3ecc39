//! Worthiness filter.
//!
//! Short-circuits trivial turns before any model call. The LLM is consulted
//! only when the heuristics are inconclusive.

use crate::error::Result;
use crate::memory::{Turn, TurnRole};
use crate::oracle::LanguageOracle;

/// User turns at or under this token count never justify extraction
const TRIVIAL_TOKEN_LIMIT: usize = 3;

/// A combined user-turn length at or above this is conclusive on its own
const CONCLUSIVE_CHAR_LENGTH: usize = 80;

/// Acknowledgements and filler that carry no memory-worthy content
const STOP_PHRASES: &[&str] = &[
    "ok", "okay", "k", "kk", "thanks", "thank you", "thx", "ty", "lol", "haha", "cool",
    "nice", "great", "yes", "no", "yep", "nope", "sure", "got it", "sounds good", "hi",
    "hello", "hey", "bye", "goodbye", "good night", "hmm", "wow",
];

/// Worthiness decision with its provenance
#[derive(Debug, Clone)]
pub struct WorthinessOutcome {
    pub worthy: bool,
    pub reason: String,
    /// Whether the oracle was consulted (heuristics were inconclusive)
    pub consulted_oracle: bool,
}

impl WorthinessOutcome {
    fn heuristic(worthy: bool, reason: impl Into<String>) -> Self {
        Self {
            worthy,
            reason: reason.into(),
            consulted_oracle: false,
        }
    }
}

fn token_count(content: &str) -> usize {
    content.split_whitespace().count()
}

fn is_stop_phrase(content: &str) -> bool {
    let normalized: String = content
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    STOP_PHRASES.contains(&normalized.trim())
}

/// Heuristic pre-filter; `None` means inconclusive
pub fn prefilter(history: &[Turn]) -> Option<WorthinessOutcome> {
    if history.is_empty() {
        return Some(WorthinessOutcome::heuristic(false, "empty history"));
    }

    let user_turns: Vec<&Turn> = history
        .iter()
        .filter(|turn| turn.role == TurnRole::User)
        .collect();
    if user_turns.is_empty() {
        return Some(WorthinessOutcome::heuristic(false, "no user turns"));
    }

    if user_turns
        .iter()
        .all(|turn| token_count(&turn.content) <= TRIVIAL_TOKEN_LIMIT)
    {
        return Some(WorthinessOutcome::heuristic(
            false,
            "all user turns are trivial",
        ));
    }

    if user_turns.iter().all(|turn| is_stop_phrase(&turn.content)) {
        return Some(WorthinessOutcome::heuristic(false, "stop-phrase match"));
    }

    let combined_length: usize = user_turns.iter().map(|turn| turn.content.len()).sum();
    if combined_length >= CONCLUSIVE_CHAR_LENGTH {
        return Some(WorthinessOutcome::heuristic(true, "substantive length"));
    }

    None
}

/// Full worthiness assessment: heuristics first, oracle only when needed
pub async fn assess(oracle: &dyn LanguageOracle, history: &[Turn]) -> Result<WorthinessOutcome> {
    if let Some(outcome) = prefilter(history) {
        return Ok(outcome);
    }
    let verdict = oracle.worthiness(history).await?;
    Ok(WorthinessOutcome {
        worthy: verdict.worthy,
        reason: verdict.reason,
        consulted_oracle: true,
    })
}
