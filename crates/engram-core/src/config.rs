//! Engine configuration.
//!
//! Environment-driven; every knob has a default that works for local
//! development. The server binary loads `.env` before calling
//! [`EngramConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

/// Canonical embedding dimension (matches the default provider model)
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 3072;

/// Score below which hybrid-retrieval results are dropped
pub const DEFAULT_SCORE_CUTOFF: f64 = 0.35;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngramConfig {
    /// Data directory for the store databases (None = platform default)
    pub data_dir: Option<PathBuf>,
    /// Embedding dimension; every persisted vector must match
    pub embedding_dimension: usize,
    /// Hybrid-retrieval score cutoff
    pub score_cutoff: f64,
    /// Default retrieval limit when the caller does not supply one
    pub retrieval_default_limit: usize,
    /// Maximum accepted content length in characters
    pub max_content_chars: usize,
    /// Streaming-orchestrator buffer bound (turns per conversation)
    pub orchestrator_buffer_limit: usize,
    /// Idle duration after which a conversation buffer is flushed
    pub orchestrator_idle_flush: Duration,
    /// TTL for per-conversation injection dedupe entries
    pub injection_dedupe_ttl: Duration,
    /// TTL for cached synthesis responses
    pub synthesis_cache_ttl: Duration,
    /// Whether synthesis (LLM) calls are allowed
    pub synthesis_enabled: bool,
    /// Whether the scheduled-intent engine serves proactive workers
    pub proactivity_enabled: bool,
    /// Deadline for LLM oracle calls
    pub llm_timeout: Duration,
    /// Deadline for store operations
    pub store_timeout: Duration,
    /// Deadline for cache operations
    pub cache_timeout: Duration,
    /// Size of the shared ingestion/maintenance worker pool
    pub worker_pool_size: usize,
    /// Claim TTL for scheduled intents
    pub intent_claim_ttl: Duration,
    /// Per-user maintenance lock TTL
    pub maintenance_lock_ttl: Duration,
}

impl Default for EngramConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            score_cutoff: DEFAULT_SCORE_CUTOFF,
            retrieval_default_limit: 10,
            max_content_chars: 5000,
            orchestrator_buffer_limit: 32,
            orchestrator_idle_flush: Duration::from_secs(2),
            injection_dedupe_ttl: Duration::from_secs(600),
            synthesis_cache_ttl: Duration::from_secs(300),
            synthesis_enabled: true,
            proactivity_enabled: true,
            llm_timeout: Duration::from_secs(180),
            store_timeout: Duration::from_secs(2),
            cache_timeout: Duration::from_millis(500),
            worker_pool_size: 8,
            intent_claim_ttl: Duration::from_secs(300),
            maintenance_lock_ttl: Duration::from_secs(300),
        }
    }
}

impl EngramConfig {
    /// Build a configuration from `ENGRAM_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(dir) = env_var("ENGRAM_DATA_DIR") {
            cfg.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(dim) = env_parse::<usize>("ENGRAM_EMBEDDING_DIMENSION") {
            cfg.embedding_dimension = dim;
        }
        if let Some(cutoff) = env_parse::<f64>("ENGRAM_SCORE_CUTOFF") {
            cfg.score_cutoff = cutoff;
        }
        if let Some(limit) = env_parse::<usize>("ENGRAM_RETRIEVAL_LIMIT") {
            cfg.retrieval_default_limit = limit.max(1);
        }
        if let Some(n) = env_parse::<usize>("ENGRAM_BUFFER_LIMIT") {
            cfg.orchestrator_buffer_limit = n.max(1);
        }
        if let Some(flag) = env_bool("ENGRAM_SYNTHESIS_ENABLED") {
            cfg.synthesis_enabled = flag;
        }
        if let Some(flag) = env_bool("ENGRAM_PROACTIVITY_ENABLED") {
            cfg.proactivity_enabled = flag;
        }
        if let Some(secs) = env_parse::<u64>("ENGRAM_LLM_TIMEOUT_SECS") {
            cfg.llm_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("ENGRAM_STORE_TIMEOUT_MS") {
            cfg.store_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("ENGRAM_CACHE_TIMEOUT_MS") {
            cfg.cache_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("ENGRAM_WORKER_POOL_SIZE") {
            cfg.worker_pool_size = n.max(1);
        }

        cfg
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_var(key).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngramConfig::default();
        assert_eq!(cfg.embedding_dimension, DEFAULT_EMBEDDING_DIMENSION);
        assert_eq!(cfg.score_cutoff, DEFAULT_SCORE_CUTOFF);
        assert_eq!(cfg.max_content_chars, 5000);
        assert_eq!(cfg.orchestrator_buffer_limit, 32);
        assert_eq!(cfg.llm_timeout, Duration::from_secs(180));
        assert_eq!(cfg.store_timeout, Duration::from_secs(2));
        assert_eq!(cfg.cache_timeout, Duration::from_millis(500));
    }
}
