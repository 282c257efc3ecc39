//! Server settings from environment variables.

use std::net::SocketAddr;

/// Which provider implementations back the collaborator traits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    /// OpenAI-compatible HTTP endpoints
    #[default]
    OpenAi,
    /// Deterministic in-process stubs (offline boot, smoke tests)
    Stub,
}

/// Server-side settings (the engine has its own `EngramConfig`)
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub json_logs: bool,

    pub provider: ProviderKind,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub embedding_base_url: String,
    pub embedding_model: String,

    pub maintenance_interval_hours: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3900,
            cors_origins: vec![],
            json_logs: false,
            provider: ProviderKind::default(),
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_api_key: None,
            llm_model: "gpt-4o-mini".to_string(),
            embedding_base_url: "https://api.openai.com/v1".to_string(),
            embedding_model: "text-embedding-3-large".to_string(),
            maintenance_interval_hours: 24,
        }
    }
}

impl ServerSettings {
    /// Read `ENGRAM_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(host) = std::env::var("ENGRAM_HOST") {
            if !host.trim().is_empty() {
                settings.host = host;
            }
        }
        if let Some(port) = env_parse::<u16>("ENGRAM_PORT") {
            settings.port = port;
        }
        if let Ok(origins) = std::env::var("ENGRAM_CORS_ORIGINS") {
            settings.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(flag) = std::env::var("ENGRAM_JSON_LOGS") {
            settings.json_logs = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(provider) = std::env::var("ENGRAM_LLM_PROVIDER") {
            settings.provider = match provider.to_lowercase().as_str() {
                "stub" | "none" => ProviderKind::Stub,
                _ => ProviderKind::OpenAi,
            };
        }
        if let Ok(url) = std::env::var("ENGRAM_LLM_BASE_URL") {
            if !url.trim().is_empty() {
                settings.llm_base_url = url.trim_end_matches('/').to_string();
            }
        }
        settings.llm_api_key = std::env::var("ENGRAM_LLM_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());
        if let Ok(model) = std::env::var("ENGRAM_LLM_MODEL") {
            if !model.trim().is_empty() {
                settings.llm_model = model;
            }
        }
        if let Ok(url) = std::env::var("ENGRAM_EMBEDDING_BASE_URL") {
            if !url.trim().is_empty() {
                settings.embedding_base_url = url.trim_end_matches('/').to_string();
            }
        } else {
            settings.embedding_base_url = settings.llm_base_url.clone();
        }
        if let Ok(model) = std::env::var("ENGRAM_EMBEDDING_MODEL") {
            if !model.trim().is_empty() {
                settings.embedding_model = model;
            }
        }
        if let Some(hours) = env_parse::<u64>("ENGRAM_MAINTENANCE_INTERVAL_HOURS") {
            settings.maintenance_interval_hours = hours.max(1);
        }

        settings
    }

    /// Bind address
    pub fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
