use serde::{Deserialize, Serialize};

/// Top-level application configuration, loaded from `tern.toml` plus
/// environment overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub database: DatabaseConfig,
    pub limits: LimitsConfig,
    pub providers: ProviderEndpoints,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub rate_limit: RateLimitConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3990,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Per-IP request rate limit applied at the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_second: u64,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 2,
            burst_size: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub chat_path: String,
    pub memory_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            chat_path: "tern.db".to_string(),
            memory_path: "tern-memory.db".to_string(),
        }
    }
}

/// Product policy constants. These are plain configuration values, not
/// derived from any invariant; stores and orchestration take them as
/// arguments rather than hard-coding them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum stored memory facts per user; inserts beyond this are rejected.
    pub max_memory_facts: usize,
    /// Maximum characters per memory fact.
    pub max_fact_chars: usize,
    /// Maximum candidate facts the auto-memory extractor may yield per turn.
    pub auto_memory_max_facts: usize,
    /// Maximum words per auto-extracted fact.
    pub auto_memory_max_words: usize,
    /// Number of prior messages sent to the provider as history.
    pub history_window: usize,
    /// Maximum provider round-trips per chat request.
    pub max_tool_rounds: usize,
    /// Timeout for one remote tool-server call, in seconds.
    pub tool_call_timeout_secs: u64,
    /// Timeout for one search API call, in seconds.
    pub search_timeout_secs: u64,
    /// Maximum characters of a tool result relayed to the client.
    pub tool_result_event_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_memory_facts: 500,
            max_fact_chars: 1000,
            auto_memory_max_facts: 5,
            auto_memory_max_words: 15,
            history_window: 60,
            max_tool_rounds: 10,
            tool_call_timeout_secs: 10,
            search_timeout_secs: 20,
            tool_result_event_chars: 600,
        }
    }
}

/// Base URLs of the external APIs. Overridable for self-hosted gateways
/// and for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEndpoints {
    pub chat_base_url: String,
    pub search_url: String,
    pub image_base_url: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            chat_base_url: "https://api.openai.com/v1".to_string(),
            search_url: "https://api.tavily.com/search".to_string(),
            image_base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}
