use serde::{Deserialize, Serialize};

/// Top-level system configuration, deserialized from system.toml.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub master: MasterConfig,
    pub routing: RoutingConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub context: ContextConfig,
    pub oracle: OracleConfig,
    pub retry: RetryConfig,
}

/// Controller replica identity and failover timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Replica identity. Overridable with MASTER_ID.
    pub master_id: String,
    /// Heartbeat write period in seconds.
    pub heartbeat_interval_secs: u64,
    /// A replica whose heartbeat is older than this is out of the election.
    pub timeout_secs: u64,
    /// When false, every replica processes requests (single-node deploys).
    pub enable_failover: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            master_id: "master-1".into(),
            heartbeat_interval_secs: 5,
            timeout_secs: 15,
            enable_failover: true,
        }
    }
}

/// Worker selection and supervision parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Retry budget per task; total dispatches are bounded by max_retries + 1.
    pub max_retries: u32,
    /// Workers with no heartbeat inside this window are excluded.
    pub heartbeat_fresh_secs: u64,
    /// Workers at or above these utilization levels are skipped.
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    /// Per-step worker RPC deadline in seconds.
    pub step_timeout_secs: u64,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Cooldown before a recovered dead worker re-enters selection.
    pub dead_cooldown_secs: u64,
    /// Longer cooldown for workers with a degrading trend.
    pub degrading_cooldown_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            heartbeat_fresh_secs: 30,
            cpu_threshold: 80.0,
            memory_threshold: 90.0,
            step_timeout_secs: 120,
            failure_threshold: 3,
            dead_cooldown_secs: 300,
            degrading_cooldown_secs: 600,
        }
    }
}

/// Task queue bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// Response cache TTL and capacity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            max_entries: 1000,
        }
    }
}

/// Context selection behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub enable_context_engine: bool,
    /// Retrievable history window.
    pub max_context_messages: usize,
    /// Tokens that mark a message as referencing earlier turns.
    pub reference_keywords: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            enable_context_engine: true,
            max_context_messages: 10,
            reference_keywords: [
                "it", "that", "this", "them", "those", "above", "earlier", "previous",
                "continue", "elaborate", "more", "again", "also",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Oracle endpoints per role. The built-in fallback model reuses the
/// planner role's provider settings with the `builtin` model id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub planner: OracleRoleConfig,
    pub context: OracleRoleConfig,
    pub validator: OracleRoleConfig,
    pub builtin: OracleRoleConfig,
}

/// Configuration for a single oracle role.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleRoleConfig {
    /// Provider name ("anthropic" or "openai").
    /// Use "openai" for OpenAI-compatible providers (Groq, OpenRouter, etc.).
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Max tokens in the response.
    pub max_tokens: u32,
    /// Temperature (0.0–1.0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Base URL override for OpenAI-compatible endpoints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable name for the API key. Defaults to the
    /// provider's standard env var.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl Default for OracleRoleConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "llama-3.3-70b-versatile".into(),
            max_tokens: 800,
            temperature: Some(0.2),
            base_url: None,
            api_key_env: None,
        }
    }
}

/// Retry parameters for oracle API calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}
