mod anthropic;
mod openai;

use std::future::Future;
use std::pin::Pin;

use foreman_common::config::{OracleRoleConfig, RetryConfig};

/// Oracle API client with provider dispatch and retry logic.
///
/// The planner, context selector, answer validator, and the built-in
/// fallback model are all thin prompts over this client.
pub struct OracleClient {
    http: reqwest::Client,
    config: OracleRoleConfig,
    retry_config: RetryConfig,
    api_key: String,
}

/// Errors from oracle API calls.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle HTTP error: {0}")]
    Http(String),

    #[error("oracle auth error: {0}")]
    Auth(String),

    #[error("oracle rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("oracle API error: {0}")]
    Api(String),

    #[error("oracle response parse error: {0}")]
    Parse(String),
}

impl OracleError {
    /// Whether this error should not be retried.
    fn is_non_retryable(&self) -> bool {
        matches!(self, OracleError::Auth(_))
    }
}

impl From<OracleError> for foreman_common::ForemanError {
    fn from(e: OracleError) -> Self {
        foreman_common::ForemanError::Oracle(e.to_string())
    }
}

impl OracleClient {
    /// Create a new oracle client for one role.
    /// Reads the API key from the appropriate env var based on provider.
    /// Returns None if the key is not set — callers degrade to their
    /// deterministic fallbacks.
    pub fn new(config: OracleRoleConfig, retry_config: RetryConfig) -> Option<Self> {
        let env_var = config.api_key_env.clone().unwrap_or_else(|| {
            match config.provider.as_str() {
                "anthropic" => "ANTHROPIC_API_KEY".to_string(),
                "openai" => "OPENAI_API_KEY".to_string(),
                other => {
                    tracing::warn!(provider = other, "Unknown oracle provider");
                    String::new()
                }
            }
        });

        if env_var.is_empty() {
            return None;
        }

        let api_key = match std::env::var(&env_var) {
            Ok(key) if !key.is_empty() => key,
            _ => {
                tracing::warn!(
                    env_var = %env_var,
                    provider = config.provider.as_str(),
                    "API key not set — oracle disabled for this role"
                );
                return None;
            }
        };

        Some(Self {
            http: reqwest::Client::new(),
            config,
            retry_config,
            api_key,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send a single-turn completion request with retry logic.
    /// Returns the assistant's text content.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String, OracleError> {
        let mut attempt = 0u32;
        let mut backoff_ms = self.retry_config.initial_backoff_ms;

        loop {
            attempt += 1;
            let result = self.send_once(system, user).await;

            match result {
                Ok(response) => return Ok(response),
                Err(ref e) if e.is_non_retryable() => {
                    metrics::counter!("oracle.api.errors", "provider" => self.config.provider.clone())
                        .increment(1);
                    return result;
                }
                Err(OracleError::RateLimited { retry_after }) => {
                    if attempt >= self.retry_config.max_attempts {
                        metrics::counter!("oracle.api.errors", "provider" => self.config.provider.clone())
                            .increment(1);
                        return Err(OracleError::RateLimited { retry_after });
                    }
                    let wait = retry_after.map(|s| s * 1000).unwrap_or(backoff_ms);
                    tracing::warn!(attempt, wait_ms = wait, "Oracle rate limited, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
                }
                Err(e) => {
                    if attempt >= self.retry_config.max_attempts {
                        metrics::counter!("oracle.api.errors", "provider" => self.config.provider.clone())
                            .increment(1);
                        return Err(e);
                    }
                    let jitter = if self.retry_config.jitter {
                        compute_jitter(attempt, backoff_ms)
                    } else {
                        0
                    };
                    let wait = backoff_ms + jitter;
                    tracing::warn!(attempt, wait_ms = wait, error = %e, "Oracle API error, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
                    backoff_ms = (backoff_ms as f64 * self.retry_config.backoff_multiplier) as u64;
                    backoff_ms = backoff_ms.min(self.retry_config.max_backoff_ms);
                }
            }
        }
    }

    /// Single attempt — routes to provider-specific implementation.
    async fn send_once(&self, system: &str, user: &str) -> Result<String, OracleError> {
        match self.config.provider.as_str() {
            "anthropic" => {
                anthropic::send_messages(
                    &self.http,
                    &self.api_key,
                    &self.config.model,
                    self.config.max_tokens,
                    self.config.temperature,
                    system,
                    user,
                )
                .await
            }
            "openai" => {
                openai::send_chat_completion(
                    &self.http,
                    &self.api_key,
                    self.config.base_url.as_deref(),
                    &self.config.model,
                    self.config.max_tokens,
                    self.config.temperature,
                    system,
                    user,
                )
                .await
            }
            other => Err(OracleError::Api(format!("Unknown provider: {}", other))),
        }
    }
}

/// Compute jitter for retry backoff using simple hash-based approach.
fn compute_jitter(attempt: u32, backoff_ms: u64) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::hash::DefaultHasher::new();
    attempt.hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        .hash(&mut hasher);
    hasher.finish() % (backoff_ms / 2 + 1)
}

/// Object-safe trait for testability (dyn dispatch).
/// Tests provide canned completions; production uses OracleClient.
pub trait OracleCaller: Send + Sync {
    fn complete<'a>(
        &'a self,
        system: &'a str,
        user: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, OracleError>> + Send + 'a>>;
}

impl OracleCaller for OracleClient {
    fn complete<'a>(
        &'a self,
        system: &'a str,
        user: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, OracleError>> + Send + 'a>> {
        Box::pin(self.complete(system, user))
    }
}

/// Strip a Markdown code fence from an oracle reply, if present.
/// Models asked for bare JSON still wrap it in ```json fences often enough
/// that every JSON-consuming port routes replies through this.
pub fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    rest.strip_suffix("```").map(str::trim).unwrap_or(trimmed)
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Fake oracle returning queued replies in order, then an error.
    pub struct FakeOracle {
        replies: Mutex<Vec<String>>,
    }

    impl FakeOracle {
        pub fn new(replies: Vec<&str>) -> Self {
            let mut replies: Vec<String> = replies.into_iter().map(String::from).collect();
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
            }
        }
    }

    impl OracleCaller for FakeOracle {
        fn complete<'a>(
            &'a self,
            _system: &'a str,
            _user: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<String, OracleError>> + Send + 'a>> {
            let next = self.replies.lock().unwrap().pop();
            Box::pin(async move {
                next.ok_or_else(|| OracleError::Api("fake oracle exhausted".into()))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence_plain() {
        assert_eq!(strip_code_fence("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_code_fence_json_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_code_fence_bare_fence() {
        assert_eq!(strip_code_fence("```\n[1, 2]\n```"), "[1, 2]");
    }
}
