use std::sync::Arc;

use serde::Deserialize;

use foreman_common::config::ContextConfig;
use foreman_common::types::ChatMessage;

use crate::oracle::{strip_code_fence, OracleCaller};

/// Messages under this many words are ambiguous enough to consult the
/// semantic oracle even without a keyword hit.
const SHORT_MESSAGE_WORDS: usize = 5;

/// How many recent turns the semantic confirmation sees.
const SEMANTIC_WINDOW: usize = 3;

/// Outcome of context selection for one request.
#[derive(Clone, Debug)]
pub struct ContextDecision {
    pub needs_context: bool,
    /// Relevant prior messages, oldest first. Empty when no context.
    pub relevant: Vec<ChatMessage>,
    pub reason: String,
}

impl ContextDecision {
    fn none(reason: impl Into<String>) -> Self {
        Self {
            needs_context: false,
            relevant: Vec::new(),
            reason: reason.into(),
        }
    }
}

/// Decides whether a request depends on prior turns and selects the
/// minimal relevant history slice.
///
/// Hybrid, two-phase: a deterministic keyword pass produces a candidate
/// verdict; a semantic oracle confirms it for candidates and for short
/// messages. Without an oracle the keyword verdict stands, making the
/// selector fully deterministic.
pub struct ContextSelector {
    oracle: Option<Arc<dyn OracleCaller>>,
    config: ContextConfig,
}

#[derive(Deserialize)]
struct SemanticReply {
    needs_context: serde_json::Value,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct NarrowingReply {
    #[serde(default)]
    relevant_message_indices: Vec<usize>,
}

impl ContextSelector {
    pub fn new(oracle: Option<Arc<dyn OracleCaller>>, config: ContextConfig) -> Self {
        Self { oracle, config }
    }

    pub fn max_messages(&self) -> usize {
        self.config.max_context_messages
    }

    /// Decide whether `message` continues the conversation, and if so
    /// which slice of `history` (oldest first) a worker needs to see.
    pub async fn select(&self, message: &str, history: &[ChatMessage]) -> ContextDecision {
        if !self.config.enable_context_engine {
            return ContextDecision::none("context engine disabled");
        }
        if history.is_empty() {
            return ContextDecision::none("no prior turns");
        }

        let keyword_hit = self.keyword_candidate(message);
        let is_short = word_count(message) < SHORT_MESSAGE_WORDS;

        let needs_context = if keyword_hit || is_short {
            match self.semantic_verdict(message, history).await {
                Some((verdict, reason)) => {
                    tracing::debug!(verdict, reason = %reason, "Semantic context verdict");
                    verdict
                }
                // No oracle: the keyword phase decides alone.
                None => keyword_hit,
            }
        } else {
            false
        };

        if !needs_context {
            metrics::counter!("context.decisions", "needs_context" => "false").increment(1);
            return ContextDecision::none("message stands alone");
        }

        let window = self.history_window(history);
        let relevant = match self.narrow(message, &window).await {
            Some(narrowed) if !narrowed.is_empty() => narrowed,
            _ => window,
        };

        metrics::counter!("context.decisions", "needs_context" => "true").increment(1);
        ContextDecision {
            needs_context: true,
            relevant,
            reason: "message references earlier turns".into(),
        }
    }

    /// Phase 1: deterministic reference-token scan.
    fn keyword_candidate(&self, message: &str) -> bool {
        let lowered = message.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        self.config
            .reference_keywords
            .iter()
            .any(|keyword| tokens.contains(&keyword.as_str()))
    }

    /// Phase 2: semantic confirmation over the last few turns.
    /// Returns None when no oracle is available or it misbehaves.
    async fn semantic_verdict(
        &self,
        message: &str,
        history: &[ChatMessage],
    ) -> Option<(bool, String)> {
        let oracle = self.oracle.as_ref()?;

        let recent: Vec<&ChatMessage> =
            history.iter().rev().take(SEMANTIC_WINDOW).rev().collect();
        let mut history_text = String::new();
        for msg in recent {
            let content: String = msg.content.chars().take(200).collect();
            history_text.push_str(&format!(
                "\n{}: {}",
                msg.role.as_db_str().to_uppercase(),
                content
            ));
        }

        let prompt = format!(
            r#"Does the current message require knowing the previous conversation to be understood?

CURRENT MESSAGE: "{message}"

RECENT CONVERSATION:{history_text}

Respond with JSON: {{"needs_context": "yes" or "no", "reason": "one line"}}"#
        );

        let reply = match oracle.complete(CONTEXT_SYSTEM, &prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "Context oracle failed, keeping keyword verdict");
                return None;
            }
        };

        let parsed: SemanticReply = serde_json::from_str(strip_code_fence(&reply)).ok()?;
        let verdict = match &parsed.needs_context {
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::String(s) => s.eq_ignore_ascii_case("yes"),
            _ => return None,
        };
        Some((
            verdict,
            parsed.reason.unwrap_or_else(|| "semantic analysis".into()),
        ))
    }

    fn history_window(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let skip = history
            .len()
            .saturating_sub(self.config.max_context_messages);
        history[skip..].to_vec()
    }

    /// Ask the oracle to narrow the window to the messages that matter for
    /// the current request; greetings and thanks get dropped here. Returns
    /// None to keep the full window.
    async fn narrow(&self, message: &str, window: &[ChatMessage]) -> Option<Vec<ChatMessage>> {
        let oracle = self.oracle.as_ref()?;

        let mut history_text = String::new();
        for (i, msg) in window.iter().enumerate() {
            let content: String = msg.content.chars().take(200).collect();
            history_text.push_str(&format!(
                "\n[{}] {}: {}",
                i,
                msg.role.as_db_str().to_uppercase(),
                content
            ));
        }

        let prompt = format!(
            r#"Select the previous messages that directly help understand the current request. Skip greetings, thanks, and unrelated chatter. At most 5 indices.

CURRENT MESSAGE: "{message}"

CONVERSATION:{history_text}

Respond with JSON: {{"relevant_message_indices": [0, 1]}}"#
        );

        let reply = oracle.complete(CONTEXT_SYSTEM, &prompt).await.ok()?;
        let parsed: NarrowingReply = serde_json::from_str(strip_code_fence(&reply)).ok()?;

        let selected: Vec<ChatMessage> = parsed
            .relevant_message_indices
            .iter()
            .filter(|&&i| i < window.len())
            .map(|&i| window[i].clone())
            .collect();
        Some(selected)
    }
}

const CONTEXT_SYSTEM: &str =
    "You analyze conversation flow for a request router. Respond only with valid JSON.";

/// Compose the prompt a worker receives. With an empty slice the prompt is
/// the bare request, so context-free routing leaks no prior turns.
pub fn compose_worker_prompt(message: &str, relevant: &[ChatMessage]) -> String {
    if relevant.is_empty() {
        return message.to_string();
    }

    let mut parts = vec!["Previous Conversation:".to_string()];
    for msg in relevant {
        parts.push(format!(
            "{}: {}",
            msg.role.as_db_str().to_uppercase(),
            msg.content
        ));
    }
    parts.push(format!("\nCurrent Request:\n{}", message));
    parts.push("\nMaintain consistency with the previous conversation.".to_string());
    parts.join("\n")
}

fn word_count(message: &str) -> usize {
    message.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::testing::FakeOracle;
    use foreman_common::types::ChatRole;

    fn history(turns: &[(&str, &str)]) -> Vec<ChatMessage> {
        turns
            .iter()
            .flat_map(|(q, a)| {
                [
                    ChatMessage::new(ChatRole::User, *q),
                    ChatMessage::new(ChatRole::Assistant, *a),
                ]
            })
            .collect()
    }

    fn selector(oracle: Option<Arc<dyn OracleCaller>>) -> ContextSelector {
        ContextSelector::new(oracle, ContextConfig::default())
    }

    #[tokio::test]
    async fn test_empty_history_never_needs_context() {
        let s = selector(None);
        let decision = s.select("continue with that", &[]).await;
        assert!(!decision.needs_context);
        assert!(decision.relevant.is_empty());
    }

    #[tokio::test]
    async fn test_keyword_only_branch_is_deterministic() {
        let s = selector(None);
        let hist = history(&[("write a sort function", "fn sort() {}")]);

        let yes = s.select("now document it properly please", &hist).await;
        assert!(yes.needs_context);
        assert_eq!(yes.relevant.len(), hist.len());

        let no = s
            .select("write a completely new parser in rust", &hist)
            .await;
        assert!(!no.needs_context);
    }

    #[tokio::test]
    async fn test_unrelated_long_message_skips_oracle() {
        // Oracle would say yes, but the keyword phase never consults it
        // for long keyword-free messages.
        let oracle = Arc::new(FakeOracle::new(vec![
            r#"{"needs_context": "yes", "reason": "should not be asked"}"#,
        ]));
        let s = selector(Some(oracle));
        let hist = history(&[("q", "a")]);

        let decision = s
            .select("please write a brand new web scraper in python", &hist)
            .await;
        assert!(!decision.needs_context);
    }

    #[tokio::test]
    async fn test_short_message_consults_oracle() {
        let oracle = Arc::new(FakeOracle::new(vec![
            r#"{"needs_context": "yes", "reason": "refers to prior work"}"#,
            r#"{"relevant_message_indices": [0, 1]}"#,
        ]));
        let s = selector(Some(oracle));
        let hist = history(&[("write a sort function", "fn sort() {}")]);

        let decision = s.select("make faster", &hist).await;
        assert!(decision.needs_context);
        assert_eq!(decision.relevant.len(), 2);
    }

    #[tokio::test]
    async fn test_oracle_overrules_keyword_candidate() {
        let oracle = Arc::new(FakeOracle::new(vec![
            r#"{"needs_context": "no", "reason": "fresh topic"}"#,
        ]));
        let s = selector(Some(oracle));
        let hist = history(&[("q", "a")]);

        let decision = s
            .select("tell me more about rust traits in general terms", &hist)
            .await;
        assert!(!decision.needs_context);
    }

    #[tokio::test]
    async fn test_narrowing_drops_unrelated_messages() {
        let oracle = Arc::new(FakeOracle::new(vec![
            r#"{"needs_context": "yes", "reason": "continuation"}"#,
            r#"{"relevant_message_indices": [2, 3]}"#,
        ]));
        let s = selector(Some(oracle));
        let hist = history(&[("hi there", "hello!"), ("write a parser", "fn parse() {}")]);

        let decision = s.select("improve it", &hist).await;
        assert!(decision.needs_context);
        assert_eq!(decision.relevant.len(), 2);
        assert_eq!(decision.relevant[0].content, "write a parser");
    }

    #[tokio::test]
    async fn test_window_respects_max_messages() {
        let mut config = ContextConfig::default();
        config.max_context_messages = 2;
        let s = ContextSelector::new(None, config);
        let hist = history(&[("one", "1"), ("two", "2"), ("three", "3")]);

        let decision = s.select("elaborate", &hist).await;
        assert!(decision.needs_context);
        assert_eq!(decision.relevant.len(), 2);
        assert_eq!(decision.relevant[0].content, "three");
    }

    #[tokio::test]
    async fn test_disabled_engine_returns_nothing() {
        let mut config = ContextConfig::default();
        config.enable_context_engine = false;
        let s = ContextSelector::new(None, config);
        let hist = history(&[("q", "a")]);

        assert!(!s.select("elaborate on that", &hist).await.needs_context);
    }

    #[test]
    fn test_prompt_without_context_has_no_prior_text() {
        let prompt = compose_worker_prompt("write tests", &[]);
        assert_eq!(prompt, "write tests");
    }

    #[test]
    fn test_prompt_with_context_has_both_blocks() {
        let hist = history(&[("write a parser", "fn parse() {}")]);
        let prompt = compose_worker_prompt("document it", &hist);
        assert!(prompt.contains("Previous Conversation:"));
        assert!(prompt.contains("Current Request:"));
        assert!(prompt.contains("fn parse() {}"));
        assert!(prompt.contains("Maintain consistency"));
    }
}
