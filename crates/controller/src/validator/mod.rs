use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use foreman_common::types::ValidationVerdict;

use crate::oracle::{strip_code_fence, OracleCaller};

/// Error words that condemn an answer when no oracle is available.
const ERROR_WORDS: [&str; 4] = ["error", "failed", "cannot", "unable"];

/// Minimum trimmed length for a heuristically acceptable answer.
const MIN_ANSWER_LEN: usize = 10;

/// Validates worker answers before they reach the user.
///
/// With an oracle: completeness, quality 0–10, retry recommendation, and
/// confidence. Without one: a deterministic heuristic over the first 200
/// characters and the answer length.
pub struct AnswerValidator {
    oracle: Option<Arc<dyn OracleCaller>>,
    history: Mutex<Vec<ValidationEvent>>,
}

struct ValidationEvent {
    quality: u8,
    complete: bool,
    retry: bool,
}

/// Rolling validation statistics for the stats endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct ValidationStats {
    pub total_validations: usize,
    pub avg_quality_score: f64,
    pub retry_rate: f64,
    pub completion_rate: f64,
}

#[derive(Deserialize)]
struct ValidatorReply {
    #[serde(default = "default_complete")]
    is_complete: bool,
    #[serde(default = "default_quality")]
    quality_score: f64,
    #[serde(default)]
    should_retry: bool,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_complete() -> bool {
    true
}
fn default_quality() -> f64 {
    7.0
}
fn default_confidence() -> f64 {
    0.8
}

impl AnswerValidator {
    pub fn new(oracle: Option<Arc<dyn OracleCaller>>) -> Self {
        Self {
            oracle,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Check whether a response actually answers the task.
    pub async fn validate(
        &self,
        task: &str,
        response: &str,
        worker_name: &str,
    ) -> ValidationVerdict {
        let verdict = match &self.oracle {
            Some(oracle) => match self.oracle_validation(oracle, task, response).await {
                Some(verdict) => verdict,
                None => heuristic_validation(response),
            },
            None => heuristic_validation(response),
        };

        tracing::info!(
            worker = worker_name,
            quality = verdict.quality_score,
            complete = verdict.is_complete,
            retry = verdict.should_retry,
            "Answer validated"
        );
        metrics::histogram!("validator.quality").record(verdict.quality_score as f64);
        if verdict.should_retry {
            metrics::counter!("validator.retries_recommended").increment(1);
        }

        self.history.lock().unwrap().push(ValidationEvent {
            quality: verdict.quality_score,
            complete: verdict.is_complete,
            retry: verdict.should_retry,
        });

        verdict
    }

    async fn oracle_validation(
        &self,
        oracle: &Arc<dyn OracleCaller>,
        task: &str,
        response: &str,
    ) -> Option<ValidationVerdict> {
        let prompt = build_validation_prompt(task, response);
        let reply = match oracle.complete(VALIDATOR_SYSTEM, &prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "Validator oracle failed, using heuristics");
                return None;
            }
        };

        let parsed: ValidatorReply = match serde_json::from_str(strip_code_fence(&reply)) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable validator reply, using heuristics");
                return None;
            }
        };

        Some(
            ValidationVerdict {
                is_complete: parsed.is_complete,
                quality_score: parsed.quality_score.clamp(0.0, 10.0).round() as u8,
                should_retry: parsed.should_retry,
                reasoning: parsed
                    .reasoning
                    .unwrap_or_else(|| "validation complete".into()),
                confidence: parsed.confidence,
            }
            .normalized(),
        )
    }

    pub fn stats(&self) -> ValidationStats {
        let history = self.history.lock().unwrap();
        let total = history.len();
        if total == 0 {
            return ValidationStats {
                total_validations: 0,
                avg_quality_score: 0.0,
                retry_rate: 0.0,
                completion_rate: 0.0,
            };
        }

        let quality_sum: u64 = history.iter().map(|e| e.quality as u64).sum();
        let retries = history.iter().filter(|e| e.retry).count();
        let complete = history.iter().filter(|e| e.complete).count();

        ValidationStats {
            total_validations: total,
            avg_quality_score: quality_sum as f64 / total as f64,
            retry_rate: retries as f64 / total as f64 * 100.0,
            completion_rate: complete as f64 / total as f64 * 100.0,
        }
    }
}

/// Deterministic fallback: error words in the first 200 characters or a
/// trimmed length under 10 mean quality 3 and a retry; anything else is a
/// quality 7 accept.
fn heuristic_validation(response: &str) -> ValidationVerdict {
    let head: String = response
        .chars()
        .take(200)
        .collect::<String>()
        .to_lowercase();
    let is_error = ERROR_WORDS.iter().any(|word| head.contains(word));
    let is_too_short = response.trim().len() < MIN_ANSWER_LEN;
    let should_retry = is_error || is_too_short;

    ValidationVerdict {
        is_complete: !should_retry,
        quality_score: if should_retry { 3 } else { 7 },
        should_retry,
        reasoning: if is_error {
            "response contains error language".into()
        } else if is_too_short {
            "response too short".into()
        } else {
            "heuristic validation".into()
        },
        confidence: 0.5,
    }
}

const VALIDATOR_SYSTEM: &str =
    "You are an answer quality validator. Respond only with valid JSON.";

fn build_validation_prompt(task: &str, response: &str) -> String {
    let preview: String = response.chars().take(1000).collect();
    let ellipsis = if response.chars().count() > 1000 {
        "..."
    } else {
        ""
    };

    format!(
        r#"Check whether this response properly answers the task.

ORIGINAL TASK:
"{task}"

RESPONSE RECEIVED:
"{preview}{ellipsis}"

EVALUATE:
1. Is it COMPLETE? (fully answers the task, nothing missing)
2. Quality score 0-10 (9-10 excellent, 7-8 good, 5-6 acceptable, 3-4 poor, 0-2 failed)
3. Should RETRY? (yes when quality < 6, incomplete, or errors detected)
4. Confidence 0.0-1.0 in this evaluation.

SPECIAL CASES:
- Response saying "error", "failed", "cannot": quality 2, retry true
- A greeting answering a greeting: quality 10, complete
- Code that looks broken: quality 3, retry true
- Under 50 characters for a complex task: quality 4, retry true

Respond ONLY with valid JSON:
{{"is_complete": true, "quality_score": 7, "should_retry": false, "reasoning": "brief", "confidence": 0.8}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::testing::FakeOracle;

    #[tokio::test]
    async fn test_heuristic_accepts_reasonable_answer() {
        let validator = AnswerValidator::new(None);
        let verdict = validator
            .validate("add two numbers", "def add(a, b):\n    return a + b", "w1")
            .await;
        assert!(verdict.is_complete);
        assert_eq!(verdict.quality_score, 7);
        assert!(!verdict.should_retry);
    }

    #[tokio::test]
    async fn test_heuristic_rejects_error_answer() {
        let validator = AnswerValidator::new(None);
        let verdict = validator
            .validate("explain quantum computing", "Error: unable to process request", "w1")
            .await;
        assert_eq!(verdict.quality_score, 3);
        assert!(verdict.should_retry);
        assert!(!verdict.is_complete);
    }

    #[tokio::test]
    async fn test_heuristic_rejects_too_short_answer() {
        let validator = AnswerValidator::new(None);
        let verdict = validator.validate("detailed analysis", "ok", "w1").await;
        assert_eq!(verdict.quality_score, 3);
        assert!(verdict.should_retry);
    }

    #[tokio::test]
    async fn test_error_word_past_200_chars_is_ignored() {
        let validator = AnswerValidator::new(None);
        let mut answer = "a".repeat(200);
        answer.push_str(" error");
        let verdict = validator.validate("task", &answer, "w1").await;
        assert!(!verdict.should_retry);
    }

    #[tokio::test]
    async fn test_oracle_verdict_is_clamped() {
        let oracle = Arc::new(FakeOracle::new(vec![
            r#"{"is_complete": true, "quality_score": 14, "should_retry": false, "reasoning": "great", "confidence": 1.7}"#,
        ]));
        let validator = AnswerValidator::new(Some(oracle));
        let verdict = validator.validate("task", "a fine answer indeed", "w1").await;
        assert_eq!(verdict.quality_score, 10);
        assert!((verdict.confidence - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_oracle_garbage_falls_back_to_heuristics() {
        let oracle = Arc::new(FakeOracle::new(vec!["not json"]));
        let validator = AnswerValidator::new(Some(oracle));
        let verdict = validator
            .validate("task", "a perfectly normal answer", "w1")
            .await;
        assert_eq!(verdict.quality_score, 7);
    }

    #[tokio::test]
    async fn test_stats_aggregate_verdicts() {
        let validator = AnswerValidator::new(None);
        validator.validate("t", "a good long answer here", "w1").await;
        validator.validate("t", "Error: nope", "w1").await;

        let stats = validator.stats();
        assert_eq!(stats.total_validations, 2);
        assert!((stats.avg_quality_score - 5.0).abs() < 1e-9);
        assert!((stats.retry_rate - 50.0).abs() < 1e-9);
    }
}
