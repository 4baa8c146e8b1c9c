use std::sync::Arc;

use serde::Deserialize;

use foreman_common::api::chat::FileSummary;
use foreman_common::types::{Plan, TaskKind};

use crate::oracle::{strip_code_fence, OracleCaller};

/// Phrases that mark a step output as failed. Only the first 200
/// characters are inspected.
const FAILURE_PHRASES: [&str; 7] = [
    "error",
    "failed",
    "cannot",
    "unable",
    "sorry",
    "apologize",
    "something went wrong",
];

/// Decomposes a request into 1–3 typed steps.
///
/// Defaults to a single step; multiple steps only when the request
/// explicitly combines distinct work kinds in sequence. Without an oracle,
/// or on invalid oracle output, the plan degrades to `["general"]`.
pub struct TaskPlanner {
    oracle: Option<Arc<dyn OracleCaller>>,
}

#[derive(Deserialize)]
struct PlannerReply {
    steps: Vec<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

impl TaskPlanner {
    pub fn new(oracle: Option<Arc<dyn OracleCaller>>) -> Self {
        Self { oracle }
    }

    /// Break a request into execution steps.
    pub async fn plan_task(&self, message: &str, files: &[FileSummary]) -> Plan {
        let Some(oracle) = &self.oracle else {
            return Plan::fallback();
        };

        let prompt = build_planning_prompt(message, files);
        let reply = match oracle.complete(PLANNER_SYSTEM, &prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "Planning oracle failed, using fallback plan");
                metrics::counter!("planner.fallbacks").increment(1);
                return Plan::fallback();
            }
        };

        let plan = match parse_plan(&reply) {
            Ok(plan) => plan,
            Err(detail) => {
                tracing::warn!(detail = %detail, "Invalid planner output, using fallback plan");
                metrics::counter!("planner.fallbacks").increment(1);
                return Plan::fallback();
            }
        };

        tracing::info!(
            steps = ?plan.steps,
            multi_step = plan.is_multi_step,
            reasoning = %plan.reasoning,
            "Task plan"
        );
        metrics::counter!("planner.plans", "multi_step" => plan.is_multi_step.to_string())
            .increment(1);
        plan
    }
}

/// Validate and normalize raw planner output into a plan.
fn parse_plan(reply: &str) -> Result<Plan, String> {
    let parsed: PlannerReply = serde_json::from_str(strip_code_fence(reply))
        .map_err(|e| format!("unparseable planner JSON: {}", e))?;

    let steps: Vec<TaskKind> = parsed
        .steps
        .iter()
        .filter_map(|s| TaskKind::parse(s))
        .filter(|kind| TaskKind::PLAN_KINDS.contains(kind))
        .collect();

    if steps.is_empty() {
        return Err(format!("no valid step kinds in {:?}", parsed.steps));
    }

    Ok(Plan::from_steps(
        steps,
        parsed.reasoning.unwrap_or_else(|| "oracle task planning".into()),
    ))
}

/// Inspect the first 200 characters of a step output for failure phrases.
/// A match aborts the plan and surfaces the error; used only as a fallback
/// signal on top of the worker's explicit success flag.
pub fn step_output_indicates_failure(output: &str) -> bool {
    let head: String = output.chars().take(200).collect::<String>().to_lowercase();
    FAILURE_PHRASES.iter().any(|phrase| head.contains(phrase))
}

const PLANNER_SYSTEM: &str =
    "You are a task planner for a pool of specialized workers. Respond only with valid JSON.";

fn build_planning_prompt(message: &str, files: &[FileSummary]) -> String {
    let file_context = if files.is_empty() {
        String::new()
    } else {
        let kinds: Vec<&str> = files
            .iter()
            .map(|f| f.filename.rsplit('.').next().unwrap_or("unknown"))
            .collect();
        format!(
            "\n\nFiles attached: {} files ({})",
            files.len(),
            kinds.join(", ")
        )
    };

    format!(
        r#"Understand what the user really wants to accomplish and break it into logical steps.

USER REQUEST: "{message}"{file_context}

STEP CATEGORIES:
- "coding": creating, fixing, or working with programs or code
- "documentation": writing explanatory content, reports, guides, or documents
- "analysis": researching, analyzing, comparing, or evaluating data or information
- "general": other tasks

PLANNING RULES:
1. DEFAULT to a SINGLE step; most requests need one kind of work.
2. Use multiple steps only when the user explicitly wants different kinds of work done in sequence.
3. Maximum 3 steps.

DISTINCTIONS:
- "write code and a report" -> ["coding", "documentation"]
- "analyze data and write a report" -> ["analysis", "documentation"]
- "write code to analyze X" -> ["coding"] (single step: code that does analysis)
- "explain analysis results" -> ["documentation"]

Respond with JSON:
{{"steps": ["type1", "type2"], "reasoning": "what they want to accomplish"}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::testing::FakeOracle;

    async fn plan_with(replies: Vec<&str>, message: &str) -> Plan {
        let planner = TaskPlanner::new(Some(Arc::new(FakeOracle::new(replies))));
        planner.plan_task(message, &[]).await
    }

    #[tokio::test]
    async fn test_no_oracle_falls_back_to_general() {
        let planner = TaskPlanner::new(None);
        let plan = planner.plan_task("Hello", &[]).await;
        assert_eq!(plan.steps, vec![TaskKind::General]);
        assert!(!plan.is_multi_step);
    }

    #[tokio::test]
    async fn test_single_step_plan() {
        let plan = plan_with(
            vec![r#"{"steps": ["general"], "reasoning": "greeting"}"#],
            "Hello",
        )
        .await;
        assert_eq!(plan.steps, vec![TaskKind::General]);
        assert!(!plan.is_multi_step);
    }

    #[tokio::test]
    async fn test_coding_then_documentation() {
        let plan = plan_with(
            vec![r#"{"steps": ["coding", "documentation"], "reasoning": "code plus docs"}"#],
            "Write a Python function to sort a list and document it.",
        )
        .await;
        assert_eq!(plan.steps, vec![TaskKind::Coding, TaskKind::Documentation]);
        assert!(plan.is_multi_step);
    }

    #[tokio::test]
    async fn test_unknown_step_kinds_are_filtered() {
        let plan = plan_with(
            vec![r#"{"steps": ["coding", "singing"], "reasoning": "?"}"#],
            "write and sing",
        )
        .await;
        assert_eq!(plan.steps, vec![TaskKind::Coding]);
    }

    #[tokio::test]
    async fn test_all_invalid_steps_fall_back() {
        let plan = plan_with(
            vec![r#"{"steps": ["singing"], "reasoning": "?"}"#],
            "sing",
        )
        .await;
        assert_eq!(plan.steps, vec![TaskKind::General]);
    }

    #[tokio::test]
    async fn test_image_generation_is_not_a_plan_step() {
        let plan = plan_with(
            vec![r#"{"steps": ["image_generation"], "reasoning": "?"}"#],
            "draw a sunset",
        )
        .await;
        assert_eq!(plan.steps, vec![TaskKind::General]);
    }

    #[tokio::test]
    async fn test_plan_capped_at_three_steps() {
        let plan = plan_with(
            vec![r#"{"steps": ["coding", "documentation", "analysis", "general"], "reasoning": "?"}"#],
            "do everything",
        )
        .await;
        assert_eq!(plan.steps.len(), 3);
    }

    #[tokio::test]
    async fn test_garbage_reply_falls_back() {
        let plan = plan_with(vec!["not json at all"], "Hello").await;
        assert_eq!(plan.steps, vec![TaskKind::General]);
    }

    #[tokio::test]
    async fn test_fenced_json_is_accepted() {
        let plan = plan_with(
            vec!["```json\n{\"steps\": [\"analysis\"], \"reasoning\": \"compare\"}\n```"],
            "compare these options",
        )
        .await;
        assert_eq!(plan.steps, vec![TaskKind::Analysis]);
    }

    #[test]
    fn test_failure_phrases_abort_continuation() {
        assert!(step_output_indicates_failure("Error: connection refused"));
        assert!(step_output_indicates_failure("I'm sorry, I can't do that"));
        assert!(step_output_indicates_failure("Something went wrong during parsing"));
        assert!(!step_output_indicates_failure("fn main() { println!(\"ok\"); }"));
    }

    #[test]
    fn test_failure_check_only_reads_first_200_chars() {
        let mut output = "x".repeat(200);
        output.push_str("error");
        assert!(!step_output_indicates_failure(&output));
    }
}
