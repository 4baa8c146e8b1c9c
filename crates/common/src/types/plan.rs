use serde::{Deserialize, Serialize};

use super::worker::TaskKind;

/// An ordered sequence of 1–3 step kinds derived from a single request.
/// Each step's output becomes input context for the next; the plan aborts
/// on the first failed step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<TaskKind>,
    pub is_multi_step: bool,
    pub reasoning: String,
}

impl Plan {
    pub const MAX_STEPS: usize = 3;

    pub fn single(kind: TaskKind, reasoning: impl Into<String>) -> Self {
        Self {
            steps: vec![kind],
            is_multi_step: false,
            reasoning: reasoning.into(),
        }
    }

    /// Fallback plan when no planning oracle is available or its output
    /// is invalid.
    pub fn fallback() -> Self {
        Self::single(TaskKind::General, "default single-step plan")
    }

    pub fn from_steps(steps: Vec<TaskKind>, reasoning: impl Into<String>) -> Self {
        let mut steps = steps;
        steps.truncate(Self::MAX_STEPS);
        let is_multi_step = steps.len() > 1;
        Self {
            steps,
            is_multi_step,
            reasoning: reasoning.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_steps_caps_at_three() {
        let plan = Plan::from_steps(
            vec![
                TaskKind::Coding,
                TaskKind::Documentation,
                TaskKind::Analysis,
                TaskKind::General,
            ],
            "too many",
        );
        assert_eq!(plan.steps.len(), 3);
        assert!(plan.is_multi_step);
    }

    #[test]
    fn test_single_step_is_not_multi() {
        let plan = Plan::single(TaskKind::Coding, "one thing");
        assert!(!plan.is_multi_step);
        assert_eq!(plan.steps, vec![TaskKind::Coding]);
    }
}
