use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, TaskId};

use super::worker::TaskKind;

/// Task lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Assigned,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "assigned" => Some(Self::Assigned),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses a task may hold immediately before moving to `next`.
    /// Progress is monotonic; a terminal task never rewinds (retries create
    /// a new attempt instead). `Failed -> Queued` is the one re-entry
    /// allowed while retryable attempts remain.
    pub fn allowed_predecessors(next: TaskStatus) -> &'static [TaskStatus] {
        match next {
            Self::Pending => &[],
            Self::Queued => &[Self::Pending, Self::Failed],
            Self::Assigned => &[Self::Pending, Self::Queued],
            Self::Processing => &[Self::Assigned],
            Self::Completed => &[Self::Processing],
            Self::Failed => &[Self::Assigned, Self::Processing, Self::Pending, Self::Queued],
            Self::Cancelled => &[Self::Pending, Self::Queued, Self::Processing],
        }
    }
}

/// Queue priority. Lower value drains first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    pub fn as_db_int(&self) -> i16 {
        match self {
            Self::Critical => 1,
            Self::High => 2,
            Self::Normal => 3,
            Self::Low => 4,
        }
    }

    pub fn from_db_int(p: i16) -> Self {
        match p {
            1 => Self::Critical,
            2 => Self::High,
            4 => Self::Low,
            _ => Self::Normal,
        }
    }
}

/// A tracked unit of user work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub description: String,
    pub task_type: TaskKind,
    pub priority: TaskPriority,
    pub retry_count: u32,
    pub status: TaskStatus,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_do_not_precede_progress() {
        for next in [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Assigned,
            TaskStatus::Processing,
        ] {
            let allowed = TaskStatus::allowed_predecessors(next);
            assert!(!allowed.contains(&TaskStatus::Completed));
            assert!(!allowed.contains(&TaskStatus::Cancelled));
            // Failed may re-enter the queue only.
            if next != TaskStatus::Queued {
                assert!(!allowed.contains(&TaskStatus::Failed));
            }
        }
    }

    #[test]
    fn test_priority_ordering_drains_critical_first() {
        assert!(TaskPriority::Critical < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Normal);
        assert!(TaskPriority::Normal < TaskPriority::Low);
    }

    #[test]
    fn test_priority_db_roundtrip() {
        for p in [
            TaskPriority::Critical,
            TaskPriority::High,
            TaskPriority::Normal,
            TaskPriority::Low,
        ] {
            assert_eq!(TaskPriority::from_db_int(p.as_db_int()), p);
        }
    }
}
