use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, TaskId};
use crate::types::{TaskKind, ValidationVerdict};

/// `POST /chat` request body — the controller's upstream boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Summaries of attached files; parsing happens upstream of the core.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileSummary>,
}

/// A pre-parsed attachment summary handed to the planner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileSummary {
    pub filename: String,
    pub summary: String,
}

/// `POST /chat` response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    pub conversation_id: ConversationId,
    /// Absent when the answer came straight from the cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub used_cache: bool,
    pub steps: Vec<TaskKind>,
    pub workers_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationVerdict>,
}

/// `GET /health` response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerHealth {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_master: Option<String>,
    /// Whether the replica answering is itself the active controller.
    pub is_active: bool,
    pub workers_healthy: usize,
}
