use serde::{Deserialize, Serialize};

use crate::types::{HardwareTelemetry, TaskKind, WorkerStatus};

/// `POST {controller}/register` — worker self-registration on startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub agent_name: String,
    pub capability: TaskKind,
    pub host: String,
    pub port: u16,
}

/// `POST {controller}/heartbeat` — periodic liveness + telemetry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_name: String,
    pub status: WorkerStatus,
    #[serde(default)]
    pub hardware: HardwareTelemetry,
}

/// `POST {worker}/execute` — dispatch one step to a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub task_id: i64,
    pub task_desc: String,
    pub task_type: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// `POST {worker}/execute` response.
///
/// `success` is the authoritative outcome signal; error-phrase sniffing on
/// `output` is a fallback for legacy workers only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub success: bool,
    pub output: String,
    /// Seconds as measured by the worker.
    pub execution_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// `GET {worker}/health` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerHealthResponse {
    pub status: WorkerStatus,
    pub cpu: f64,
    pub memory: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}
