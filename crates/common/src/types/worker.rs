use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::WorkerId;

/// The kind of work a step needs, and the capability a worker declares.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Coding,
    Documentation,
    Analysis,
    ImageGeneration,
    General,
}

impl TaskKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Documentation => "documentation",
            Self::Analysis => "analysis",
            Self::ImageGeneration => "image_generation",
            Self::General => "general",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "coding" => Some(Self::Coding),
            "documentation" => Some(Self::Documentation),
            "analysis" => Some(Self::Analysis),
            "image_generation" => Some(Self::ImageGeneration),
            "general" => Some(Self::General),
            _ => None,
        }
    }

    /// The step kinds a planner may emit. Image generation is a declared
    /// worker capability but never a plan step.
    pub const PLAN_KINDS: [TaskKind; 4] = [
        Self::Coding,
        Self::Documentation,
        Self::Analysis,
        Self::General,
    ];
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Worker process state as reported in heartbeats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    Failed,
}

impl WorkerStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Selection preference: idle before busy before failed.
    pub fn selection_rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Busy => 1,
            Self::Failed => 2,
        }
    }
}

/// Hardware telemetry carried in worker heartbeats.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct HardwareTelemetry {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// A registered worker as the registry sees it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: Option<WorkerId>,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub capability: TaskKind,
    pub status: WorkerStatus,
    pub hardware: HardwareTelemetry,
    pub last_heartbeat: DateTime<Utc>,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    /// Running mean over all completed tasks.
    pub avg_execution_time: f64,
    pub total_cost: f64,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Health classification derived by the health monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthClass {
    Healthy,
    Degraded,
    Unhealthy,
    Dead,
    Unknown,
}

impl HealthClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}
