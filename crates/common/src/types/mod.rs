mod conversation;
mod master;
mod plan;
mod task;
mod validation;
mod worker;

pub use conversation::{ChatMessage, ChatRole};
pub use master::MasterRecord;
pub use plan::Plan;
pub use task::{Task, TaskPriority, TaskStatus};
pub use validation::ValidationVerdict;
pub use worker::{HardwareTelemetry, HealthClass, TaskKind, WorkerRecord, WorkerStatus};
