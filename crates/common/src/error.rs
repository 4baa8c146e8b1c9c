use thiserror::Error;

/// Top-level error type for Foreman operations.
#[derive(Debug, Error)]
pub enum ForemanError {
    // --- Routing errors (recovered locally or translated to queueing) ---
    #[error("this replica is not the active controller")]
    NotLeader { active: Option<String> },

    #[error("no worker declares capability for '{0}'")]
    NoCapableWorker(String),

    #[error("all capable workers are busy")]
    AllWorkersBusy,

    #[error("all capable workers are over hardware thresholds")]
    AllWorkersOverloaded,

    #[error("all capable workers are unhealthy")]
    AllWorkersUnhealthy,

    #[error("worker transport error: {0}")]
    WorkerTransport(String),

    #[error("worker returned a failing answer: {0}")]
    WorkerSemantic(String),

    #[error("planner returned an invalid plan: {0}")]
    PlanInvalid(String),

    #[error("task queue is full")]
    QueueFull,

    #[error("task {0} was cancelled")]
    Cancelled(i64),

    // --- Dependency errors ---
    #[error("store error: {0}")]
    Store(String),

    #[error("oracle error: {0}")]
    Oracle(String),

    // --- Operational errors ---
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl ForemanError {
    /// Whether this error translates to queueing the task rather than
    /// failing the request (quota/capacity conditions, §7 policy).
    pub fn is_queueable(&self) -> bool {
        matches!(
            self,
            Self::NoCapableWorker(_)
                | Self::AllWorkersBusy
                | Self::AllWorkersOverloaded
                | Self::AllWorkersUnhealthy
        )
    }

    /// Whether this error is recoverable by retrying with another worker.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkerTransport(_) | Self::WorkerSemantic(_) | Self::Timeout(_)
        )
    }

    /// Whether this error is fatal for the current task (persistent-store
    /// write failure on the critical path).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Result type alias for Foreman operations.
pub type Result<T> = std::result::Result<T, ForemanError>;
