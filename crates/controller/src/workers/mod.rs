use std::time::Duration;

use foreman_common::api::worker::{ExecuteRequest, ExecuteResponse, WorkerHealthResponse};
use foreman_common::types::WorkerRecord;

/// HTTP client for the worker RPC boundary.
pub struct WorkerClient {
    http: reqwest::Client,
    step_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerClientError {
    #[error("worker transport error: {0}")]
    Transport(String),

    #[error("worker deadline exceeded after {0:?}")]
    Timeout(Duration),

    #[error("worker returned HTTP {0}: {1}")]
    Status(u16, String),

    #[error("worker response parse error: {0}")]
    Parse(String),
}

impl From<WorkerClientError> for foreman_common::ForemanError {
    fn from(e: WorkerClientError) -> Self {
        match e {
            WorkerClientError::Timeout(d) => {
                foreman_common::ForemanError::Timeout(format!("worker call after {:?}", d))
            }
            other => foreman_common::ForemanError::WorkerTransport(other.to_string()),
        }
    }
}

impl WorkerClient {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            step_timeout,
        }
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    /// Dispatch one step to a worker and await its reply under the
    /// per-step deadline. A missed deadline is a worker failure.
    pub async fn execute(
        &self,
        worker: &WorkerRecord,
        request: &ExecuteRequest,
    ) -> Result<ExecuteResponse, WorkerClientError> {
        let url = format!("{}/execute", worker.base_url());
        let start = std::time::Instant::now();

        let response = self
            .http
            .post(&url)
            .timeout(self.step_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WorkerClientError::Timeout(self.step_timeout)
                } else {
                    WorkerClientError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        metrics::histogram!("worker.rpc.latency", "worker" => worker.name.clone())
            .record(start.elapsed().as_secs_f64());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerClientError::Status(status.as_u16(), body));
        }

        response
            .json::<ExecuteResponse>()
            .await
            .map_err(|e| WorkerClientError::Parse(e.to_string()))
    }

    /// Probe a worker's own health endpoint.
    pub async fn health(
        &self,
        worker: &WorkerRecord,
    ) -> Result<WorkerHealthResponse, WorkerClientError> {
        let url = format!("{}/health", worker.base_url());

        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| WorkerClientError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerClientError::Status(status.as_u16(), body));
        }

        response
            .json::<WorkerHealthResponse>()
            .await
            .map_err(|e| WorkerClientError::Parse(e.to_string()))
    }
}
