use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use metrics_exporter_prometheus::PrometheusHandle;

use foreman_common::api::chat::{ChatRequest, ControllerHealth};
use foreman_common::api::worker::{HeartbeatRequest, RegisterRequest};
use foreman_common::ids::TaskId;
use foreman_common::ForemanError;

use crate::cache::ResponseCache;
use crate::health::HealthMonitor;
use crate::leader::LeaderMonitor;
use crate::queue::TaskQueue;
use crate::registry::WorkerRegistry;
use crate::router::Router;
use crate::store::StoreClient;
use crate::tracker::PerformanceTracker;
use crate::validator::AnswerValidator;

/// Shared application state accessible from axum handlers.
pub struct AppState {
    pub router: Arc<Router>,
    pub registry: Arc<WorkerRegistry>,
    pub tracker: Arc<PerformanceTracker>,
    pub health: Arc<HealthMonitor>,
    pub cache: Arc<ResponseCache>,
    pub queue: Arc<TaskQueue>,
    pub validator: Arc<AnswerValidator>,
    pub leader: Arc<LeaderMonitor>,
    pub store: Arc<StoreClient>,
    pub metrics_handle: PrometheusHandle,
}

/// Build the controller's HTTP surface.
pub fn build_router(state: Arc<AppState>) -> AxumRouter {
    AxumRouter::new()
        .route("/chat", post(chat_handler))
        .route("/register", post(register_handler))
        .route("/heartbeat", post(heartbeat_handler))
        .route("/health", get(health_handler))
        .route("/cancel/{task_id}", post(cancel_handler))
        .route("/workers/{name}/reset", post(reset_worker_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// POST /chat — route one user request through the pipeline.
async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    match state.router.handle_chat(req).await {
        Ok(response) => (StatusCode::OK, Json(serde_json::json!(response))),
        Err(e) => error_response(e),
    }
}

/// POST /register — worker self-registration.
async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    let name = req.agent_name.clone();
    state.registry.register(req).await;
    state
        .health
        .record_heartbeat(&name, foreman_common::types::WorkerStatus::Idle);

    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "registered", "agent_name": name })),
    )
}

/// POST /heartbeat — worker liveness and telemetry.
async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    let name = req.agent_name.clone();
    let status = req.status;
    let known = state.registry.heartbeat(req).await;

    if !known {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown_agent", "agent_name": name })),
        );
    }

    state.health.record_heartbeat(&name, status);
    if status == foreman_common::types::WorkerStatus::Idle {
        // An idle worker means parked work can run now.
        state.queue.nudge();
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok" })),
    )
}

/// GET /health — controller liveness for load balancers and replicas.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();
    let report = state.health.report();

    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = ControllerHealth {
        status: if store_ok { "ok" } else { "degraded" }.to_string(),
        active_master: state.leader.active_master().await,
        is_active: state.leader.is_active(),
        workers_healthy: report.healthy + report.degraded,
    };

    (status, Json(serde_json::json!(body)))
}

/// POST /cancel/{task_id} — drop a queued task or flag a running one.
async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
) -> impl IntoResponse {
    match state.router.cancel_task(TaskId(task_id)).await {
        Ok(status) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "task_id": task_id,
                "status": status.as_db_str(),
            })),
        ),
        Err(e) => error_response(e),
    }
}

/// POST /workers/{name}/reset — operator reset: close the circuit and
/// clear the failure streak so a recovered worker can be selected again.
async fn reset_worker_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    state.tracker.reset_worker(&name);
    state.health.reset_worker(&name);
    tracing::info!(worker = %name, "Worker reset by operator");

    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "reset", "worker": name })),
    )
}

/// GET /stats — registry, tracker, cache, health, queue, and validator
/// summaries in one document.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = serde_json::json!({
        "registry": state.registry.summary(),
        "tracker": state.tracker.insights(),
        "cache": {
            "stats": state.cache.stats(),
            "popular_queries": state.cache.popular_queries(5),
        },
        "health": state.health.report(),
        "queue": state.queue.stats(),
        "validator": state.validator.stats(),
        "leader": {
            "master_id": state.leader.master_id(),
            "is_active": state.leader.is_active(),
        },
    });

    (StatusCode::OK, Json(body))
}

/// GET /metrics — Prometheus exposition.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

/// Map core errors onto the HTTP boundary.
fn error_response(e: ForemanError) -> (StatusCode, Json<serde_json::Value>) {
    let (status, kind) = match &e {
        ForemanError::NotLeader { .. } => (StatusCode::SERVICE_UNAVAILABLE, "not_leader"),
        ForemanError::QueueFull => (StatusCode::TOO_MANY_REQUESTS, "queue_full"),
        ForemanError::Cancelled(_) => (StatusCode::OK, "cancelled"),
        ForemanError::NoCapableWorker(_)
        | ForemanError::AllWorkersBusy
        | ForemanError::AllWorkersOverloaded
        | ForemanError::AllWorkersUnhealthy => {
            (StatusCode::SERVICE_UNAVAILABLE, "no_worker_available")
        }
        ForemanError::WorkerTransport(_) | ForemanError::WorkerSemantic(_) => {
            (StatusCode::BAD_GATEWAY, "worker_failure")
        }
        ForemanError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        ForemanError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_failure"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };

    let active = match &e {
        ForemanError::NotLeader { active } => active.clone(),
        _ => None,
    };

    (
        status,
        Json(serde_json::json!({
            "error": kind,
            "detail": e.to_string(),
            "active_master": active,
        })),
    )
}
