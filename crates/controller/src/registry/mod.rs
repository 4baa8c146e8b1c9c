use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use foreman_common::api::worker::{HeartbeatRequest, RegisterRequest};
use foreman_common::types::{TaskKind, WorkerRecord, WorkerStatus};

use crate::store::StoreClient;

/// Live view of registered workers: capability, load, hardware telemetry,
/// heartbeat age. The in-memory map is authoritative for selection; rows
/// are written through to the store so restarts keep counters.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, TrackedWorker>>,
    store: Option<Arc<StoreClient>>,
    fresh_window: Duration,
}

struct TrackedWorker {
    record: WorkerRecord,
    /// Monotonic clock for freshness checks; the record keeps wall time
    /// for reporting. None until the first heartbeat this process saw.
    heartbeat_at: Option<Instant>,
}

impl TrackedWorker {
    fn is_fresh(&self, window: Duration) -> bool {
        self.heartbeat_at
            .is_some_and(|at| at.elapsed() < window)
    }
}

/// Registry observability snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct RegistrySummary {
    pub total_workers: usize,
    pub live_workers: usize,
    pub idle: usize,
    pub busy: usize,
    pub workers: Vec<WorkerRecord>,
}

impl WorkerRegistry {
    pub fn new(store: Option<Arc<StoreClient>>, fresh_window: Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            store,
            fresh_window,
        }
    }

    /// Restore known workers from the store on boot. Their heartbeats are
    /// considered stale until they report in again.
    pub async fn load_from_store(&self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.get_agents().await {
            Ok(records) => {
                let count = records.len();
                let mut workers = self.workers.write().unwrap();
                for record in records {
                    workers.insert(
                        record.name.clone(),
                        TrackedWorker {
                            record,
                            // Excluded from selection until it reports in.
                            heartbeat_at: None,
                        },
                    );
                }
                tracing::info!(count, "Restored workers from store");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to restore workers from store");
            }
        }
    }

    /// Register a worker. Idempotent by name: re-registration refreshes
    /// host/port/capability and keeps historical counters.
    pub async fn register(&self, req: RegisterRequest) {
        let now = Instant::now();
        {
            let mut workers = self.workers.write().unwrap();
            match workers.get_mut(&req.agent_name) {
                Some(tracked) => {
                    tracked.record.host = req.host.clone();
                    tracked.record.port = req.port;
                    tracked.record.capability = req.capability;
                    tracked.record.status = WorkerStatus::Idle;
                    tracked.record.last_heartbeat = Utc::now();
                    tracked.heartbeat_at = Some(now);
                    tracing::info!(worker = %req.agent_name, "Worker re-registered");
                }
                None => {
                    workers.insert(
                        req.agent_name.clone(),
                        TrackedWorker {
                            record: WorkerRecord {
                                id: None,
                                name: req.agent_name.clone(),
                                host: req.host.clone(),
                                port: req.port,
                                capability: req.capability,
                                status: WorkerStatus::Idle,
                                hardware: Default::default(),
                                last_heartbeat: Utc::now(),
                                total_tasks: 0,
                                successful_tasks: 0,
                                failed_tasks: 0,
                                avg_execution_time: 0.0,
                                total_cost: 0.0,
                                registered_at: Utc::now(),
                            },
                            heartbeat_at: Some(now),
                        },
                    );
                    tracing::info!(
                        worker = %req.agent_name,
                        capability = %req.capability,
                        "Worker registered"
                    );
                    metrics::counter!("registry.registrations").increment(1);
                }
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_agent(&req).await {
                tracing::error!(worker = %req.agent_name, error = %e, "Failed to persist registration");
            } else if let Ok(Some(id)) = store.agent_id(&req.agent_name).await {
                let mut workers = self.workers.write().unwrap();
                if let Some(tracked) = workers.get_mut(&req.agent_name) {
                    tracked.record.id = Some(id);
                }
            }
        }
    }

    /// Record a heartbeat with status and hardware telemetry. Unknown
    /// names are ignored; workers must register first.
    pub async fn heartbeat(&self, req: HeartbeatRequest) -> bool {
        let known = {
            let mut workers = self.workers.write().unwrap();
            match workers.get_mut(&req.agent_name) {
                Some(tracked) => {
                    tracked.record.status = req.status;
                    tracked.record.hardware = req.hardware;
                    tracked.record.last_heartbeat = Utc::now();
                    tracked.heartbeat_at = Some(Instant::now());
                    true
                }
                None => false,
            }
        };

        if !known {
            tracing::warn!(worker = %req.agent_name, "Heartbeat from unregistered worker");
            return false;
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.update_agent_heartbeat(&req).await {
                tracing::error!(worker = %req.agent_name, error = %e, "Failed to persist heartbeat");
            }
        }
        true
    }

    /// Workers with a fresh heartbeat, optionally filtered by capability.
    ///
    /// For a concrete type that is neither `general` nor `image_generation`
    /// the filter matches that capability OR `general`; otherwise every
    /// live worker matches. Results are ordered idle before busy before
    /// failed, then by cpu, then memory.
    pub fn live_workers(&self, task_type: Option<TaskKind>) -> Vec<WorkerRecord> {
        let workers = self.workers.read().unwrap();
        let mut live: Vec<WorkerRecord> = workers
            .values()
            .filter(|t| t.is_fresh(self.fresh_window))
            .filter(|t| capability_matches(t.record.capability, task_type))
            .map(|t| t.record.clone())
            .collect();

        live.sort_by(|a, b| {
            a.status
                .selection_rank()
                .cmp(&b.status.selection_rank())
                .then(
                    a.hardware
                        .cpu_percent
                        .partial_cmp(&b.hardware.cpu_percent)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(
                    a.hardware
                        .memory_percent
                        .partial_cmp(&b.hardware.memory_percent)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        live
    }

    pub fn get(&self, name: &str) -> Option<WorkerRecord> {
        self.workers
            .read()
            .unwrap()
            .get(name)
            .map(|t| t.record.clone())
    }

    /// Update counters after a task: totals, success/failure, and the
    /// running-mean execution time. The worker's status returns to idle
    /// regardless of outcome.
    pub async fn record_outcome(&self, name: &str, success: bool, duration_secs: f64, cost: f64) {
        {
            let mut workers = self.workers.write().unwrap();
            if let Some(tracked) = workers.get_mut(name) {
                let record = &mut tracked.record;
                record.total_tasks += 1;
                if success {
                    record.successful_tasks += 1;
                } else {
                    record.failed_tasks += 1;
                }
                // Running mean over all completed tasks.
                let n = record.total_tasks as f64;
                record.avg_execution_time =
                    record.avg_execution_time + (duration_secs - record.avg_execution_time) / n;
                record.total_cost += cost;
                record.status = WorkerStatus::Idle;
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store
                .update_agent_counters(name, success, duration_secs, cost)
                .await
            {
                tracing::error!(worker = name, error = %e, "Failed to persist counters");
            }
        }
    }

    /// Mark a worker's controller-side status (busy while dispatched).
    pub fn mark_status(&self, name: &str, status: WorkerStatus) {
        let mut workers = self.workers.write().unwrap();
        if let Some(tracked) = workers.get_mut(name) {
            tracked.record.status = status;
        }
    }

    pub fn summary(&self) -> RegistrySummary {
        let workers = self.workers.read().unwrap();
        let mut summary = RegistrySummary {
            total_workers: workers.len(),
            live_workers: 0,
            idle: 0,
            busy: 0,
            workers: Vec::with_capacity(workers.len()),
        };
        for tracked in workers.values() {
            if tracked.is_fresh(self.fresh_window) {
                summary.live_workers += 1;
            }
            match tracked.record.status {
                WorkerStatus::Idle => summary.idle += 1,
                WorkerStatus::Busy => summary.busy += 1,
                WorkerStatus::Failed => {}
            }
            summary.workers.push(tracked.record.clone());
        }
        summary.workers.sort_by(|a, b| a.name.cmp(&b.name));
        summary
    }
}

/// Capability filter. Concrete types accept declared capability or a
/// generalist; `general` and `image_generation` requests take any live
/// worker.
fn capability_matches(capability: TaskKind, requested: Option<TaskKind>) -> bool {
    match requested {
        None | Some(TaskKind::General) | Some(TaskKind::ImageGeneration) => true,
        Some(kind) => capability == kind || capability == TaskKind::General,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_common::types::HardwareTelemetry;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(None, Duration::from_secs(30))
    }

    fn register_req(name: &str, capability: TaskKind) -> RegisterRequest {
        RegisterRequest {
            agent_name: name.into(),
            capability,
            host: "127.0.0.1".into(),
            port: 9000,
        }
    }

    fn heartbeat_req(name: &str, status: WorkerStatus, cpu: f64, memory: f64) -> HeartbeatRequest {
        HeartbeatRequest {
            agent_name: name.into(),
            status,
            hardware: HardwareTelemetry {
                cpu_percent: cpu,
                memory_percent: memory,
                temperature: None,
            },
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = registry();
        registry.register(register_req("w1", TaskKind::Coding)).await;
        registry.register(register_req("w1", TaskKind::Coding)).await;

        assert_eq!(registry.summary().total_workers, 1);
    }

    #[tokio::test]
    async fn test_reregistration_keeps_counters() {
        let registry = registry();
        registry.register(register_req("w1", TaskKind::Coding)).await;
        registry.record_outcome("w1", true, 2.0, 0.01).await;

        let mut req = register_req("w1", TaskKind::Analysis);
        req.port = 9100;
        registry.register(req).await;

        let record = registry.get("w1").unwrap();
        assert_eq!(record.total_tasks, 1);
        assert_eq!(record.capability, TaskKind::Analysis);
        assert_eq!(record.port, 9100);
    }

    #[tokio::test]
    async fn test_heartbeat_requires_registration() {
        let registry = registry();
        assert!(!registry
            .heartbeat(heartbeat_req("ghost", WorkerStatus::Idle, 1.0, 1.0))
            .await);
    }

    #[tokio::test]
    async fn test_repeated_heartbeats_leave_counters_unchanged() {
        let registry = registry();
        registry.register(register_req("w1", TaskKind::Coding)).await;
        registry
            .heartbeat(heartbeat_req("w1", WorkerStatus::Idle, 5.0, 10.0))
            .await;
        registry
            .heartbeat(heartbeat_req("w1", WorkerStatus::Idle, 6.0, 11.0))
            .await;

        let record = registry.get("w1").unwrap();
        assert_eq!(record.total_tasks, 0);
        assert_eq!(record.successful_tasks, 0);
        assert!((record.hardware.cpu_percent - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stale_workers_excluded() {
        let registry = WorkerRegistry::new(None, Duration::from_millis(10));
        registry.register(register_req("w1", TaskKind::Coding)).await;
        assert_eq!(registry.live_workers(None).len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.live_workers(None).is_empty());
    }

    #[tokio::test]
    async fn test_capability_filter_includes_generalists() {
        let registry = registry();
        registry.register(register_req("coder", TaskKind::Coding)).await;
        registry.register(register_req("writer", TaskKind::Documentation)).await;
        registry.register(register_req("jack", TaskKind::General)).await;

        let names: Vec<String> = registry
            .live_workers(Some(TaskKind::Coding))
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert!(names.contains(&"coder".to_string()));
        assert!(names.contains(&"jack".to_string()));
        assert!(!names.contains(&"writer".to_string()));
    }

    #[tokio::test]
    async fn test_general_request_matches_all_live() {
        let registry = registry();
        registry.register(register_req("coder", TaskKind::Coding)).await;
        registry.register(register_req("artist", TaskKind::ImageGeneration)).await;

        assert_eq!(registry.live_workers(Some(TaskKind::General)).len(), 2);
        assert_eq!(
            registry.live_workers(Some(TaskKind::ImageGeneration)).len(),
            2
        );
    }

    #[tokio::test]
    async fn test_ordering_idle_then_cpu_then_memory() {
        let registry = registry();
        for name in ["a", "b", "c"] {
            registry.register(register_req(name, TaskKind::Coding)).await;
        }
        registry
            .heartbeat(heartbeat_req("a", WorkerStatus::Busy, 5.0, 10.0))
            .await;
        registry
            .heartbeat(heartbeat_req("b", WorkerStatus::Idle, 50.0, 10.0))
            .await;
        registry
            .heartbeat(heartbeat_req("c", WorkerStatus::Idle, 20.0, 10.0))
            .await;

        let names: Vec<String> = registry
            .live_workers(Some(TaskKind::Coding))
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_outcome_updates_running_mean_and_resets_idle() {
        let registry = registry();
        registry.register(register_req("w1", TaskKind::Coding)).await;
        registry.mark_status("w1", WorkerStatus::Busy);

        registry.record_outcome("w1", true, 2.0, 0.01).await;
        registry.record_outcome("w1", false, 4.0, 0.0).await;

        let record = registry.get("w1").unwrap();
        assert_eq!(record.total_tasks, 2);
        assert_eq!(record.successful_tasks, 1);
        assert_eq!(record.failed_tasks, 1);
        assert!((record.avg_execution_time - 3.0).abs() < 1e-9);
        assert_eq!(record.status, WorkerStatus::Idle);
    }
}
