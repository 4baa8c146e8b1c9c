use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use foreman_common::types::{HealthClass, WorkerStatus};

use crate::tracker::{MetricsSnapshot, PerformanceTrend};

/// Heartbeat-based liveness and a consecutive-failure circuit breaker.
///
/// Rules evaluated on every query and every feedback event:
/// - heartbeat age at or beyond the freshness window → unhealthy
///   (reversible on the next heartbeat)
/// - consecutive failures at the threshold → dead; the threshold adapts:
///   +2 tolerance for workers with fewer than 5 total tasks, +1 while the
///   trend is improving
/// - predicted success below 40 → dead
/// - degrading trend with >10 tasks and uptime <60% → dead; otherwise
///   uptime <50% with >10 tasks → dead
/// - a successful heartbeat clears the streak and the dead/unhealthy flags
///
/// A worker that died re-enters selection only after a heartbeat AND a
/// cooldown since its last failure (longer while degrading).
pub struct HealthMonitor {
    workers: Mutex<HashMap<String, WorkerHealth>>,
    heartbeat_timeout: Duration,
    failure_threshold: u32,
    dead_cooldown: Duration,
    degrading_cooldown: Duration,
}

struct WorkerHealth {
    last_heartbeat: Instant,
    consecutive_failures: u32,
    total_failures: u64,
    class: HealthClass,
    /// Set when the breaker opens; selection stays closed until this
    /// instant even after the worker recovers.
    cooling_until: Option<Instant>,
    first_seen: Instant,
}

/// Health observability snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub total_workers: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub dead: usize,
    pub workers: HashMap<String, WorkerHealthDetail>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkerHealthDetail {
    pub class: HealthClass,
    pub heartbeat_age_seconds: u64,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub uptime_seconds: u64,
}

impl HealthMonitor {
    pub fn new(
        heartbeat_timeout: Duration,
        failure_threshold: u32,
        dead_cooldown: Duration,
        degrading_cooldown: Duration,
    ) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            heartbeat_timeout,
            failure_threshold,
            dead_cooldown,
            degrading_cooldown,
        }
    }

    /// Record a worker heartbeat. Clears the failure streak and any
    /// dead/unhealthy classification; the selection cooldown persists.
    pub fn record_heartbeat(&self, worker: &str, status: WorkerStatus) {
        let now = Instant::now();
        tracing::debug!(worker, status = ?status, "Heartbeat");
        let mut workers = self.workers.lock().unwrap();

        match workers.get_mut(worker) {
            Some(health) => {
                if health.class == HealthClass::Dead {
                    tracing::info!(worker, "Worker recovered from dead state");
                    metrics::counter!("health.recoveries", "worker" => worker.to_string())
                        .increment(1);
                }
                health.last_heartbeat = now;
                health.consecutive_failures = 0;
                health.class = HealthClass::Healthy;
            }
            None => {
                workers.insert(
                    worker.to_string(),
                    WorkerHealth {
                        last_heartbeat: now,
                        consecutive_failures: 0,
                        total_failures: 0,
                        class: HealthClass::Healthy,
                        cooling_until: None,
                        first_seen: now,
                    },
                );
            }
        }
    }

    /// Record a task failure for a worker. The circuit opens when the
    /// adaptive threshold is reached on this event.
    pub fn record_failure(&self, worker: &str, snapshot: Option<&MetricsSnapshot>) {
        let mut workers = self.workers.lock().unwrap();
        let Some(health) = workers.get_mut(worker) else {
            return;
        };

        health.consecutive_failures += 1;
        health.total_failures += 1;

        let threshold = adaptive_threshold(self.failure_threshold, snapshot);
        if health.consecutive_failures >= threshold {
            let cooldown = self.cooldown_for(snapshot);
            health.class = HealthClass::Dead;
            health.cooling_until = Some(Instant::now() + cooldown);
            tracing::warn!(
                worker,
                failures = health.consecutive_failures,
                threshold,
                "Worker circuit OPEN, marked dead"
            );
            metrics::counter!("health.trips", "worker" => worker.to_string()).increment(1);
        } else if health.consecutive_failures >= 2 {
            health.class = HealthClass::Degraded;
            tracing::warn!(
                worker,
                failures = health.consecutive_failures,
                "Worker degraded"
            );
        }
    }

    fn cooldown_for(&self, snapshot: Option<&MetricsSnapshot>) -> Duration {
        match snapshot.map(|s| s.trend) {
            Some(PerformanceTrend::Degrading) => self.degrading_cooldown,
            _ => self.dead_cooldown,
        }
    }

    /// Classify one worker, folding in heartbeat age and tracker-derived
    /// signals. Mutates the stored class so reports stay consistent.
    pub fn classify(&self, worker: &str, snapshot: Option<&MetricsSnapshot>) -> HealthClass {
        let mut workers = self.workers.lock().unwrap();
        let Some(health) = workers.get_mut(worker) else {
            return HealthClass::Unknown;
        };

        // Stale heartbeat: age exactly at the window counts as unhealthy.
        if health.class != HealthClass::Dead
            && health.last_heartbeat.elapsed() >= self.heartbeat_timeout
        {
            if health.class != HealthClass::Unhealthy {
                tracing::warn!(
                    worker,
                    age_secs = health.last_heartbeat.elapsed().as_secs(),
                    "Worker unhealthy, stale heartbeat"
                );
            }
            health.class = HealthClass::Unhealthy;
        }

        if let Some(snap) = snapshot {
            if health.class != HealthClass::Dead && breaker_says_dead(snap) {
                let cooldown = self.cooldown_for(Some(snap));
                health.class = HealthClass::Dead;
                health.cooling_until = Some(
                    snap.last_failure
                        .map(|at| at + cooldown)
                        .unwrap_or_else(|| Instant::now() + cooldown),
                );
                tracing::warn!(worker, "Worker predicted unfit, marked dead");
            }
        }

        health.class
    }

    /// Whether this worker may appear in the selection candidate set.
    /// Only healthy and degraded workers are selectable, and a worker
    /// that died stays out until its cooldown elapses.
    pub fn is_selectable(&self, worker: &str, snapshot: Option<&MetricsSnapshot>) -> bool {
        let class = self.classify(worker, snapshot);
        if !matches!(class, HealthClass::Healthy | HealthClass::Degraded) {
            return false;
        }

        let workers = self.workers.lock().unwrap();
        match workers.get(worker).and_then(|h| h.cooling_until) {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    /// Names of workers currently selectable, given a snapshot provider.
    pub fn healthy_workers<'a>(
        &self,
        candidates: impl Iterator<Item = &'a str>,
        mut snapshot_for: impl FnMut(&str) -> Option<MetricsSnapshot>,
    ) -> Vec<String> {
        candidates
            .filter(|name| {
                let snap = snapshot_for(name);
                self.is_selectable(name, snap.as_ref())
            })
            .map(String::from)
            .collect()
    }

    pub fn report(&self) -> HealthReport {
        let workers = self.workers.lock().unwrap();
        let mut report = HealthReport {
            total_workers: workers.len(),
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            dead: 0,
            workers: HashMap::new(),
        };

        for (name, health) in workers.iter() {
            let class = if health.class != HealthClass::Dead
                && health.last_heartbeat.elapsed() >= self.heartbeat_timeout
            {
                HealthClass::Unhealthy
            } else {
                health.class
            };
            match class {
                HealthClass::Healthy => report.healthy += 1,
                HealthClass::Degraded => report.degraded += 1,
                HealthClass::Unhealthy => report.unhealthy += 1,
                HealthClass::Dead => report.dead += 1,
                HealthClass::Unknown => {}
            }
            report.workers.insert(
                name.clone(),
                WorkerHealthDetail {
                    class,
                    heartbeat_age_seconds: health.last_heartbeat.elapsed().as_secs(),
                    consecutive_failures: health.consecutive_failures,
                    total_failures: health.total_failures,
                    uptime_seconds: health.first_seen.elapsed().as_secs(),
                },
            );
        }

        report
    }

    /// Operator reset: close the breaker and clear the cooldown.
    pub fn reset_worker(&self, worker: &str) {
        let mut workers = self.workers.lock().unwrap();
        if let Some(health) = workers.get_mut(worker) {
            health.consecutive_failures = 0;
            health.cooling_until = None;
            health.class = HealthClass::Healthy;
            tracing::info!(worker, "Worker health reset by operator");
        }
    }

}

/// Threshold adapts to worker maturity and direction: new workers get more
/// chances, improving workers get a second one.
fn adaptive_threshold(base: u32, snapshot: Option<&MetricsSnapshot>) -> u32 {
    match snapshot {
        Some(s) if s.total_tasks < 5 => base + 2,
        Some(s) if s.trend == PerformanceTrend::Improving => base + 1,
        _ => base,
    }
}

/// Tracker-derived death sentence, independent of the failure streak.
fn breaker_says_dead(snap: &MetricsSnapshot) -> bool {
    if snap.total_tasks > 0 && snap.predicted_success_rate < 40.0 {
        return true;
    }
    if snap.total_tasks > 10 {
        if snap.trend == PerformanceTrend::Degrading {
            if snap.uptime_percentage < 60.0 {
                return true;
            }
        } else if snap.uptime_percentage < 50.0 {
            return true;
        }
    }
    false
}

/// Background sweep re-classifying every known worker against fresh
/// tracker snapshots.
pub fn spawn_health_sweep(
    monitor: std::sync::Arc<HealthMonitor>,
    tracker: std::sync::Arc<crate::tracker::PerformanceTracker>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let names: Vec<String> = {
                        let workers = monitor.workers.lock().unwrap();
                        workers.keys().cloned().collect()
                    };
                    for name in names {
                        let snap = tracker.snapshot(&name);
                        monitor.classify(&name, Some(&snap));
                    }
                    let report = monitor.report();
                    metrics::gauge!("health.workers", "class" => "healthy").set(report.healthy as f64);
                    metrics::gauge!("health.workers", "class" => "dead").set(report.dead as f64);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Health sweep shutting down");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(
            Duration::from_secs(30),
            3,
            Duration::from_millis(50),
            Duration::from_millis(100),
        )
    }

    fn snapshot(total: u64, trend: PerformanceTrend) -> MetricsSnapshot {
        MetricsSnapshot {
            total_tasks: total,
            success_count: total,
            failure_count: 0,
            consecutive_failures: 0,
            last_failure: None,
            avg_response_time: 1.0,
            avg_quality_score: 7.0,
            cost_per_task: 0.01,
            total_cost: 0.1,
            uptime_percentage: 100.0,
            trend,
            optimal_task_types: vec![],
            specialization_score: 0.0,
            predicted_success_rate: 100.0,
        }
    }

    #[test]
    fn test_unknown_worker_is_unknown() {
        let m = monitor();
        assert_eq!(m.classify("ghost", None), HealthClass::Unknown);
        assert!(!m.is_selectable("ghost", None));
    }

    #[test]
    fn test_heartbeat_makes_healthy() {
        let m = monitor();
        m.record_heartbeat("w", WorkerStatus::Idle);
        assert_eq!(m.classify("w", None), HealthClass::Healthy);
        assert!(m.is_selectable("w", None));
    }

    #[test]
    fn test_stale_heartbeat_is_unhealthy_at_boundary() {
        let m = HealthMonitor::new(
            Duration::from_millis(0),
            3,
            Duration::from_secs(300),
            Duration::from_secs(600),
        );
        m.record_heartbeat("w", WorkerStatus::Idle);
        // Age >= timeout counts as unhealthy, even at exactly the boundary.
        assert_eq!(m.classify("w", None), HealthClass::Unhealthy);
        assert!(!m.is_selectable("w", None));
    }

    #[test]
    fn test_dead_at_failure_threshold_event() {
        let m = monitor();
        m.record_heartbeat("w", WorkerStatus::Idle);
        let snap = snapshot(50, PerformanceTrend::Stable);

        m.record_failure("w", Some(&snap));
        assert_eq!(m.classify("w", Some(&snap)), HealthClass::Healthy);
        m.record_failure("w", Some(&snap));
        assert_eq!(m.classify("w", Some(&snap)), HealthClass::Degraded);
        m.record_failure("w", Some(&snap));
        assert_eq!(m.classify("w", Some(&snap)), HealthClass::Dead);
        assert!(!m.is_selectable("w", Some(&snap)));
    }

    #[test]
    fn test_new_workers_get_extra_tolerance() {
        let m = monitor();
        m.record_heartbeat("w", WorkerStatus::Idle);
        let snap = snapshot(3, PerformanceTrend::Learning);

        for _ in 0..4 {
            m.record_failure("w", Some(&snap));
        }
        // Threshold is 3 + 2 for a worker with under five tasks.
        assert_ne!(m.classify("w", Some(&snap)), HealthClass::Dead);
        m.record_failure("w", Some(&snap));
        assert_eq!(m.classify("w", Some(&snap)), HealthClass::Dead);
    }

    #[test]
    fn test_dead_worker_needs_heartbeat_and_cooldown() {
        let m = monitor();
        m.record_heartbeat("w", WorkerStatus::Idle);
        let snap = snapshot(50, PerformanceTrend::Stable);
        for _ in 0..3 {
            m.record_failure("w", Some(&snap));
        }
        assert!(!m.is_selectable("w", Some(&snap)));

        // Heartbeat alone clears the class but the cooldown still gates.
        m.record_heartbeat("w", WorkerStatus::Idle);
        assert!(!m.is_selectable("w", Some(&snap)));

        std::thread::sleep(Duration::from_millis(60));
        assert!(m.is_selectable("w", Some(&snap)));
    }

    #[test]
    fn test_low_predicted_success_is_dead() {
        let m = monitor();
        m.record_heartbeat("w", WorkerStatus::Idle);
        let mut snap = snapshot(20, PerformanceTrend::Stable);
        snap.predicted_success_rate = 30.0;
        assert_eq!(m.classify("w", Some(&snap)), HealthClass::Dead);
    }

    #[test]
    fn test_degrading_low_uptime_is_dead() {
        let m = monitor();
        m.record_heartbeat("w", WorkerStatus::Idle);
        let mut snap = snapshot(20, PerformanceTrend::Degrading);
        snap.uptime_percentage = 55.0;
        assert_eq!(m.classify("w", Some(&snap)), HealthClass::Dead);

        // The same uptime passes for a stable worker.
        let m2 = monitor();
        m2.record_heartbeat("w", WorkerStatus::Idle);
        let mut snap2 = snapshot(20, PerformanceTrend::Stable);
        snap2.uptime_percentage = 55.0;
        assert_eq!(m2.classify("w", Some(&snap2)), HealthClass::Healthy);
    }

    #[test]
    fn test_report_counts_classes() {
        let m = monitor();
        m.record_heartbeat("a", WorkerStatus::Idle);
        m.record_heartbeat("b", WorkerStatus::Busy);
        let snap = snapshot(50, PerformanceTrend::Stable);
        for _ in 0..3 {
            m.record_failure("b", Some(&snap));
        }

        let report = m.report();
        assert_eq!(report.total_workers, 2);
        assert_eq!(report.healthy, 1);
        assert_eq!(report.dead, 1);
    }

    #[test]
    fn test_healthy_workers_filters() {
        let m = monitor();
        m.record_heartbeat("a", WorkerStatus::Idle);
        m.record_heartbeat("b", WorkerStatus::Idle);
        let snap = snapshot(50, PerformanceTrend::Stable);
        for _ in 0..3 {
            m.record_failure("b", Some(&snap));
        }

        let healthy = m.healthy_workers(
            ["a", "b"].into_iter(),
            |_| Some(snapshot(50, PerformanceTrend::Stable)),
        );
        assert_eq!(healthy, vec!["a".to_string()]);
    }
}
