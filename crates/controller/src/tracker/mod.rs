use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::Serialize;

use foreman_common::types::TaskKind;

/// Rolling window length for durations, outcomes and quality scores.
const HISTORY_LEN: usize = 20;

/// Recency weights over the last five outcomes, oldest first.
const PREDICTION_WEIGHTS: [f64; 5] = [1.0, 1.2, 1.4, 1.6, 2.0];

/// Minimum volume before specialization detection kicks in.
const SPECIALIZATION_MIN_TASKS: u64 = 15;

/// Share of a worker's volume that marks a task type as optimal.
const SPECIALIZATION_SHARE: f64 = 0.4;

/// Direction of a worker's recent outcome history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTrend {
    /// Fewer than ten samples.
    #[default]
    Learning,
    Improving,
    Stable,
    Degrading,
}

/// Per-worker rolling metrics.
#[derive(Clone, Debug, Default)]
pub struct WorkerMetrics {
    pub total_tasks: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    /// Exponential moving average, adaptive alpha.
    pub avg_response_time: f64,
    pub avg_quality_score: f64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub cost_per_task: f64,
    pub uptime_percentage: f64,
    pub duration_history: Vec<f64>,
    pub success_history: Vec<u8>,
    pub quality_history: Vec<f64>,
    pub task_type_counts: HashMap<TaskKind, u64>,
    pub trend: PerformanceTrend,
    pub optimal_task_types: Vec<TaskKind>,
    pub specialization_score: f64,
    pub predicted_success_rate: f64,
}

/// A consistent copy of one worker's metrics, safe to rank and classify
/// against without holding the worker's lock.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub total_tasks: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    #[serde(skip)]
    pub last_failure: Option<Instant>,
    pub avg_response_time: f64,
    pub avg_quality_score: f64,
    pub cost_per_task: f64,
    pub total_cost: f64,
    pub uptime_percentage: f64,
    pub trend: PerformanceTrend,
    pub optimal_task_types: Vec<TaskKind>,
    pub specialization_score: f64,
    pub predicted_success_rate: f64,
}

/// Per-worker rolling metrics, trend detection, specialization detection,
/// predictive success, and blended scoring.
///
/// The outer map takes a reader-writer lock; each worker's metrics sit
/// behind their own mutex so feedback for one worker never blocks ranking
/// reads for another.
pub struct PerformanceTracker {
    workers: RwLock<HashMap<String, Arc<Mutex<WorkerMetrics>>>>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, worker: &str) -> Arc<Mutex<WorkerMetrics>> {
        if let Some(found) = self.workers.read().unwrap().get(worker) {
            return Arc::clone(found);
        }
        let mut map = self.workers.write().unwrap();
        Arc::clone(
            map.entry(worker.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(WorkerMetrics::default()))),
        )
    }

    /// Record one task outcome for a worker.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        worker: &str,
        task_type: TaskKind,
        success: bool,
        duration_secs: f64,
        tokens: u64,
        cost: f64,
        quality_score: Option<f64>,
    ) {
        let entry = self.entry(worker);
        let mut m = entry.lock().unwrap();

        m.total_tasks += 1;
        *m.task_type_counts.entry(task_type).or_insert(0) += 1;

        // Adaptive learning rate: new workers adjust fast, established
        // workers smooth over more history.
        let alpha = if m.total_tasks < 10 {
            0.5
        } else if m.total_tasks < 50 {
            0.3
        } else {
            0.2
        };

        if success {
            m.success_count += 1;
            m.consecutive_failures = 0;
        } else {
            m.failure_count += 1;
            m.consecutive_failures += 1;
            m.last_failure = Some(Instant::now());
        }

        push_capped(&mut m.duration_history, duration_secs);
        push_capped(&mut m.success_history, if success { 1 } else { 0 });

        if m.avg_response_time == 0.0 {
            m.avg_response_time = duration_secs;
        } else {
            m.avg_response_time = alpha * duration_secs + (1.0 - alpha) * m.avg_response_time;
        }

        if let Some(quality) = quality_score {
            push_capped(&mut m.quality_history, quality);
            if m.avg_quality_score == 0.0 {
                m.avg_quality_score = quality;
            } else {
                m.avg_quality_score = alpha * quality + (1.0 - alpha) * m.avg_quality_score;
            }
        }

        m.total_tokens += tokens;
        m.total_cost += cost;
        m.cost_per_task = m.total_cost / m.total_tasks as f64;
        m.uptime_percentage = m.success_count as f64 / m.total_tasks as f64 * 100.0;

        analyze_trend(&mut m);
        detect_specialization(&mut m);
        calculate_predicted_success(&mut m);

        metrics::counter!("tracker.tasks", "worker" => worker.to_string(), "outcome" => if success { "success" } else { "failure" })
            .increment(1);
        metrics::histogram!("tracker.task_duration", "worker" => worker.to_string())
            .record(duration_secs);
    }

    /// Blended rank in [0, 100] for a worker on a task type.
    /// New workers score a neutral 50.
    pub fn score(&self, worker: &str, task_type: TaskKind) -> f64 {
        let entry = self.entry(worker);
        let m = entry.lock().unwrap();
        score_metrics(&m, task_type)
    }

    /// Rank candidate workers by score, best first.
    pub fn rank(&self, candidates: &[String], task_type: TaskKind) -> Vec<(String, f64)> {
        let mut scored: Vec<(String, f64)> = candidates
            .iter()
            .map(|name| (name.clone(), self.score(name, task_type)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }

    /// Consistent copy of one worker's metrics.
    pub fn snapshot(&self, worker: &str) -> MetricsSnapshot {
        let entry = self.entry(worker);
        let m = entry.lock().unwrap();
        snapshot_of(&m)
    }

    /// Operator reset after recovery: clears the failure streak.
    pub fn reset_worker(&self, worker: &str) {
        let entry = self.entry(worker);
        let mut m = entry.lock().unwrap();
        m.consecutive_failures = 0;
        m.last_failure = None;
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers.read().unwrap().keys().cloned().collect()
    }

    /// System-wide insights and recommendations for the stats endpoint.
    pub fn insights(&self) -> TrackerInsights {
        let names = self.worker_names();
        let mut snapshots: Vec<(String, MetricsSnapshot)> = names
            .iter()
            .map(|name| (name.clone(), self.snapshot(name)))
            .collect();

        let mut degrading = Vec::new();
        let mut specialization_map = HashMap::new();
        let mut total_cost = 0.0;
        let mut total_tasks = 0u64;

        for (name, snap) in &snapshots {
            if snap.trend == PerformanceTrend::Degrading {
                degrading.push(DegradingWorker {
                    name: name.clone(),
                    predicted_success: snap.predicted_success_rate,
                    consecutive_failures: snap.consecutive_failures,
                });
            }
            if !snap.optimal_task_types.is_empty() {
                specialization_map.insert(name.clone(), snap.optimal_task_types.clone());
            }
            total_cost += snap.total_cost;
            total_tasks += snap.total_tasks;
        }

        snapshots.sort_by(|a, b| {
            score_snapshot_general(&b.1)
                .partial_cmp(&score_snapshot_general(&a.1))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let top_performers: Vec<RankedWorker> = snapshots
            .iter()
            .take(3)
            .map(|(name, snap)| RankedWorker {
                name: name.clone(),
                score: score_snapshot_general(snap),
            })
            .collect();

        let mut by_cost: Vec<(&String, f64)> = snapshots
            .iter()
            .filter(|(_, s)| s.total_tasks > 5)
            .map(|(name, s)| (name, s.cost_per_task))
            .collect();
        by_cost.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut recommendations = Vec::new();
        if !degrading.is_empty() {
            recommendations.push(format!(
                "{} worker(s) showing degraded performance, consider restart",
                degrading.len()
            ));
        }
        if specialization_map.is_empty() && total_tasks > 50 {
            recommendations
                .push("no specialized workers detected, consider dedicated workers per task type".into());
        }

        TrackerInsights {
            total_workers: names.len(),
            degrading_workers: degrading,
            top_performers,
            specialization_map,
            total_cost,
            avg_cost_per_task: if total_tasks > 0 {
                total_cost / total_tasks as f64
            } else {
                0.0
            },
            most_efficient: by_cost.first().map(|(name, _)| (*name).clone()),
            least_efficient: by_cost.last().map(|(name, _)| (*name).clone()),
            recommendations,
        }
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregated view for observability.
#[derive(Clone, Debug, Serialize)]
pub struct TrackerInsights {
    pub total_workers: usize,
    pub degrading_workers: Vec<DegradingWorker>,
    pub top_performers: Vec<RankedWorker>,
    pub specialization_map: HashMap<String, Vec<TaskKind>>,
    pub total_cost: f64,
    pub avg_cost_per_task: f64,
    pub most_efficient: Option<String>,
    pub least_efficient: Option<String>,
    pub recommendations: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DegradingWorker {
    pub name: String,
    pub predicted_success: f64,
    pub consecutive_failures: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct RankedWorker {
    pub name: String,
    pub score: f64,
}

fn push_capped<T>(history: &mut Vec<T>, value: T) {
    history.push(value);
    if history.len() > HISTORY_LEN {
        history.remove(0);
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Compare the mean of the most recent ten outcomes against the preceding
/// ten. Delta beyond ±0.1 marks the direction; fewer than ten samples is
/// still learning.
fn analyze_trend(m: &mut WorkerMetrics) {
    if m.success_history.len() < 10 {
        m.trend = PerformanceTrend::Learning;
        return;
    }

    let recent: Vec<f64> = m.success_history[m.success_history.len() - 10..]
        .iter()
        .map(|&v| v as f64)
        .collect();
    let older: Vec<f64> = if m.success_history.len() >= 20 {
        m.success_history[m.success_history.len() - 20..m.success_history.len() - 10]
            .iter()
            .map(|&v| v as f64)
            .collect()
    } else {
        recent.clone()
    };

    let diff = mean(&recent) - mean(&older);
    m.trend = if diff > 0.1 {
        PerformanceTrend::Improving
    } else if diff < -0.1 {
        PerformanceTrend::Degrading
    } else {
        PerformanceTrend::Stable
    };
}

/// After 15+ tasks, any type holding at least 40% of this worker's volume
/// is optimal; the score is the largest share as a percentage.
fn detect_specialization(m: &mut WorkerMetrics) {
    if m.total_tasks < SPECIALIZATION_MIN_TASKS || m.task_type_counts.is_empty() {
        return;
    }

    let total: u64 = m.task_type_counts.values().sum();
    let mut optimal: Vec<TaskKind> = m
        .task_type_counts
        .iter()
        .filter(|(_, &count)| count as f64 / total as f64 > SPECIALIZATION_SHARE)
        .map(|(&kind, _)| kind)
        .collect();
    optimal.sort_by_key(|k| k.as_db_str());

    m.specialization_score = if optimal.is_empty() {
        0.0
    } else {
        let max_count = *m.task_type_counts.values().max().unwrap_or(&0);
        (max_count as f64 / total as f64 * 100.0).min(100.0)
    };
    m.optimal_task_types = optimal;
}

/// Recency-weighted mean of the last five outcomes, as a percentage.
/// Falls back to uptime until five samples exist.
fn calculate_predicted_success(m: &mut WorkerMetrics) {
    if m.success_history.len() < 5 {
        m.predicted_success_rate = m.uptime_percentage;
        return;
    }

    let recent = &m.success_history[m.success_history.len() - 5..];
    let weighted_sum: f64 = recent
        .iter()
        .zip(PREDICTION_WEIGHTS.iter())
        .map(|(&outcome, &weight)| outcome as f64 * weight)
        .sum();
    let weight_total: f64 = PREDICTION_WEIGHTS.iter().sum();

    m.predicted_success_rate = weighted_sum / weight_total * 100.0;
}

fn snapshot_of(m: &WorkerMetrics) -> MetricsSnapshot {
    MetricsSnapshot {
        total_tasks: m.total_tasks,
        success_count: m.success_count,
        failure_count: m.failure_count,
        consecutive_failures: m.consecutive_failures,
        last_failure: m.last_failure,
        avg_response_time: m.avg_response_time,
        avg_quality_score: m.avg_quality_score,
        cost_per_task: m.cost_per_task,
        total_cost: m.total_cost,
        uptime_percentage: m.uptime_percentage,
        trend: m.trend,
        optimal_task_types: m.optimal_task_types.clone(),
        specialization_score: m.specialization_score,
        predicted_success_rate: m.predicted_success_rate,
    }
}

/// The blended score:
///   35 · predicted success
/// + speed (up to 25, ×1.1 when getting faster)
/// + quality (up to 20, ×1.1 when improving)
/// + expertise (15 for a specialization match, else experience-scaled)
/// + cost efficiency (up to 5)
/// + trend bonus (improving +5, mature stable +3)
/// − failure penalty (harsher while degrading)
/// clamped to [0, 100].
fn score_metrics(m: &WorkerMetrics, task_type: TaskKind) -> f64 {
    if m.total_tasks == 0 {
        return 50.0;
    }

    let success_score = m.predicted_success_rate / 100.0 * 35.0;

    let mut speed_score = 0.0;
    if m.avg_response_time > 0.0 {
        let mut base = (100.0 / m.avg_response_time).min(25.0);
        if m.duration_history.len() >= 10 {
            let n = m.duration_history.len();
            let recent = mean(&m.duration_history[n - 5..]);
            let older = mean(&m.duration_history[n - 10..n - 5]);
            if recent < older {
                base *= 1.1;
            }
        }
        speed_score = base;
    }

    let mut quality_score = 0.0;
    if m.avg_quality_score > 0.0 {
        let mut base = m.avg_quality_score / 10.0 * 20.0;
        if m.quality_history.len() >= 10 {
            let n = m.quality_history.len();
            let recent = mean(&m.quality_history[n - 5..]);
            let older = mean(&m.quality_history[n - 10..n - 5]);
            if recent > older {
                base *= 1.1;
            }
        }
        quality_score = base;
    }

    let expertise_score = if m.optimal_task_types.contains(&task_type) {
        15.0
    } else if let Some(&count) = m.task_type_counts.get(&task_type) {
        (count as f64 / 10.0 * 15.0).min(15.0)
    } else {
        0.0
    };

    let cost_score = if m.cost_per_task > 0.0 {
        (0.01 / m.cost_per_task.max(0.001) * 5.0).min(5.0)
    } else {
        0.0
    };

    let trend_bonus = match m.trend {
        PerformanceTrend::Improving => 5.0,
        PerformanceTrend::Stable if m.total_tasks > 20 => 3.0,
        _ => 0.0,
    };

    let failure_penalty = if m.consecutive_failures > 0 {
        let consec = m.consecutive_failures as f64;
        if m.trend == PerformanceTrend::Degrading {
            (consec * 10.0).min(30.0)
        } else {
            (consec * 5.0).min(20.0)
        }
    } else {
        0.0
    };

    let total = success_score + speed_score + quality_score + expertise_score + cost_score
        + trend_bonus
        - failure_penalty;

    total.clamp(0.0, 100.0)
}

/// Score without a task type, for leaderboard-style reporting.
fn score_snapshot_general(s: &MetricsSnapshot) -> f64 {
    if s.total_tasks == 0 {
        return 50.0;
    }
    let success = s.predicted_success_rate / 100.0 * 35.0;
    let speed = if s.avg_response_time > 0.0 {
        (100.0 / s.avg_response_time).min(25.0)
    } else {
        0.0
    };
    let quality = s.avg_quality_score / 10.0 * 20.0;
    (success + speed + quality).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_n(
        tracker: &PerformanceTracker,
        worker: &str,
        kind: TaskKind,
        outcomes: &[(bool, f64)],
    ) {
        for &(success, duration) in outcomes {
            tracker.record(worker, kind, success, duration, 100, 0.01, Some(7.0));
        }
    }

    #[test]
    fn test_new_worker_scores_neutral_fifty() {
        let tracker = PerformanceTracker::new();
        assert_eq!(tracker.score("fresh", TaskKind::Coding), 50.0);
    }

    #[test]
    fn test_trend_is_learning_under_ten_samples() {
        let tracker = PerformanceTracker::new();
        record_n(&tracker, "w", TaskKind::Coding, &[(true, 1.0); 9]);
        assert_eq!(tracker.snapshot("w").trend, PerformanceTrend::Learning);
    }

    #[test]
    fn test_trend_improving_and_degrading() {
        let tracker = PerformanceTracker::new();
        // Ten failures then ten successes: recent mean 1.0 vs older 0.0.
        let mut outcomes = vec![(false, 1.0); 10];
        outcomes.extend(vec![(true, 1.0); 10]);
        record_n(&tracker, "up", TaskKind::Coding, &outcomes);
        assert_eq!(tracker.snapshot("up").trend, PerformanceTrend::Improving);

        let mut outcomes = vec![(true, 1.0); 10];
        outcomes.extend(vec![(false, 1.0); 10]);
        record_n(&tracker, "down", TaskKind::Coding, &outcomes);
        assert_eq!(tracker.snapshot("down").trend, PerformanceTrend::Degrading);
    }

    #[test]
    fn test_predicted_success_weights_recent_outcomes() {
        let tracker = PerformanceTracker::new();
        // Last five outcomes: 0, 0, 0, 0, 1 — only the heaviest weight hits.
        record_n(
            &tracker,
            "w",
            TaskKind::Coding,
            &[
                (false, 1.0),
                (false, 1.0),
                (false, 1.0),
                (false, 1.0),
                (true, 1.0),
            ],
        );
        let snap = tracker.snapshot("w");
        let expected = 2.0 / (1.0 + 1.2 + 1.4 + 1.6 + 2.0) * 100.0;
        assert!((snap.predicted_success_rate - expected).abs() < 1e-9);
    }

    #[test]
    fn test_specialization_after_fifteen_tasks() {
        let tracker = PerformanceTracker::new();
        record_n(&tracker, "w", TaskKind::Coding, &[(true, 1.0); 12]);
        record_n(&tracker, "w", TaskKind::Analysis, &[(true, 1.0); 3]);

        let snap = tracker.snapshot("w");
        assert_eq!(snap.optimal_task_types, vec![TaskKind::Coding]);
        assert!((snap.specialization_score - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_specialization_below_volume_floor() {
        let tracker = PerformanceTracker::new();
        record_n(&tracker, "w", TaskKind::Coding, &[(true, 1.0); 14]);
        assert!(tracker.snapshot("w").optimal_task_types.is_empty());
    }

    #[test]
    fn test_histories_capped_at_twenty() {
        let tracker = PerformanceTracker::new();
        record_n(&tracker, "w", TaskKind::Coding, &[(true, 1.0); 30]);
        let entry = tracker.entry("w");
        let m = entry.lock().unwrap();
        assert_eq!(m.success_history.len(), 20);
        assert_eq!(m.duration_history.len(), 20);
    }

    #[test]
    fn test_ema_uses_fast_alpha_for_new_workers() {
        let tracker = PerformanceTracker::new();
        tracker.record("w", TaskKind::Coding, true, 2.0, 0, 0.0, None);
        tracker.record("w", TaskKind::Coding, true, 4.0, 0, 0.0, None);
        // alpha 0.5 → 0.5*4 + 0.5*2 = 3.0
        let snap = tracker.snapshot("w");
        assert!((snap.avg_response_time - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_consecutive_failures_penalize_score() {
        let tracker = PerformanceTracker::new();
        record_n(&tracker, "good", TaskKind::Coding, &[(true, 2.0); 10]);
        record_n(&tracker, "flaky", TaskKind::Coding, &[(true, 2.0); 8]);
        record_n(&tracker, "flaky", TaskKind::Coding, &[(false, 2.0); 2]);

        let good = tracker.score("good", TaskKind::Coding);
        let flaky = tracker.score("flaky", TaskKind::Coding);
        assert!(good > flaky);
    }

    #[test]
    fn test_rank_orders_best_first() {
        let tracker = PerformanceTracker::new();
        record_n(&tracker, "w1", TaskKind::Coding, &[(true, 5.0); 6]);
        record_n(&tracker, "w2", TaskKind::Coding, &[(true, 1.0); 6]);

        let ranked = tracker.rank(
            &["w1".to_string(), "w2".to_string()],
            TaskKind::Coding,
        );
        assert_eq!(ranked[0].0, "w2");
        assert!(ranked[0].1 > ranked[1].1);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let tracker = PerformanceTracker::new();
        record_n(&tracker, "w", TaskKind::Coding, &[(false, 1.0); 2]);
        assert_eq!(tracker.snapshot("w").consecutive_failures, 2);
        record_n(&tracker, "w", TaskKind::Coding, &[(true, 1.0)]);
        assert_eq!(tracker.snapshot("w").consecutive_failures, 0);
    }

    #[test]
    fn test_insights_flag_degrading_workers() {
        let tracker = PerformanceTracker::new();
        let mut outcomes = vec![(true, 1.0); 10];
        outcomes.extend(vec![(false, 1.0); 10]);
        record_n(&tracker, "down", TaskKind::Coding, &outcomes);

        let insights = tracker.insights();
        assert_eq!(insights.degrading_workers.len(), 1);
        assert_eq!(insights.degrading_workers[0].name, "down");
        assert!(!insights.recommendations.is_empty());
    }
}
