use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use foreman_common::api::chat::{ChatRequest, ChatResponse};
use foreman_common::api::worker::ExecuteRequest;
use foreman_common::ids::{ConversationId, TaskId};
use foreman_common::types::{
    ChatMessage, ChatRole, TaskKind, TaskPriority, TaskStatus, ValidationVerdict, WorkerRecord,
    WorkerStatus,
};
use foreman_common::{ForemanError, Result};

use crate::cache::ResponseCache;
use crate::config::ControllerConfig;
use crate::context::{compose_worker_prompt, ContextSelector};
use crate::health::HealthMonitor;
use crate::leader::LeaderMonitor;
use crate::oracle::OracleClient;
use crate::planner::{step_output_indicates_failure, TaskPlanner};
use crate::queue::{QueuedTask, TaskQueue};
use crate::registry::WorkerRegistry;
use crate::store::StoreClient;
use crate::tracker::PerformanceTracker;
use crate::validator::AnswerValidator;
use crate::workers::{WorkerClient, WorkerClientError};

/// Two task descriptions sharing more than this many words are related.
const RELATED_WORD_OVERLAP: usize = 3;

/// How far back related-task detection looks.
const RELATED_LOOKBACK: i64 = 20;

/// Where one routing attempt landed.
enum RouteDecision {
    Assigned(WorkerRecord),
    UseBuiltin,
    Queued {
        reason: QueueReason,
        priority: TaskPriority,
        bound_worker: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueueReason {
    NoCapableWorker,
    AllOverloaded,
    AllUnhealthy,
    TopWorkerBusy,
}

impl QueueReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::NoCapableWorker => "no_capable_worker",
            Self::AllOverloaded => "all_overloaded",
            Self::AllUnhealthy => "all_unhealthy",
            Self::TopWorkerBusy => "top_worker_busy",
        }
    }
}

/// Result of executing one plan step.
struct StepSuccess {
    output: String,
    worker: Option<String>,
    validation: ValidationVerdict,
}

enum StepOutcome {
    Done(StepSuccess),
    Parked { reason: QueueReason },
}

/// Binds planner, context selector, registry, tracker, health monitor,
/// cache, and queue into the per-request supervision pipeline: select a
/// worker, dispatch the step, validate the answer, record feedback, and
/// retry, queue, or fall back when things go wrong.
pub struct Router {
    registry: Arc<WorkerRegistry>,
    tracker: Arc<PerformanceTracker>,
    health: Arc<HealthMonitor>,
    cache: Arc<ResponseCache>,
    queue: Arc<TaskQueue>,
    store: Arc<StoreClient>,
    planner: Arc<TaskPlanner>,
    context: Arc<ContextSelector>,
    validator: Arc<AnswerValidator>,
    worker_client: WorkerClient,
    leader: Arc<LeaderMonitor>,
    /// The controller's own model, used when no capable worker is live.
    builtin: Option<Arc<OracleClient>>,
    config: Arc<ControllerConfig>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        tracker: Arc<PerformanceTracker>,
        health: Arc<HealthMonitor>,
        cache: Arc<ResponseCache>,
        queue: Arc<TaskQueue>,
        store: Arc<StoreClient>,
        planner: Arc<TaskPlanner>,
        context: Arc<ContextSelector>,
        validator: Arc<AnswerValidator>,
        worker_client: WorkerClient,
        leader: Arc<LeaderMonitor>,
        builtin: Option<Arc<OracleClient>>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            registry,
            tracker,
            health,
            cache,
            queue,
            store,
            planner,
            context,
            validator,
            worker_client,
            leader,
            builtin,
            config,
        }
    }

    /// Serve one chat request end to end: leader gate, cache, plan,
    /// per-step context selection, routed dispatch with supervision, and
    /// answer caching.
    pub async fn handle_chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        if !self.leader.should_process_request() {
            return Err(ForemanError::NotLeader {
                active: self.leader.active_master().await,
            });
        }

        let message = req.message.trim();
        if message.is_empty() {
            return Err(ForemanError::Internal("empty message".into()));
        }

        let conversation_id = self.store.ensure_conversation(req.conversation_id).await?;
        let history = self
            .store
            .last_messages(conversation_id, self.context.max_messages() as i64)
            .await?;

        let decision = self.context.select(message, &history).await;
        let slice_text = render_slice(&decision.relevant);

        // Cache lookup happens before planning: a repeated request with
        // the same context slice short-circuits the whole pipeline.
        if let Some(answer) = self.cache.get(message, slice_text.as_deref()) {
            self.store
                .append_message(conversation_id, ChatRole::User, message)
                .await?;
            self.store
                .append_message(conversation_id, ChatRole::Assistant, &answer)
                .await?;
            metrics::counter!("router.requests", "cache" => "hit").increment(1);
            return Ok(ChatResponse {
                answer,
                conversation_id,
                task_id: None,
                used_cache: true,
                steps: Vec::new(),
                workers_used: Vec::new(),
                validation: None,
            });
        }
        metrics::counter!("router.requests", "cache" => "miss").increment(1);

        let plan = self.planner.plan_task(message, &req.files).await;

        let task = self
            .store
            .create_task(
                Some(conversation_id),
                message,
                plan.steps[0],
                TaskPriority::Normal,
            )
            .await?;

        let context_tag = if decision.needs_context {
            "contextual"
        } else if plan.is_multi_step {
            "multi_step"
        } else {
            "single"
        };
        self.store
            .record_task_context(
                task.id,
                context_tag,
                slice_text.as_deref().unwrap_or(message),
            )
            .await?;
        self.log_related_tasks(task.id, message).await;

        self.store
            .append_message(conversation_id, ChatRole::User, message)
            .await?;

        // One dispatch budget for the whole task, shared across plan
        // steps and validator-recommended retries.
        let mut budget = self.config.system.routing.max_retries + 1;
        let mut attempt: u32 = 0;
        let mut status = TaskStatus::Pending;
        let mut workers_used: Vec<String> = Vec::new();
        let mut last_output = String::new();
        let mut last_validation: Option<ValidationVerdict> = None;

        let total_steps = plan.steps.len();
        for (index, step) in plan.steps.iter().enumerate() {
            // Step one sees the conversation slice inside its prompt; the
            // following steps see the prior outputs as context instead.
            let (prompt, step_context) = if index == 0 {
                (
                    compose_worker_prompt(message, &decision.relevant),
                    slice_text.clone(),
                )
            } else {
                (message.to_string(), Some(last_output.clone()))
            };

            let outcome = self
                .run_step(
                    task.id,
                    *step,
                    (index + 1) as u32,
                    message,
                    &prompt,
                    step_context,
                    Some(conversation_id),
                    &mut budget,
                    &mut attempt,
                    &mut status,
                )
                .await?;

            match outcome {
                StepOutcome::Parked { reason } => {
                    let notice = format!(
                        "Your request was queued ({}); it will run as soon as a worker frees up.",
                        reason.as_str()
                    );
                    return Ok(ChatResponse {
                        answer: notice,
                        conversation_id,
                        task_id: Some(task.id),
                        used_cache: false,
                        steps: plan.steps.clone(),
                        workers_used,
                        validation: None,
                    });
                }
                StepOutcome::Done(success) => {
                    if let Some(worker) = &success.worker {
                        workers_used.push(worker.clone());
                    }
                    last_validation = Some(success.validation.clone());
                    last_output = success.output;

                    // Cancellation lands between a worker reply and the
                    // next step.
                    if self.store.cancel_requested(task.id).await? {
                        self.advance_status(task.id, &mut status, TaskStatus::Cancelled)
                            .await?;
                        return Err(ForemanError::Cancelled(task.id.0));
                    }

                    // Continuation rule: a failing step output aborts the
                    // remainder of the plan.
                    if index + 1 < total_steps && step_output_indicates_failure(&last_output) {
                        tracing::warn!(
                            task_id = %task.id,
                            step = index + 1,
                            "Step output indicates failure, aborting plan"
                        );
                        self.advance_status(task.id, &mut status, TaskStatus::Failed)
                            .await?;
                        return Err(ForemanError::WorkerSemantic(
                            last_output.chars().take(200).collect(),
                        ));
                    }
                }
            }
        }

        self.advance_status(task.id, &mut status, TaskStatus::Completed)
            .await?;
        self.store
            .append_message(conversation_id, ChatRole::Assistant, &last_output)
            .await?;
        self.cache.set(message, &last_output, slice_text.as_deref());

        Ok(ChatResponse {
            answer: last_output,
            conversation_id,
            task_id: Some(task.id),
            used_cache: false,
            steps: plan.steps,
            workers_used,
            validation: last_validation,
        })
    }

    /// Cancel a task. Queued tasks drop out of the queue; a processing
    /// task is flagged and cancellation applies after the current reply.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<TaskStatus> {
        let task = self.store.get_task(task_id).await?;

        match task.status {
            TaskStatus::Pending | TaskStatus::Queued => {
                self.queue.cancel(task_id);
                self.store
                    .update_task_status(task_id, TaskStatus::Cancelled)
                    .await?;
                tracing::info!(task_id = %task_id, "Task cancelled");
                Ok(TaskStatus::Cancelled)
            }
            TaskStatus::Assigned | TaskStatus::Processing => {
                self.store.set_cancel_requested(task_id).await?;
                tracing::info!(task_id = %task_id, "Cancellation recorded for running task");
                Ok(task.status)
            }
            terminal => Ok(terminal),
        }
    }

    /// Execute one plan step with retries, fallback, and queueing.
    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        task_id: TaskId,
        step: TaskKind,
        order: u32,
        message: &str,
        prompt: &str,
        step_context: Option<String>,
        conversation_id: Option<ConversationId>,
        budget: &mut u32,
        attempt: &mut u32,
        status: &mut TaskStatus,
    ) -> Result<StepOutcome> {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_err: Option<ForemanError> = None;

        loop {
            match self.select_worker(step, &excluded) {
                RouteDecision::Queued {
                    reason,
                    priority,
                    bound_worker,
                } => {
                    // A task already mid-plan cannot re-enter the queue;
                    // capacity shortage on a later step fails it instead.
                    if *status == TaskStatus::Processing {
                        self.advance_status(task_id, status, TaskStatus::Failed).await?;
                        return Err(shortage_error(reason, step));
                    }
                    self.park(
                        task_id,
                        step,
                        prompt,
                        step_context.clone(),
                        priority,
                        bound_worker,
                        conversation_id,
                        *attempt,
                        reason,
                        status,
                    )
                    .await?;
                    return Ok(StepOutcome::Parked { reason });
                }
                RouteDecision::UseBuiltin => {
                    let output = match self.run_builtin(prompt, step_context.as_deref()).await {
                        Ok(output) => output,
                        Err(e) => {
                            self.advance_status(task_id, status, TaskStatus::Failed).await?;
                            return Err(e);
                        }
                    };
                    let validation = self.validator.validate(message, &output, "builtin").await;
                    self.advance_to_processing(task_id, status).await?;
                    *attempt += 1;
                    self.store
                        .insert_result(
                            task_id,
                            *attempt,
                            None,
                            &output,
                            true,
                            Some(validation.quality_score as f64),
                            0.0,
                        )
                        .await?;
                    metrics::counter!("router.builtin_fallbacks").increment(1);
                    return Ok(StepOutcome::Done(StepSuccess {
                        output,
                        worker: Some("builtin".into()),
                        validation,
                    }));
                }
                RouteDecision::Assigned(worker) => {
                    if *budget == 0 {
                        self.advance_status(task_id, status, TaskStatus::Failed).await?;
                        return Err(last_err.unwrap_or_else(|| {
                            ForemanError::WorkerSemantic("dispatch budget exhausted".into())
                        }));
                    }
                    *budget -= 1;
                    *attempt += 1;

                    match self
                        .dispatch_once(
                            task_id,
                            &worker,
                            step,
                            order,
                            message,
                            prompt,
                            step_context.as_deref(),
                            *attempt,
                            status,
                        )
                        .await
                    {
                        Ok(success) => return Ok(StepOutcome::Done(success)),
                        Err(e) if e.is_retryable() => {
                            tracing::warn!(
                                task_id = %task_id,
                                worker = %worker.name,
                                error = %e,
                                remaining_budget = *budget,
                                "Dispatch failed, trying next-best worker"
                            );
                            self.store.increment_retry_count(task_id).await?;
                            excluded.insert(worker.name.clone());
                            last_err = Some(e);
                        }
                        Err(e) => {
                            self.advance_status(task_id, status, TaskStatus::Failed).await?;
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// One dispatch to one worker, with full feedback recording.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_once(
        &self,
        task_id: TaskId,
        worker: &WorkerRecord,
        step: TaskKind,
        order: u32,
        message: &str,
        prompt: &str,
        step_context: Option<&str>,
        attempt: u32,
        status: &mut TaskStatus,
    ) -> Result<StepSuccess> {
        self.store
            .insert_assignment(task_id, worker.id, order, attempt)
            .await?;
        self.registry.mark_status(&worker.name, WorkerStatus::Busy);
        if *status == TaskStatus::Pending || *status == TaskStatus::Queued {
            self.advance_status(task_id, status, TaskStatus::Assigned).await?;
        }
        self.advance_to_processing(task_id, status).await?;

        tracing::info!(
            task_id = %task_id,
            worker = %worker.name,
            step = %step,
            attempt,
            score = self.tracker.score(&worker.name, step),
            "Dispatching step"
        );

        let started = std::time::Instant::now();
        let request = ExecuteRequest {
            task_id: task_id.0,
            task_desc: prompt.to_string(),
            task_type: step,
            context: step_context.map(String::from),
        };

        let response = match self.worker_client.execute(worker, &request).await {
            Ok(response) => response,
            Err(e) => {
                let elapsed = started.elapsed().as_secs_f64();
                self.record_failure(worker, step, elapsed, task_id, attempt, &e.to_string())
                    .await;
                return Err(match e {
                    WorkerClientError::Timeout(d) => {
                        ForemanError::Timeout(format!("worker {} after {:?}", worker.name, d))
                    }
                    other => ForemanError::WorkerTransport(other.to_string()),
                });
            }
        };

        let duration = if response.execution_time > 0.0 {
            response.execution_time
        } else {
            started.elapsed().as_secs_f64()
        };

        // Explicit failure payload from the worker.
        if !response.success {
            self.record_failure(worker, step, duration, task_id, attempt, &response.output)
                .await;
            return Err(ForemanError::WorkerSemantic(format!(
                "worker {} reported failure",
                worker.name
            )));
        }

        let validation = self
            .validator
            .validate(message, &response.output, &worker.name)
            .await;

        if validation.should_retry {
            // A rejected answer counts as a semantic failure and consumes
            // a retry slot.
            self.record_failure(worker, step, duration, task_id, attempt, &response.output)
                .await;
            return Err(ForemanError::WorkerSemantic(format!(
                "validator rejected answer from {} (quality {})",
                worker.name, validation.quality_score
            )));
        }

        let quality = response
            .quality
            .unwrap_or(validation.quality_score as f64);
        self.tracker.record(
            &worker.name,
            step,
            true,
            duration,
            response.tokens.unwrap_or(0),
            response.cost.unwrap_or(0.0),
            Some(quality),
        );
        self.registry
            .record_outcome(&worker.name, true, duration, response.cost.unwrap_or(0.0))
            .await;
        self.store
            .insert_result(
                task_id,
                attempt,
                worker.id,
                &response.output,
                true,
                Some(quality),
                duration,
            )
            .await?;
        if let Err(e) = self
            .store
            .append_performance_row(
                &worker.name,
                step,
                true,
                duration,
                response.tokens.unwrap_or(0),
                response.cost.unwrap_or(0.0),
                Some(quality),
            )
            .await
        {
            tracing::error!(error = %e, "Failed to append performance row");
        }

        // The worker is idle again; parked work can run.
        self.queue.nudge();

        Ok(StepSuccess {
            output: response.output,
            worker: Some(worker.name.clone()),
            validation,
        })
    }

    /// Feedback for a failed dispatch: tracker, health, registry,
    /// result row, performance row.
    async fn record_failure(
        &self,
        worker: &WorkerRecord,
        step: TaskKind,
        duration: f64,
        task_id: TaskId,
        attempt: u32,
        detail: &str,
    ) {
        self.tracker
            .record(&worker.name, step, false, duration, 0, 0.0, None);
        let snapshot = self.tracker.snapshot(&worker.name);
        self.health.record_failure(&worker.name, Some(&snapshot));
        self.registry
            .record_outcome(&worker.name, false, duration, 0.0)
            .await;

        if let Err(e) = self
            .store
            .insert_result(task_id, attempt, worker.id, detail, false, None, duration)
            .await
        {
            tracing::error!(error = %e, "Failed to persist failed attempt");
        }
        if let Err(e) = self
            .store
            .append_performance_row(&worker.name, step, false, duration, 0, 0.0, None)
            .await
        {
            tracing::error!(error = %e, "Failed to append performance row");
        }
        metrics::counter!("router.dispatch_failures", "worker" => worker.name.clone())
            .increment(1);
    }

    /// The selection pipeline: live → hardware-fit → healthy → ranked.
    fn select_worker(&self, step: TaskKind, excluded: &HashSet<String>) -> RouteDecision {
        let routing = &self.config.system.routing;

        let live: Vec<WorkerRecord> = self
            .registry
            .live_workers(Some(step))
            .into_iter()
            .filter(|w| !excluded.contains(&w.name))
            .collect();

        if live.is_empty() {
            return if self.builtin.is_some() {
                RouteDecision::UseBuiltin
            } else {
                RouteDecision::Queued {
                    reason: QueueReason::NoCapableWorker,
                    priority: TaskPriority::Critical,
                    bound_worker: None,
                }
            };
        }

        let hardware_fit = filter_hardware(live, routing.cpu_threshold, routing.memory_threshold);
        if hardware_fit.is_empty() {
            return RouteDecision::Queued {
                reason: QueueReason::AllOverloaded,
                priority: TaskPriority::High,
                bound_worker: None,
            };
        }

        let healthy: Vec<WorkerRecord> = hardware_fit
            .into_iter()
            .filter(|w| {
                let snapshot = self.tracker.snapshot(&w.name);
                self.health.is_selectable(&w.name, Some(&snapshot))
            })
            .collect();
        if healthy.is_empty() {
            return RouteDecision::Queued {
                reason: QueueReason::AllUnhealthy,
                priority: TaskPriority::Critical,
                bound_worker: None,
            };
        }

        let names: Vec<String> = healthy.iter().map(|w| w.name.clone()).collect();
        let ranked = self.tracker.rank(&names, step);
        let Some(top) = ranked
            .first()
            .and_then(|(top_name, _)| healthy.iter().find(|w| &w.name == top_name))
            .cloned()
        else {
            return RouteDecision::Queued {
                reason: QueueReason::AllUnhealthy,
                priority: TaskPriority::Critical,
                bound_worker: None,
            };
        };

        if top.status == WorkerStatus::Busy {
            return RouteDecision::Queued {
                reason: QueueReason::TopWorkerBusy,
                priority: TaskPriority::Critical,
                bound_worker: Some(top.name),
            };
        }

        RouteDecision::Assigned(top)
    }

    /// Enqueue a step for later dispatch and move the task to queued.
    #[allow(clippy::too_many_arguments)]
    async fn park(
        &self,
        task_id: TaskId,
        step: TaskKind,
        prompt: &str,
        step_context: Option<String>,
        priority: TaskPriority,
        bound_worker: Option<String>,
        conversation_id: Option<ConversationId>,
        attempt: u32,
        reason: QueueReason,
        status: &mut TaskStatus,
    ) -> Result<()> {
        self.queue.enqueue(QueuedTask {
            task_id,
            task_type: step,
            description: prompt.to_string(),
            context: step_context,
            priority,
            bound_worker: bound_worker.clone(),
            conversation_id,
            attempt,
        })?;

        self.advance_status(task_id, status, TaskStatus::Queued).await?;
        tracing::info!(
            task_id = %task_id,
            reason = reason.as_str(),
            bound_worker = bound_worker.as_deref().unwrap_or("-"),
            "Task parked in queue"
        );
        metrics::counter!("router.parked", "reason" => reason.as_str()).increment(1);
        if let Err(e) = self
            .store
            .append_system_log(
                "info",
                "router",
                &format!("task {} queued: {}", task_id, reason.as_str()),
            )
            .await
        {
            tracing::error!(error = %e, "Failed to append system log");
        }
        Ok(())
    }

    /// Answer with the controller's own model under the step deadline.
    async fn run_builtin(&self, prompt: &str, step_context: Option<&str>) -> Result<String> {
        let builtin = self
            .builtin
            .as_ref()
            .ok_or_else(|| ForemanError::Internal("builtin model unavailable".into()))?;

        let user = match step_context {
            Some(ctx) => format!("{}\n\n{}", ctx, prompt),
            None => prompt.to_string(),
        };

        tracing::info!(model = builtin.model(), "No capable worker, using built-in model");
        tokio::time::timeout(
            Duration::from_secs(self.config.system.routing.step_timeout_secs),
            builtin.complete(BUILTIN_SYSTEM, &user),
        )
        .await
        .map_err(|_| ForemanError::Timeout("builtin model".into()))?
        .map_err(ForemanError::from)
    }

    async fn advance_status(
        &self,
        task_id: TaskId,
        status: &mut TaskStatus,
        next: TaskStatus,
    ) -> Result<()> {
        if *status == next {
            return Ok(());
        }
        self.store.update_task_status(task_id, next).await?;
        *status = next;
        Ok(())
    }

    async fn advance_to_processing(
        &self,
        task_id: TaskId,
        status: &mut TaskStatus,
    ) -> Result<()> {
        if *status == TaskStatus::Processing {
            return Ok(());
        }
        if *status != TaskStatus::Assigned {
            self.advance_status(task_id, status, TaskStatus::Assigned).await?;
        }
        self.advance_status(task_id, status, TaskStatus::Processing).await
    }

    /// Flag recent tasks sharing more than three words with this one.
    /// Logged only; deliberately not a routing input.
    async fn log_related_tasks(&self, task_id: TaskId, description: &str) {
        let recent = match self.store.recent_task_descriptions(RELATED_LOOKBACK).await {
            Ok(recent) => recent,
            Err(e) => {
                tracing::debug!(error = %e, "Related-task lookup failed");
                return;
            }
        };

        for (other_id, other_desc) in recent {
            if other_id == task_id {
                continue;
            }
            let shared = word_overlap(description, &other_desc);
            if shared > RELATED_WORD_OVERLAP {
                tracing::info!(
                    task_id = %task_id,
                    related_to = %other_id,
                    shared_words = shared,
                    "Detected related task"
                );
                if let Err(e) = self
                    .store
                    .append_system_log(
                        "info",
                        "router",
                        &format!("task {} related to task {} ({} shared words)", task_id, other_id, shared),
                    )
                    .await
                {
                    tracing::error!(error = %e, "Failed to append system log");
                }
            }
        }
    }

    /// Dispatch one task taken off the queue. Re-parks it when no worker
    /// is available yet.
    pub async fn execute_queued(&self, queued: QueuedTask) -> Result<()> {
        let max_dispatches = self.config.system.routing.max_retries + 1;
        let mut budget = max_dispatches.saturating_sub(queued.attempt).max(1);
        let mut attempt = queued.attempt;
        let mut status = TaskStatus::Queued;

        // A bound task waits for its preferred worker; once that worker
        // idles, general selection picks it (or something better) anyway.
        if let Some(bound) = &queued.bound_worker {
            let ready = self
                .registry
                .get(bound)
                .is_some_and(|w| w.status == WorkerStatus::Idle);
            if !ready {
                self.queue.enqueue(queued)?;
                tokio::time::sleep(Duration::from_secs(1)).await;
                return Ok(());
            }
        }

        let outcome = self
            .run_step(
                queued.task_id,
                queued.task_type,
                1,
                &queued.description,
                &queued.description,
                queued.context.clone(),
                queued.conversation_id,
                &mut budget,
                &mut attempt,
                &mut status,
            )
            .await;

        match outcome {
            Ok(StepOutcome::Done(success)) => {
                self.advance_status(queued.task_id, &mut status, TaskStatus::Completed)
                    .await?;
                if let Some(conversation_id) = queued.conversation_id {
                    self.store
                        .append_message(conversation_id, ChatRole::Assistant, &success.output)
                        .await?;
                }
                tracing::info!(task_id = %queued.task_id, "Queued task completed");
                Ok(())
            }
            Ok(StepOutcome::Parked { .. }) => Ok(()),
            Err(e) => {
                tracing::error!(task_id = %queued.task_id, error = %e, "Queued task failed");
                Err(e)
            }
        }
    }
}

/// The typed error behind each queueing reason, for paths where queueing
/// is not possible.
fn shortage_error(reason: QueueReason, step: TaskKind) -> ForemanError {
    match reason {
        QueueReason::NoCapableWorker => ForemanError::NoCapableWorker(step.to_string()),
        QueueReason::AllOverloaded => ForemanError::AllWorkersOverloaded,
        QueueReason::AllUnhealthy => ForemanError::AllWorkersUnhealthy,
        QueueReason::TopWorkerBusy => ForemanError::AllWorkersBusy,
    }
}

/// Built-in fallback persona.
const BUILTIN_SYSTEM: &str =
    "You are the controller's built-in assistant, answering directly when no specialized worker is available. Be concise and correct.";

/// Workers inside hardware limits (cpu and memory strictly below their
/// thresholds).
fn filter_hardware(
    workers: Vec<WorkerRecord>,
    cpu_threshold: f64,
    memory_threshold: f64,
) -> Vec<WorkerRecord> {
    workers
        .into_iter()
        .filter(|w| {
            w.hardware.cpu_percent < cpu_threshold && w.hardware.memory_percent < memory_threshold
        })
        .collect()
}

/// Count distinct words two descriptions share.
fn word_overlap(a: &str, b: &str) -> usize {
    let words_a: HashSet<String> = a
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect();
    let words_b: HashSet<String> = b
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect();
    words_a.intersection(&words_b).count()
}

/// Render a context slice for cache keys and the task context record.
fn render_slice(relevant: &[ChatMessage]) -> Option<String> {
    if relevant.is_empty() {
        return None;
    }
    Some(
        relevant
            .iter()
            .map(|m| format!("{}: {}", m.role.as_db_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Background loop draining parked work whenever capacity frees up.
pub fn spawn_queue_drain(
    router: Arc<Router>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                tracing::info!("Queue drain shutting down");
                break;
            }

            tokio::select! {
                queued = router.queue.dequeue(Duration::from_secs(5)) => {
                    if let Some(queued) = queued {
                        let task_id = queued.task_id;
                        if let Err(e) = router.execute_queued(queued).await {
                            tracing::error!(task_id = %task_id, error = %e, "Drain dispatch failed");
                        }
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use foreman_common::types::HardwareTelemetry;

    fn worker(name: &str, cpu: f64, memory: f64) -> WorkerRecord {
        WorkerRecord {
            id: None,
            name: name.into(),
            host: "127.0.0.1".into(),
            port: 9000,
            capability: TaskKind::Coding,
            status: WorkerStatus::Idle,
            hardware: HardwareTelemetry {
                cpu_percent: cpu,
                memory_percent: memory,
                temperature: None,
            },
            last_heartbeat: Utc::now(),
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            avg_execution_time: 0.0,
            total_cost: 0.0,
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_hardware_filter_excludes_at_threshold() {
        let filtered = filter_hardware(
            vec![
                worker("fit", 79.9, 89.9),
                worker("hot_cpu", 80.0, 10.0),
                worker("hot_mem", 10.0, 90.0),
            ],
            80.0,
            90.0,
        );
        let names: Vec<String> = filtered.into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["fit"]);
    }

    #[test]
    fn test_word_overlap_counts_distinct_shared_words() {
        assert_eq!(
            word_overlap("sort a list in python", "sort this list with python"),
            3
        );
        assert_eq!(word_overlap("alpha beta", "gamma delta"), 0);
        // Case and punctuation do not matter.
        assert_eq!(word_overlap("Sort, List!", "sort list"), 2);
    }

    #[test]
    fn test_render_slice_empty_is_none() {
        assert!(render_slice(&[]).is_none());

        let slice = render_slice(&[ChatMessage::new(ChatRole::User, "hello")]).unwrap();
        assert!(slice.contains("user: hello"));
    }
}
