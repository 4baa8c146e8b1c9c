use chrono::Utc;
use uuid::Uuid;

use foreman_common::ids::{ConversationId, TaskId, WorkerId};
use foreman_common::types::{Task, TaskKind, TaskPriority, TaskStatus};

use super::{StoreClient, StoreError};

impl StoreClient {
    /// Create a new task row in `pending`.
    pub async fn create_task(
        &self,
        conversation_id: Option<ConversationId>,
        description: &str,
        task_type: TaskKind,
        priority: TaskPriority,
    ) -> Result<Task, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO tasks (conversation_id, description, task_type, priority, status)
            VALUES ($1, $2, $3, $4, 'pending')
            RETURNING id, user_id, conversation_id, description, task_type, priority,
                      retry_count, status, cancel_requested, created_at, updated_at, completed_at
            "#,
        )
        .bind(conversation_id.map(|c| c.0))
        .bind(description)
        .bind(task_type.as_db_str())
        .bind(priority.as_db_int())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row.into())
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, user_id, conversation_id, description, task_type, priority,
                   retry_count, status, cancel_requested, created_at, updated_at, completed_at
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?
        .ok_or_else(|| StoreError::NotFound(format!("Task {}", id)))?;

        Ok(row.into())
    }

    /// Advance a task's status. The update carries the monotonic-progress
    /// guard in its WHERE clause: only the allowed predecessor statuses
    /// match, so a terminal task never rewinds.
    pub async fn update_task_status(
        &self,
        id: TaskId,
        next: TaskStatus,
    ) -> Result<(), StoreError> {
        let allowed: Vec<String> = TaskStatus::allowed_predecessors(next)
            .iter()
            .map(|s| s.as_db_str().to_string())
            .collect();
        let completed_at = if next.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2,
                updated_at = now(),
                completed_at = COALESCE($3, completed_at)
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id.0)
        .bind(next.as_db_str())
        .bind(completed_at)
        .bind(&allowed)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            let current = self.get_task(id).await.map(|t| t.status);
            return Err(StoreError::IllegalTransition(format!(
                "task {} cannot move to {} from {:?}",
                id,
                next.as_db_str(),
                current.map(|s| s.as_db_str())
            )));
        }

        Ok(())
    }

    pub async fn increment_retry_count(&self, id: TaskId) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET retry_count = retry_count + 1, updated_at = now() WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Flag a processing task for cancellation after its current reply.
    /// Returns false when the task is already terminal.
    pub async fn set_cancel_requested(&self, id: TaskId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET cancel_requested = TRUE, updated_at = now()
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn cancel_requested(&self, id: TaskId) -> Result<bool, StoreError> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT cancel_requested FROM tasks WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row.map(|(flag,)| flag).unwrap_or(false))
    }

    /// Persist one assignment decision. Unique on (task, order, attempt)
    /// so retries append instead of overwriting.
    pub async fn insert_assignment(
        &self,
        task_id: TaskId,
        agent_id: Option<WorkerId>,
        assignment_order: u32,
        attempt: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO assignments (task_id, agent_id, assignment_order, attempt)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (task_id, assignment_order, attempt) DO UPDATE
            SET agent_id = EXCLUDED.agent_id, assigned_at = now()
            "#,
        )
        .bind(task_id.0)
        .bind(agent_id.map(|w| w.0))
        .bind(assignment_order as i32)
        .bind(attempt as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    /// Persist one attempt's result. At most one row per (task, attempt).
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_result(
        &self,
        task_id: TaskId,
        attempt: u32,
        agent_id: Option<WorkerId>,
        output: &str,
        success: bool,
        quality_score: Option<f64>,
        execution_time: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO results (task_id, attempt, agent_id, output, success,
                                 quality_score, execution_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (task_id, attempt) DO NOTHING
            "#,
        )
        .bind(task_id.0)
        .bind(attempt as i32)
        .bind(agent_id.map(|w| w.0))
        .bind(output)
        .bind(success)
        .bind(quality_score)
        .bind(execution_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    /// Record the context slice selected for a task
    /// (type tag: single | multi_step | contextual).
    pub async fn record_task_context(
        &self,
        task_id: TaskId,
        context_type: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO task_contexts (task_id, context_type, content) VALUES ($1, $2, $3)",
        )
        .bind(task_id.0)
        .bind(context_type)
        .bind(content)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    /// Recent task descriptions, for related-task detection.
    pub async fn recent_task_descriptions(
        &self,
        limit: i64,
    ) -> Result<Vec<(TaskId, String)>, StoreError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, description FROM tasks ORDER BY id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(id, desc)| (TaskId(id), desc))
            .collect())
    }
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    user_id: Option<i64>,
    conversation_id: Option<Uuid>,
    description: String,
    task_type: String,
    priority: i16,
    retry_count: i32,
    status: String,
    cancel_requested: bool,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
    completed_at: Option<chrono::DateTime<Utc>>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Self {
            id: TaskId(row.id),
            user_id: row.user_id,
            conversation_id: row.conversation_id.map(ConversationId::from_uuid),
            description: row.description,
            task_type: TaskKind::parse(&row.task_type).unwrap_or(TaskKind::General),
            priority: TaskPriority::from_db_int(row.priority),
            retry_count: row.retry_count.max(0) as u32,
            status: TaskStatus::parse(&row.status).unwrap_or_else(|| {
                tracing::warn!(status = %row.status, "Unknown task status, defaulting to pending");
                TaskStatus::Pending
            }),
            cancel_requested: row.cancel_requested,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        }
    }
}
