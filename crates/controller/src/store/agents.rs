use chrono::Utc;

use foreman_common::api::worker::{HeartbeatRequest, RegisterRequest};
use foreman_common::ids::WorkerId;
use foreman_common::types::{HardwareTelemetry, TaskKind, WorkerRecord, WorkerStatus};

use super::{StoreClient, StoreError};

impl StoreClient {
    /// Insert or refresh an agent row. Idempotent by name: counters
    /// survive, host/port/capability take the most recent values.
    pub async fn upsert_agent(&self, req: &RegisterRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agents (name, host, port, capability, status, last_heartbeat)
            VALUES ($1, $2, $3, $4, 'idle', $5)
            ON CONFLICT (name) DO UPDATE
            SET host = EXCLUDED.host,
                port = EXCLUDED.port,
                capability = EXCLUDED.capability,
                status = 'idle',
                last_heartbeat = EXCLUDED.last_heartbeat
            "#,
        )
        .bind(&req.agent_name)
        .bind(&req.host)
        .bind(req.port as i32)
        .bind(req.capability.as_db_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    pub async fn agent_id(&self, name: &str) -> Result<Option<WorkerId>, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM agents WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row.map(|(id,)| WorkerId(id)))
    }

    pub async fn update_agent_heartbeat(&self, req: &HeartbeatRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE agents
            SET status = $2,
                cpu_percent = $3,
                memory_percent = $4,
                temperature = $5,
                last_heartbeat = $6
            WHERE name = $1
            "#,
        )
        .bind(&req.agent_name)
        .bind(req.status.as_db_str())
        .bind(req.hardware.cpu_percent)
        .bind(req.hardware.memory_percent)
        .bind(req.hardware.temperature)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    /// Counter update after a task: totals, outcome split, running-mean
    /// execution time, cost, and a reset to idle.
    pub async fn update_agent_counters(
        &self,
        name: &str,
        success: bool,
        duration_secs: f64,
        cost: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE agents
            SET total_tasks = total_tasks + 1,
                successful_tasks = successful_tasks + CASE WHEN $2 THEN 1 ELSE 0 END,
                failed_tasks = failed_tasks + CASE WHEN $2 THEN 0 ELSE 1 END,
                avg_execution_time = (avg_execution_time * total_tasks + $3) / (total_tasks + 1),
                total_cost = total_cost + $4,
                status = 'idle'
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(success)
        .bind(duration_secs)
        .bind(cost)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    pub async fn get_agents(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let rows = sqlx::query_as::<_, AgentRow>(
            r#"
            SELECT id, name, host, port, capability, status, cpu_percent,
                   memory_percent, temperature, last_heartbeat, total_tasks,
                   successful_tasks, failed_tasks, avg_execution_time,
                   total_cost, registered_at
            FROM agents
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct AgentRow {
    id: i64,
    name: String,
    host: String,
    port: i32,
    capability: String,
    status: String,
    cpu_percent: f64,
    memory_percent: f64,
    temperature: Option<f64>,
    last_heartbeat: Option<chrono::DateTime<Utc>>,
    total_tasks: i64,
    successful_tasks: i64,
    failed_tasks: i64,
    avg_execution_time: f64,
    total_cost: f64,
    registered_at: chrono::DateTime<Utc>,
}

impl From<AgentRow> for WorkerRecord {
    fn from(row: AgentRow) -> Self {
        Self {
            id: Some(WorkerId(row.id)),
            name: row.name,
            host: row.host,
            port: row.port as u16,
            capability: TaskKind::parse(&row.capability).unwrap_or(TaskKind::General),
            status: WorkerStatus::parse(&row.status).unwrap_or(WorkerStatus::Idle),
            hardware: HardwareTelemetry {
                cpu_percent: row.cpu_percent,
                memory_percent: row.memory_percent,
                temperature: row.temperature,
            },
            last_heartbeat: row.last_heartbeat.unwrap_or(row.registered_at),
            total_tasks: row.total_tasks.max(0) as u64,
            successful_tasks: row.successful_tasks.max(0) as u64,
            failed_tasks: row.failed_tasks.max(0) as u64,
            avg_execution_time: row.avg_execution_time,
            total_cost: row.total_cost,
            registered_at: row.registered_at,
        }
    }
}
