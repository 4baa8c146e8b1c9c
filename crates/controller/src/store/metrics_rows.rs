use foreman_common::types::TaskKind;

use super::{StoreClient, StoreError};

impl StoreClient {
    /// Append one performance observation for offline analysis.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_performance_row(
        &self,
        agent_name: &str,
        task_type: TaskKind,
        success: bool,
        duration_secs: f64,
        tokens: u64,
        cost: f64,
        quality_score: Option<f64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO performance_metrics
                (agent_name, task_type, success, duration, tokens, cost, quality_score)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(agent_name)
        .bind(task_type.as_db_str())
        .bind(success)
        .bind(duration_secs)
        .bind(tokens as i64)
        .bind(cost)
        .bind(quality_score)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }
}
