use super::{StoreClient, StoreError};

impl StoreClient {
    /// Append a row to the system log.
    pub async fn append_system_log(
        &self,
        level: &str,
        source: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO system_logs (level, source, message) VALUES ($1, $2, $3)")
            .bind(level)
            .bind(source)
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }
}
