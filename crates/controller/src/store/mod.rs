mod agents;
mod conversations;
mod logs;
mod masters;
mod metrics_rows;
mod tasks;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// PostgreSQL client for tasks, assignments, results, conversations,
/// agents, controller heartbeats, performance rows, and system logs.
pub struct StoreClient {
    pool: PgPool,
}

impl StoreClient {
    /// Connect to PostgreSQL and return a client with a connection pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        tracing::info!("Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let client = Self { pool };
        client.health_check().await?;
        tracing::info!("PostgreSQL connection established");

        Ok(client)
    }

    /// Verify the connection is alive.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Run database migrations. Table creation is idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        tracing::info!("Running PostgreSQL migrations");

        sqlx::migrate!("src/store/migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        tracing::info!("PostgreSQL migrations complete");
        Ok(())
    }

    /// Auto-repair for a historical deployment defect: a `system_logs`
    /// table whose primary key default is not an autoincrement sequence
    /// makes every insert fail. Drop and recreate it in that case.
    pub async fn repair_system_logs(&self) -> Result<(), StoreError> {
        let row = sqlx::query(
            r#"
            SELECT column_default
            FROM information_schema.columns
            WHERE table_name = 'system_logs' AND column_name = 'id'
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let Some(row) = row else {
            return Ok(());
        };
        let default: Option<String> = row
            .try_get("column_default")
            .map_err(|e| StoreError::Query(e.to_string()))?;

        if default.as_deref().is_some_and(|d| d.contains("nextval")) {
            return Ok(());
        }

        tracing::warn!(
            default = default.as_deref().unwrap_or("<none>"),
            "system_logs primary key is not autoincrement, recreating table"
        );

        sqlx::query("DROP TABLE system_logs")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE system_logs (
                id BIGSERIAL PRIMARY KEY,
                level TEXT NOT NULL,
                source TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        tracing::info!("system_logs table recreated");
        Ok(())
    }

    /// Get a reference to the underlying connection pool.
    #[allow(dead_code)]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("PostgreSQL connection error: {0}")]
    Connection(String),

    #[error("PostgreSQL query error: {0}")]
    Query(String),

    #[error("PostgreSQL migration error: {0}")]
    Migration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Illegal status transition: {0}")]
    IllegalTransition(String),
}

impl From<StoreError> for foreman_common::ForemanError {
    fn from(e: StoreError) -> Self {
        foreman_common::ForemanError::Store(e.to_string())
    }
}
