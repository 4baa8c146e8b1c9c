use chrono::Utc;

use foreman_common::types::MasterRecord;

use super::{StoreClient, StoreError};

impl StoreClient {
    /// Write this replica's heartbeat, creating the row on first sight.
    pub async fn upsert_master_heartbeat(&self, master_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO masters (master_id, last_heartbeat, is_active)
            VALUES ($1, $2, FALSE)
            ON CONFLICT (master_id) DO UPDATE
            SET last_heartbeat = EXCLUDED.last_heartbeat
            "#,
        )
        .bind(master_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    pub async fn get_masters(&self) -> Result<Vec<MasterRecord>, StoreError> {
        let rows = sqlx::query_as::<_, MasterRow>(
            "SELECT master_id, last_heartbeat, is_active FROM masters ORDER BY master_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Flip the active flag to exactly one replica, in one transaction.
    pub async fn set_active_master(&self, master_id: &str) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query("UPDATE masters SET is_active = FALSE WHERE is_active")
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query("UPDATE masters SET is_active = TRUE WHERE master_id = $1")
            .bind(master_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct MasterRow {
    master_id: String,
    last_heartbeat: Option<chrono::DateTime<Utc>>,
    is_active: bool,
}

impl From<MasterRow> for MasterRecord {
    fn from(row: MasterRow) -> Self {
        Self {
            master_id: row.master_id,
            last_heartbeat: row.last_heartbeat,
            is_active: row.is_active,
        }
    }
}
