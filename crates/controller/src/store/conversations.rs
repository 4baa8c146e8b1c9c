use chrono::Utc;

use foreman_common::ids::ConversationId;
use foreman_common::types::{ChatMessage, ChatRole};

use super::{StoreClient, StoreError};

impl StoreClient {
    /// Create the conversation row when missing; existing ids pass
    /// through untouched.
    pub async fn ensure_conversation(
        &self,
        id: Option<ConversationId>,
    ) -> Result<ConversationId, StoreError> {
        let id = id.unwrap_or_default();

        sqlx::query("INSERT INTO conversations (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(id)
    }

    pub async fn append_message(
        &self,
        conversation_id: ConversationId,
        role: ChatRole,
        content: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages (conversation_id, role, content) VALUES ($1, $2, $3)",
        )
        .bind(conversation_id.0)
        .bind(role.as_db_str())
        .bind(content)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    /// The last `n` messages of a conversation, oldest first.
    pub async fn last_messages(
        &self,
        conversation_id: ConversationId,
        n: i64,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT role, content, created_at
            FROM messages
            WHERE conversation_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(conversation_id.0)
        .bind(n)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows.into_iter().rev().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    role: String,
    content: String,
    created_at: chrono::DateTime<Utc>,
}

impl From<MessageRow> for ChatMessage {
    fn from(row: MessageRow) -> Self {
        Self {
            role: ChatRole::parse(&row.role).unwrap_or(ChatRole::User),
            content: row.content,
            created_at: row.created_at,
        }
    }
}
