use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};

use bookdesk_core::domain::session::{Message, MessageRole, Session, SessionId, ToolCallRecord};

use super::{parse_timestamp, RepositoryError, SessionRepository};
use crate::DbPool;

pub struct SqlSessionRepository {
    pool: DbPool,
}

impl SqlSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionRepository for SqlSessionRepository {
    async fn ensure(&self, id: &SessionId) -> Result<Session, RepositoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO sessions (id, created_at, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.find(id).await?.ok_or_else(|| {
            RepositoryError::Decode(format!("session `{id}` vanished right after insert"))
        })
    }

    async fn find(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query("SELECT id, created_at, updated_at FROM sessions WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(session_from_row).transpose()
    }

    async fn append_message(
        &self,
        session_id: &SessionId,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, RepositoryError> {
        let created_at = Utc::now();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO messages (session_id, role, content, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(session_id.as_str())
        .bind(role.as_str())
        .bind(content)
        .bind(created_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(Message {
            id,
            session_id: session_id.clone(),
            role,
            content: content.to_string(),
            created_at,
        })
    }

    async fn recent_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT id, session_id, role, content, created_at
             FROM (
                SELECT id, session_id, role, content, created_at
                FROM messages
                WHERE session_id = ?
                ORDER BY id DESC
                LIMIT ?
             )
             ORDER BY id ASC",
        )
        .bind(session_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn list_messages(&self, session_id: &SessionId) -> Result<Vec<Message>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, session_id, role, content, created_at
             FROM messages
             WHERE session_id = ?
             ORDER BY id ASC",
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn list_tool_calls(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ToolCallRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT tool_name, args_json, result_json, succeeded
             FROM tool_calls
             WHERE session_id = ?
             ORDER BY id ASC",
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ToolCallRecord {
                    tool_name: row.try_get("tool_name")?,
                    arguments: parse_json("args_json", &row.try_get::<String, _>("args_json")?)?,
                    result: parse_json("result_json", &row.try_get::<String, _>("result_json")?)?,
                    succeeded: row.try_get::<i64, _>("succeeded")? == 1,
                })
            })
            .collect()
    }

    async fn record_tool_calls(
        &self,
        session_id: &SessionId,
        tool_calls: &[ToolCallRecord],
    ) -> Result<(), RepositoryError> {
        if tool_calls.is_empty() {
            return Ok(());
        }
        let timestamp = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        insert_tool_calls(&mut tx, session_id, tool_calls, &timestamp).await?;
        touch_session(&mut tx, session_id, &timestamp).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn complete_turn(
        &self,
        session_id: &SessionId,
        tool_calls: &[ToolCallRecord],
        reply: &str,
    ) -> Result<Message, RepositoryError> {
        let created_at = Utc::now();
        let timestamp = created_at.to_rfc3339();
        let mut tx = self.pool.begin().await?;

        insert_tool_calls(&mut tx, session_id, tool_calls, &timestamp).await?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO messages (session_id, role, content, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(session_id.as_str())
        .bind(MessageRole::Assistant.as_str())
        .bind(reply)
        .bind(&timestamp)
        .fetch_one(&mut *tx)
        .await?;

        touch_session(&mut tx, session_id, &timestamp).await?;
        tx.commit().await?;

        Ok(Message {
            id,
            session_id: session_id.clone(),
            role: MessageRole::Assistant,
            content: reply.to_string(),
            created_at,
        })
    }
}

async fn insert_tool_calls(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: &SessionId,
    tool_calls: &[ToolCallRecord],
    timestamp: &str,
) -> Result<(), RepositoryError> {
    for call in tool_calls {
        sqlx::query(
            "INSERT INTO tool_calls
                (session_id, tool_name, args_json, result_json, succeeded, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id.as_str())
        .bind(&call.tool_name)
        .bind(call.arguments.to_string())
        .bind(call.result.to_string())
        .bind(i64::from(call.succeeded))
        .bind(timestamp)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn touch_session(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: &SessionId,
    timestamp: &str,
) -> Result<(), RepositoryError> {
    sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
        .bind(timestamp)
        .bind(session_id.as_str())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn session_from_row(row: SqliteRow) -> Result<Session, RepositoryError> {
    Ok(Session {
        id: SessionId(row.try_get("id")?),
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn message_from_row(row: SqliteRow) -> Result<Message, RepositoryError> {
    let role_raw = row.try_get::<String, _>("role")?;
    let role = MessageRole::parse(&role_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown message role `{role_raw}`")))?;

    Ok(Message {
        id: row.try_get("id")?,
        session_id: SessionId(row.try_get("session_id")?),
        role,
        content: row.try_get("content")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn parse_json(column: &str, value: &str) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}
