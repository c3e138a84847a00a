//! SQLite 会话存储
//!
//! 会话、消息、检查点持久化到 SQLite，进程重启后仍可查询与恢复。

#![cfg(feature = "async-sqlite")]

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::model::{Message, MessageRole, NewMessage, Session, SessionFilter, StatusUpdate};
use super::store::{apply_status_update, SessionStore, StoreError, StoreResult};
use crate::core::SessionStatus;
use crate::engine::{Checkpoint, EngineType};

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

const SESSION_COLUMNS: &str = "id, mode_id, engine_type, task, status, created_at, started_at, completed_at, \
     input_data, output_data, error_message, checkpoint_data, total_cost, total_tokens, workspace_path";

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                mode_id TEXT NOT NULL,
                engine_type TEXT NOT NULL,
                task TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                input_data TEXT NOT NULL,
                output_data TEXT,
                error_message TEXT,
                checkpoint_data TEXT,
                total_cost REAL NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                workspace_path TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE (session_id, sequence_number),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_mode ON sessions(mode_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn fetch_session<'e, E>(executor: E, session_id: &str) -> StoreResult<Option<Session>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"))
            .bind(session_id)
            .fetch_optional(executor)
            .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }
}

fn parse_time(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("bad timestamp {s}: {e}")))
}

fn parse_opt_time(s: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_time).transpose()
}

fn session_from_row(row: &SqliteRow) -> StoreResult<Session> {
    let status: String = row.get("status");
    let status: SessionStatus = status.parse().map_err(StoreError::Database)?;
    let engine_type: String = row.get("engine_type");
    let created_at: String = row.get("created_at");
    let input_data: String = row.get("input_data");
    let output_data: Option<String> = row.get("output_data");
    let checkpoint_data: Option<String> = row.get("checkpoint_data");
    let total_tokens: i64 = row.get("total_tokens");
    let workspace_path: String = row.get("workspace_path");

    Ok(Session {
        id: row.get("id"),
        mode_id: row.get("mode_id"),
        engine_type: EngineType::from(engine_type),
        task: row.get("task"),
        status,
        created_at: parse_time(&created_at)?,
        started_at: parse_opt_time(row.get("started_at"))?,
        completed_at: parse_opt_time(row.get("completed_at"))?,
        input_data: serde_json::from_str(&input_data)?,
        output_data: output_data.map(|s| serde_json::from_str(&s)).transpose()?,
        error_message: row.get("error_message"),
        checkpoint_data: checkpoint_data.map(|s| serde_json::from_str(&s)).transpose()?,
        total_cost: row.get("total_cost"),
        total_tokens: total_tokens.max(0) as u64,
        workspace_path: PathBuf::from(workspace_path),
    })
}

fn message_from_row(row: &SqliteRow) -> StoreResult<Message> {
    let role: String = row.get("role");
    let role = MessageRole::parse(&role).ok_or_else(|| StoreError::Database(format!("unknown role: {role}")))?;
    let metadata: String = row.get("metadata");
    let created_at: String = row.get("created_at");
    let sequence_number: i64 = row.get("sequence_number");
    let tokens_used: i64 = row.get("tokens_used");

    Ok(Message {
        id: row.get("id"),
        session_id: row.get("session_id"),
        role,
        content: row.get("content"),
        metadata: serde_json::from_str(&metadata)?,
        sequence_number: sequence_number as u64,
        tokens_used: tokens_used.max(0) as u64,
        cost: row.get("cost"),
        created_at: parse_time(&created_at)?,
    })
}

fn json_opt<T: serde::Serialize>(value: &Option<T>) -> StoreResult<Option<String>> {
    value.as_ref().map(serde_json::to_string).transpose().map_err(StoreError::from)
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, session: Session) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO sessions (id, mode_id, engine_type, task, status, created_at, started_at, completed_at,
                input_data, output_data, error_message, checkpoint_data, total_cost, total_tokens, workspace_path)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.mode_id)
        .bind(session.engine_type.as_str())
        .bind(&session.task)
        .bind(session.status.as_str())
        .bind(session.created_at.to_rfc3339())
        .bind(session.started_at.map(|t| t.to_rfc3339()))
        .bind(session.completed_at.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&session.input_data)?)
        .bind(json_opt(&session.output_data)?)
        .bind(&session.error_message)
        .bind(json_opt(&session.checkpoint_data)?)
        .bind(session.total_cost)
        .bind(session.total_tokens as i64)
        .bind(session.workspace_path.to_string_lossy().to_string())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StoreError::DuplicateSession(session.id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        Self::fetch_session(&self.pool, session_id).await
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<Session>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE (? IS NULL OR status = ?) AND (? IS NULL OR mode_id = ?)
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.mode_id.as_deref())
        .bind(filter.mode_id.as_deref())
        .bind(filter.limit as i64)
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn update_status(&self, session_id: &str, update: StatusUpdate) -> StoreResult<Session> {
        let mut tx = self.pool.begin().await?;
        let mut session = Self::fetch_session(&mut *tx, session_id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let previous = session.status;
        apply_status_update(&mut session, update)?;

        let result = sqlx::query(
            "UPDATE sessions SET status = ?, started_at = ?, completed_at = ?, output_data = ?, error_message = ?
             WHERE id = ? AND status = ?",
        )
        .bind(session.status.as_str())
        .bind(session.started_at.map(|t| t.to_rfc3339()))
        .bind(session.completed_at.map(|t| t.to_rfc3339()))
        .bind(json_opt(&session.output_data)?)
        .bind(&session.error_message)
        .bind(session_id)
        .bind(previous.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // 并发修改：以数据库中的当前状态报告
            let current = Self::fetch_session(&mut *tx, session_id)
                .await?
                .map(|s| s.status)
                .unwrap_or(previous);
            return Err(StoreError::InvalidTransition {
                from: current,
                to: session.status,
            });
        }
        tx.commit().await?;
        Ok(session)
    }

    async fn append_message(
        &self,
        session_id: &str,
        sequence_number: u64,
        message: NewMessage,
    ) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }

        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?;
        let expected = row.get::<i64, _>("n") as u64;
        if sequence_number != expected {
            return Err(StoreError::SequenceConflict {
                session_id: session_id.to_string(),
                expected,
                got: sequence_number,
            });
        }

        let message = message.into_message(session_id, sequence_number);
        sqlx::query(
            "INSERT INTO messages (id, session_id, role, content, metadata, sequence_number, tokens_used, cost, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(serde_json::to_string(&message.metadata)?)
        .bind(message.sequence_number as i64)
        .bind(message.tokens_used as i64)
        .bind(message.cost)
        .bind(message.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sessions SET total_tokens = total_tokens + ?, total_cost = total_cost + ? WHERE id = ?")
            .bind(message.tokens_used as i64)
            .bind(message.cost)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn next_sequence_number(&self, session_id: &str) -> StoreResult<u64> {
        if Self::fetch_session(&self.pool, session_id).await?.is_none() {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn messages(&self, session_id: &str, offset: usize, limit: Option<usize>) -> StoreResult<Vec<Message>> {
        if Self::fetch_session(&self.pool, session_id).await?.is_none() {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        // SQLite 中 LIMIT -1 表示不限
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(
            "SELECT id, session_id, role, content, metadata, sequence_number, tokens_used, cost, created_at
             FROM messages WHERE session_id = ? ORDER BY sequence_number ASC LIMIT ? OFFSET ?",
        )
        .bind(session_id)
        .bind(limit)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn save_checkpoint(&self, session_id: &str, checkpoint: Checkpoint) -> StoreResult<()> {
        let result = sqlx::query("UPDATE sessions SET checkpoint_data = ? WHERE id = ?")
            .bind(serde_json::to_string(&checkpoint)?)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn load_checkpoint(&self, session_id: &str) -> StoreResult<Option<Checkpoint>> {
        Self::fetch_session(&self.pool, session_id)
            .await?
            .map(|s| s.checkpoint_data)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    async fn delete_session(&self, session_id: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
