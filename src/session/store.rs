//! 会话存储抽象层
//!
//! 定义统一的会话 / 消息 / 检查点存储接口，支持内存和 SQLite 两种实现。
//! 状态迁移在存储内部校验：同一次调用里完成「检查当前状态 + 写入新状态与时间戳」。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;

use super::model::{Message, NewMessage, Session, SessionFilter, StatusUpdate};
use crate::core::SessionStatus;
use crate::engine::Checkpoint;

#[cfg(feature = "async-sqlite")]
use super::sqlite::SqliteSessionStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: SessionStatus, to: SessionStatus },

    #[error("Sequence conflict for session {session_id}: expected {expected}, got {got}")]
    SequenceConflict {
        session_id: String,
        expected: u64,
        got: u64,
    },

    #[error("Output already set for session {0}")]
    OutputAlreadySet(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: Session) -> StoreResult<()>;

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>>;

    /// 按创建时间倒序
    async fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<Session>>;

    /// 原子地校验迁移并写入状态、started_at / completed_at、输出或错误信息
    async fn update_status(&self, session_id: &str, update: StatusUpdate) -> StoreResult<Session>;

    /// 追加消息并把 tokens / cost 累加到会话总计；sequence_number 必须恰好是下一个序号
    async fn append_message(&self, session_id: &str, sequence_number: u64, message: NewMessage)
        -> StoreResult<Message>;

    async fn next_sequence_number(&self, session_id: &str) -> StoreResult<u64>;

    /// 按序号升序的区间读取
    async fn messages(&self, session_id: &str, offset: usize, limit: Option<usize>) -> StoreResult<Vec<Message>>;

    async fn save_checkpoint(&self, session_id: &str, checkpoint: Checkpoint) -> StoreResult<()>;

    async fn load_checkpoint(&self, session_id: &str) -> StoreResult<Option<Checkpoint>>;

    /// 删除会话及其消息；返回是否存在
    async fn delete_session(&self, session_id: &str) -> StoreResult<bool>;
}

/// 在会话上应用一次状态更新（两种存储共用）
pub(crate) fn apply_status_update(session: &mut Session, update: StatusUpdate) -> StoreResult<()> {
    if !session.status.can_transition_to(update.status) {
        return Err(StoreError::InvalidTransition {
            from: session.status,
            to: update.status,
        });
    }
    if update.output_data.is_some() && session.output_data.is_some() {
        return Err(StoreError::OutputAlreadySet(session.id.clone()));
    }
    let now = Utc::now();
    if update.status == SessionStatus::Running && session.started_at.is_none() {
        session.started_at = Some(now);
    }
    if update.status.is_terminal() && session.completed_at.is_none() {
        session.completed_at = Some(now);
    }
    if let Some(output) = update.output_data {
        session.output_data = Some(output);
    }
    if let Some(error) = update.error_message {
        session.error_message = Some(error);
    }
    session.status = update.status;
    Ok(())
}

#[derive(Default)]
struct SessionRecord {
    session: Option<Session>,
    messages: Vec<Message>,
}

/// 内存会话存储
#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, session: Session) -> StoreResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&session.id) {
            return Err(StoreError::DuplicateSession(session.id));
        }
        records.insert(
            session.id.clone(),
            SessionRecord {
                session: Some(session),
                messages: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let records = self.records.read().await;
        Ok(records.get(session_id).and_then(|r| r.session.clone()))
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<Session>> {
        let records = self.records.read().await;
        let mut sessions: Vec<Session> = records
            .values()
            .filter_map(|r| r.session.as_ref())
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions.into_iter().skip(filter.offset).take(filter.limit).collect())
    }

    async fn update_status(&self, session_id: &str, update: StatusUpdate) -> StoreResult<Session> {
        let mut records = self.records.write().await;
        let session = records
            .get_mut(session_id)
            .and_then(|r| r.session.as_mut())
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        apply_status_update(session, update)?;
        Ok(session.clone())
    }

    async fn append_message(
        &self,
        session_id: &str,
        sequence_number: u64,
        message: NewMessage,
    ) -> StoreResult<Message> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(session_id)
            .filter(|r| r.session.is_some())
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let expected = record.messages.len() as u64;
        if sequence_number != expected {
            return Err(StoreError::SequenceConflict {
                session_id: session_id.to_string(),
                expected,
                got: sequence_number,
            });
        }
        let message = message.into_message(session_id, sequence_number);
        if let Some(session) = record.session.as_mut() {
            session.total_tokens += message.tokens_used;
            session.total_cost += message.cost;
        }
        record.messages.push(message.clone());
        Ok(message)
    }

    async fn next_sequence_number(&self, session_id: &str) -> StoreResult<u64> {
        let records = self.records.read().await;
        records
            .get(session_id)
            .map(|r| r.messages.len() as u64)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    async fn messages(&self, session_id: &str, offset: usize, limit: Option<usize>) -> StoreResult<Vec<Message>> {
        let records = self.records.read().await;
        let record = records
            .get(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let iter = record.messages.iter().skip(offset).cloned();
        Ok(match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    async fn save_checkpoint(&self, session_id: &str, checkpoint: Checkpoint) -> StoreResult<()> {
        let mut records = self.records.write().await;
        let session = records
            .get_mut(session_id)
            .and_then(|r| r.session.as_mut())
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        session.checkpoint_data = Some(checkpoint);
        Ok(())
    }

    async fn load_checkpoint(&self, session_id: &str) -> StoreResult<Option<Checkpoint>> {
        let records = self.records.read().await;
        let session = records
            .get(session_id)
            .and_then(|r| r.session.as_ref())
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        Ok(session.checkpoint_data.clone())
    }

    async fn delete_session(&self, session_id: &str) -> StoreResult<bool> {
        Ok(self.records.write().await.remove(session_id).is_some())
    }
}

/// 创建会话存储
///
/// 如果提供了 db_path 且启用了 async-sqlite feature，则使用 SQLite 存储；否则使用内存存储
pub async fn create_session_store(db_path: Option<&std::path::Path>) -> Arc<dyn SessionStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match SqliteSessionStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using persistent session store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to create persistent store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("Persistent session store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory session store");
    Arc::new(MemorySessionStore::new())
}
