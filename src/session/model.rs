//! 会话与消息数据模型

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::SessionStatus;
use crate::engine::{Checkpoint, ConfigMap, EngineType};

pub type SessionId = String;

/// 一次模式执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub mode_id: String,
    pub engine_type: EngineType,
    pub task: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    /// 首次进入 Running 时写入，之后不再改变
    pub started_at: Option<DateTime<Utc>>,
    /// 首次进入终态时写入，之后不再改变
    pub completed_at: Option<DateTime<Utc>>,
    pub input_data: Value,
    /// 仅在成功结束时写入一次
    pub output_data: Option<Value>,
    /// 仅在失败时写入
    pub error_message: Option<String>,
    pub checkpoint_data: Option<Checkpoint>,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub workspace_path: PathBuf,
}

impl Session {
    pub fn new(
        mode_id: impl Into<String>,
        engine_type: EngineType,
        task: impl Into<String>,
        input_data: Value,
        workspace_root: &std::path::Path,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let workspace_path = workspace_root.join("sessions").join(&id);
        Self {
            id,
            mode_id: mode_id.into(),
            engine_type,
            task: task.into(),
            status: SessionStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input_data,
            output_data: None,
            error_message: None,
            checkpoint_data: None,
            total_cost: 0.0,
            total_tokens: 0,
            workspace_path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// 审计日志中的一条消息（只追加，不修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub content: String,
    pub metadata: ConfigMap,
    pub sequence_number: u64,
    pub tokens_used: u64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

/// 待追加的消息；序号由调用方分配
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub metadata: ConfigMap,
    pub tokens_used: u64,
    pub cost: f64,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: ConfigMap::new(),
            tokens_used: 0,
            cost: 0.0,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn with_metadata(mut self, metadata: ConfigMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// 负数或 NaN 费用按 0 计
    pub fn with_usage(mut self, tokens: u64, cost: f64) -> Self {
        self.tokens_used = tokens;
        self.cost = if cost.is_finite() && cost > 0.0 { cost } else { 0.0 };
        self
    }

    pub fn into_message(self, session_id: &str, sequence_number: u64) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: self.role,
            content: self.content,
            metadata: self.metadata,
            sequence_number,
            tokens_used: self.tokens_used,
            cost: self.cost,
            created_at: Utc::now(),
        }
    }
}

/// list_sessions 的过滤条件
#[derive(Debug, Clone)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub mode_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self {
            status: None,
            mode_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl SessionFilter {
    pub fn matches(&self, session: &Session) -> bool {
        self.status.map_or(true, |s| session.status == s)
            && self.mode_id.as_deref().map_or(true, |m| session.mode_id == m)
    }
}

/// 一次状态更新：状态与随之写入的字段在同一次调用中生效
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: SessionStatus,
    pub error_message: Option<String>,
    pub output_data: Option<Value>,
}

impl StatusUpdate {
    pub fn to(status: SessionStatus) -> Self {
        Self {
            status,
            error_message: None,
            output_data: None,
        }
    }

    pub fn completed(output: Value) -> Self {
        Self {
            output_data: Some(output),
            ..Self::to(SessionStatus::Completed)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error_message: Some(error.into()),
            ..Self::to(SessionStatus::Failed)
        }
    }
}
