//! 编排层错误类型
//!
//! NotFound / InvalidState / 注册表错误在公开操作中立即返回给调用方；
//! 驱动启动之后的故障不会再抛给调用方，而是写入会话的 error_message。

use thiserror::Error;

use crate::core::state::SessionStatus;
use crate::engine::{EngineError, RegistryError};
use crate::session::StoreError;

/// Orchestrator 公开操作返回的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// 当前状态不允许该操作（如对非 Running 会话 pause）
    #[error("Invalid state: session is {current}, cannot move to {requested}")]
    InvalidState {
        current: SessionStatus,
        requested: SessionStatus,
    },

    #[error("Engine initialization failed: {0}")]
    Initialization(String),

    #[error("Engine execution failed: {0}")]
    EngineExecution(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Session '{0}' already has an active driver")]
    AlreadyDriving(String),

    #[error("Session '{0}' has no active driver")]
    NoActiveDriver(String),

    #[error("Mode '{0}' does not allow intervention")]
    InterventionNotAllowed(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] std::io::Error),
}

impl OrchestratorError {
    pub(crate) fn session_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "Session",
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SessionNotFound(id) => Self::NotFound { kind: "Session", id },
            StoreError::InvalidTransition { from, to } => Self::InvalidState {
                current: from,
                requested: to,
            },
            other => Self::Store(other),
        }
    }
}

impl From<EngineError> for OrchestratorError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Initialization(msg) => Self::Initialization(msg),
            other => Self::EngineExecution(other.to_string()),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
