//! Tomas - 会话执行编排器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、会话状态机、驱动监管、编排器与构建器
//! - **engine**: 执行引擎契约、注册表与后端（agent / pipeline / scripted）
//! - **modes**: 模式目录与内置模式
//! - **observability**: 日志初始化
//! - **session**: 会话 / 消息模型、会话存储（内存 / SQLite）、工作区
//! - **transport**: 流式事件渲染（SSE 帧 / 后台收集）

pub mod config;
pub mod core;
pub mod engine;
pub mod modes;
pub mod observability;
pub mod session;
pub mod transport;

pub use crate::core::{Orchestrator, OrchestratorBuilder, OrchestratorError, SessionEvent, SessionStatus};
pub use crate::engine::{Engine, EngineOutput, EngineRegistry, EngineType};
pub use crate::transport::StreamEvent;
