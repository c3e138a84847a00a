//! 核心编排层：错误、会话状态机、驱动监管、编排器与构建器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;

pub use builder::{create_orchestrator_builder, OrchestratorBuilder};
pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{
    merge_engine_config, Orchestrator, OrchestratorSettings, SessionEvent, SessionEventStream, TaskStatus,
};
pub use session_supervisor::{DriverControl, DriverHandle, DriverStatus, SessionSupervisor};
pub use state::SessionStatus;
