//! 执行引擎：契约、注册表与内置后端

pub mod agent;
pub mod command;
pub mod pipeline;
pub mod registry;
pub mod scripted;
pub mod traits;

pub use agent::AgentEngine;
pub use pipeline::PipelineEngine;
pub use registry::{EngineFactory, EngineRegistry, RegistryError};
pub use scripted::{ScriptTally, ScriptStep, ScriptedEngine};
pub use traits::{
    Artifact, Checkpoint, ConfigMap, CostInfo, Engine, EngineError, EngineOutput, EngineStream, EngineType,
    Intervention, OutputStatus,
};
