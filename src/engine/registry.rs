//! 引擎注册表
//!
//! 引擎类型标签 -> 零参数构造函数。注册只增不改：重复注册返回 DuplicateEngine；
//! 启动时加载失败的后端记录在 load_failures 中，获取时返回 UnknownEngine，不影响进程。

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::config::EnginesSection;
use crate::engine::agent::AgentEngine;
use crate::engine::command::CommandSpec;
use crate::engine::pipeline::PipelineEngine;
use crate::engine::{Engine, EngineType};

/// 引擎构造函数
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn Engine> + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Engine '{0}' is already registered")]
    DuplicateEngine(EngineType),

    #[error("Unknown engine type: {engine_type} ({reason})")]
    UnknownEngine { engine_type: EngineType, reason: String },
}

/// 引擎注册表：由调用方构造后注入 Orchestrator
#[derive(Default)]
pub struct EngineRegistry {
    factories: HashMap<EngineType, EngineFactory>,
    load_failures: HashMap<EngineType, String>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置注册内置的两个子进程后端；找不到可执行文件的后端只记录失败原因
    pub fn with_backends(engines: &EnginesSection) -> Self {
        let mut registry = Self::new();

        match CommandSpec::resolve(&engines.cmbagent.program, &engines.cmbagent.args) {
            Ok(spec) => {
                let _ = registry.register_engine(EngineType::CmbAgent, move || -> Box<dyn Engine> {
                    Box::new(AgentEngine::new(spec.clone()))
                });
            }
            Err(reason) => registry.record_load_failure(EngineType::CmbAgent, reason),
        }

        match CommandSpec::resolve(&engines.denario.program, &engines.denario.args) {
            Ok(spec) => {
                let _ = registry.register_engine(EngineType::Denario, move || -> Box<dyn Engine> {
                    Box::new(PipelineEngine::new(spec.clone()))
                });
            }
            Err(reason) => registry.record_load_failure(EngineType::Denario, reason),
        }

        registry
    }

    pub fn register_engine<F>(&mut self, engine_type: EngineType, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Box<dyn Engine> + Send + Sync + 'static,
    {
        if self.factories.contains_key(&engine_type) {
            return Err(RegistryError::DuplicateEngine(engine_type));
        }
        self.load_failures.remove(&engine_type);
        tracing::info!("Registered engine: {}", engine_type);
        self.factories.insert(engine_type, Arc::new(factory));
        Ok(())
    }

    pub fn record_load_failure(&mut self, engine_type: EngineType, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("Engine {} not available: {}", engine_type, reason);
        self.load_failures.insert(engine_type, reason);
    }

    /// 构造一个新的引擎实例（每次调用都是独立实例，不跨会话共享）
    pub fn get_engine(&self, engine_type: &EngineType) -> Result<Box<dyn Engine>, RegistryError> {
        if let Some(factory) = self.factories.get(engine_type) {
            return Ok(factory());
        }
        let reason = self
            .load_failures
            .get(engine_type)
            .map(|r| format!("failed to load: {r}"))
            .unwrap_or_else(|| format!("available engines: {:?}", self.list_engines()));
        Err(RegistryError::UnknownEngine {
            engine_type: engine_type.clone(),
            reason,
        })
    }

    pub fn is_registered(&self, engine_type: &EngineType) -> bool {
        self.factories.contains_key(engine_type)
    }

    pub fn list_engines(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().map(|t| t.to_string()).collect();
        names.sort();
        names
    }

    pub fn load_failures(&self) -> &HashMap<EngineType, String> {
        &self.load_failures
    }
}
