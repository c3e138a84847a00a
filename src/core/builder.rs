//! Orchestrator 构建器：统一的初始化逻辑
//!
//! 模式目录、引擎注册表、会话存储都可以替换（测试中注入 Scripted 引擎与内存存储）；
//! 未指定的部分按配置构建。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::engine::{ConfigMap, EngineRegistry};
use crate::modes::{CatalogError, ModeCatalog};
use crate::session::{create_session_store, MemorySessionStore, SessionStore};

pub struct OrchestratorBuilder {
    config: AppConfig,
    catalog: Option<ModeCatalog>,
    registry: Option<EngineRegistry>,
    store: Option<Arc<dyn SessionStore>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            catalog: None,
            registry: None,
            store: None,
        }
    }

    pub fn with_catalog(mut self, catalog: ModeCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_registry(mut self, registry: EngineRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.app.workspace_root = root.into();
        self
    }

    /// 内置模式 + [modes].dir 中的模式
    pub fn build_catalog(&self) -> Result<ModeCatalog, CatalogError> {
        let mut catalog = ModeCatalog::with_builtin();
        if let Some(dir) = &self.config.modes.dir {
            let loaded = catalog.load_dir(dir)?;
            tracing::info!("Loaded {} modes from {:?}", loaded, dir);
        }
        Ok(catalog)
    }

    pub fn build_settings(&self) -> OrchestratorSettings {
        let api_keys: ConfigMap = self
            .config
            .engines
            .api_keys
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        OrchestratorSettings {
            workspace_root: self.config.app.workspace_root.clone(),
            stream_buffer: self.config.orchestrator.stream_buffer,
            api_keys,
        }
    }

    /// 按配置构建（SQLite 存储需要异步连接）
    pub async fn build(mut self) -> Result<Orchestrator, CatalogError> {
        let store = match self.store.take() {
            Some(store) => store,
            None => create_session_store(self.config.store.db_path.as_deref()).await,
        };
        self.assemble(store)
    }

    /// 同步构建：未注入存储时使用内存存储
    pub fn build_in_memory(mut self) -> Result<Orchestrator, CatalogError> {
        let store = self
            .store
            .take()
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()) as Arc<dyn SessionStore>);
        self.assemble(store)
    }

    fn assemble(mut self, store: Arc<dyn SessionStore>) -> Result<Orchestrator, CatalogError> {
        let settings = self.build_settings();
        let catalog = match self.catalog.take() {
            Some(catalog) => catalog,
            None => self.build_catalog()?,
        };
        let registry = match self.registry.take() {
            Some(registry) => registry,
            None => EngineRegistry::with_backends(&self.config.engines),
        };
        std::fs::create_dir_all(&settings.workspace_root)?;
        Ok(Orchestrator::new(Arc::new(catalog), Arc::new(registry), store, settings))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace_root(&self) -> &Path {
        &self.config.app.workspace_root
    }
}

/// 便捷函数：从默认路径加载配置并创建构建器
pub fn create_orchestrator_builder(config_path: Option<PathBuf>) -> OrchestratorBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    OrchestratorBuilder::new(config)
}
