//! 模式目录（只读）
//!
//! mode_id -> { 引擎类型、静态引擎配置、干预策略、建议的超时 / 重试 }。
//! 目录在启动时构建完成后不再修改，Orchestrator 只读访问。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{ConfigMap, EngineType};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Mode '{0}' already registered")]
    DuplicateMode(String),

    #[error("Failed to parse mode file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn default_timeout_minutes() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

/// 模式的执行配置；timeout / retries 仅为建议值，不强制执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    #[serde(default)]
    pub engine_config: ConfigMap,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub allow_intervention: bool,
    #[serde(default)]
    pub intervention_points: Vec<String>,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            engine_config: ConfigMap::new(),
            timeout_minutes: default_timeout_minutes(),
            max_retries: default_max_retries(),
            allow_intervention: false,
            intervention_points: Vec::new(),
        }
    }
}

/// 任务模板
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub engine: EngineType,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: ModeConfig,
}

#[derive(Debug, Default)]
pub struct ModeCatalog {
    modes: HashMap<String, Mode>,
}

impl ModeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 含内置模式的目录
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        for mode in super::builtin::builtin_modes() {
            // 内置模式 id 互不相同
            let _ = catalog.register(mode);
        }
        catalog
    }

    pub fn register(&mut self, mode: Mode) -> Result<(), CatalogError> {
        if self.modes.contains_key(&mode.id) {
            return Err(CatalogError::DuplicateMode(mode.id));
        }
        tracing::info!("Registered mode: {} - {}", mode.id, mode.name);
        self.modes.insert(mode.id.clone(), mode);
        Ok(())
    }

    /// 加载目录下所有 *.toml 模式定义，返回加载数量
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, CatalogError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("toml"))
            .collect();
        paths.sort();

        for path in &paths {
            let text = std::fs::read_to_string(path)?;
            let mode: Mode = toml::from_str(&text).map_err(|e| CatalogError::Parse {
                path: path.clone(),
                message: e.to_string(),
            })?;
            self.register(mode)?;
        }
        Ok(paths.len())
    }

    pub fn get(&self, mode_id: &str) -> Option<&Mode> {
        self.modes.get(mode_id)
    }

    /// 按 id 排序
    pub fn list_all(&self) -> Vec<&Mode> {
        let mut modes: Vec<&Mode> = self.modes.values().collect();
        modes.sort_by(|a, b| a.id.cmp(&b.id));
        modes
    }

    pub fn list_by_category(&self, category: &str) -> Vec<&Mode> {
        self.list_all().into_iter().filter(|m| m.category == category).collect()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_mode_rejected() {
        let mut catalog = ModeCatalog::with_builtin();
        let research = catalog.get("research").cloned().unwrap();
        assert!(matches!(catalog.register(research), Err(CatalogError::DuplicateMode(_))));
    }

    #[test]
    fn load_dir_reads_toml_modes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("summarize.toml"),
            r#"
            id = "summarize"
            name = "Summarize"
            category = "analysis"
            engine = "cmbagent"

            [config]
            allow_intervention = true

            [config.engine_config]
            mode = "one_shot"
            "#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut catalog = ModeCatalog::new();
        assert_eq!(catalog.load_dir(dir.path()).unwrap(), 1);
        let mode = catalog.get("summarize").unwrap();
        assert_eq!(mode.engine, EngineType::CmbAgent);
        assert_eq!(mode.config.timeout_minutes, 60);
        assert!(mode.config.allow_intervention);
        assert_eq!(mode.config.engine_config.get("mode").and_then(|v| v.as_str()), Some("one_shot"));
    }

    #[test]
    fn bad_mode_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.toml"), "id = ").unwrap();
        let mut catalog = ModeCatalog::new();
        assert!(matches!(catalog.load_dir(dir.path()), Err(CatalogError::Parse { .. })));
    }
}
