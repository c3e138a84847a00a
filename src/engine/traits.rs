//! 执行引擎抽象
//!
//! 所有后端（单次运行的 agent 后端 / 分阶段的 pipeline 后端 / 测试用 Scripted）实现 Engine：
//! initialize、execute（流式输出）、pause / resume（检查点）、intervene、cleanup、get_cost_estimate。

use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 引擎配置 / 元数据使用的 JSON 对象
pub type ConfigMap = serde_json::Map<String, Value>;

/// 引擎类型标签（注册表的键）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EngineType {
    CmbAgent,
    Denario,
    Kosmos,
    Custom(String),
}

impl EngineType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::CmbAgent => "cmbagent",
            Self::Denario => "denario",
            Self::Kosmos => "kosmos",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for EngineType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "cmbagent" => Self::CmbAgent,
            "denario" => Self::Denario,
            "kosmos" => Self::Kosmos,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for EngineType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<EngineType> for String {
    fn from(t: EngineType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个输出元素的状态；只有最后一个元素是 Completed / Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    Running,
    Completed,
    Failed,
}

impl OutputStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// 费用信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostInfo {
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

/// 产出文件描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
    /// 相对会话工作区产出目录的路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
    pub size: u64,
    /// file / plot / document / markdown
    pub kind: String,
}

/// 引擎输出的单个元素（不直接持久化，由 Orchestrator 转为 Message）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub status: OutputStatus,
    pub content: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub metadata: ConfigMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_info: Option<CostInfo>,
}

impl EngineOutput {
    fn with_status(status: OutputStatus, content: impl Into<String>) -> Self {
        Self {
            status,
            content: content.into(),
            artifacts: Vec::new(),
            metadata: ConfigMap::new(),
            cost_info: None,
        }
    }

    pub fn running(content: impl Into<String>) -> Self {
        Self::with_status(OutputStatus::Running, content)
    }

    pub fn completed(content: impl Into<String>) -> Self {
        Self::with_status(OutputStatus::Completed, content)
    }

    pub fn failed(content: impl Into<String>) -> Self {
        Self::with_status(OutputStatus::Failed, content)
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_cost(mut self, tokens: u64, cost_usd: f64) -> Self {
        self.cost_info = Some(CostInfo { tokens, cost_usd });
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status != OutputStatus::Running
    }
}

/// 引擎定义的不透明检查点；Orchestrator 只负责在 pause / resume 与存储之间搬运
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(pub Value);

impl Checkpoint {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

/// 人工干预：type 字段决定语义，其余字段原样交给引擎
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub data: ConfigMap,
}

impl Intervention {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: ConfigMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// 引擎契约错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Engine has no resumable state")]
    NoResumableState,

    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    #[error("Engine not initialized")]
    NotInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 引擎输出流：有限、非空，且仅最后一个元素为终态
pub type EngineStream<'a> = Pin<Box<dyn Stream<Item = Result<EngineOutput, EngineError>> + Send + 'a>>;

/// 执行引擎 trait
///
/// execute / pause / intervene 只需共享引用：驱动方在流存活期间仍可调用 pause 与 intervene，
/// 引擎内部状态用原子量或锁承载。
#[async_trait]
pub trait Engine: Send + Sync {
    fn engine_type(&self) -> EngineType;

    /// 准备引擎；配置或工作区非法时返回 Initialization
    async fn initialize(
        &mut self,
        session_id: &str,
        workspace_dir: &Path,
        config: ConfigMap,
    ) -> Result<(), EngineError>;

    /// 流式执行。第一个元素必须在任何长时间外部调用完成之前产出
    fn execute<'a>(
        &'a self,
        task: &'a str,
        input_data: &'a Value,
        mode_config: &'a ConfigMap,
    ) -> EngineStream<'a>;

    /// 返回足以恢复执行的检查点
    async fn pause(&self) -> Result<Checkpoint, EngineError>;

    /// 从检查点恢复；必须能在从未 initialize 的新实例上工作
    async fn resume(&mut self, checkpoint: Checkpoint) -> Result<(), EngineError>;

    /// 不支持的干预类型直接忽略
    async fn intervene(&self, intervention: &Intervention) -> Result<(), EngineError>;

    /// 幂等；未 initialize 时也可调用
    async fn cleanup(&mut self) -> Result<(), EngineError>;

    /// 纯启发式估算（美元），不得有网络或计费调用
    fn get_cost_estimate(&self, input_data: &Value) -> f64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_type_tags() {
        assert_eq!(EngineType::from("denario"), EngineType::Denario);
        assert_eq!(EngineType::from("stub"), EngineType::Custom("stub".into()));
        assert_eq!(String::from(EngineType::CmbAgent), "cmbagent");
    }

    #[test]
    fn intervention_flattens_payload() {
        let iv: Intervention =
            serde_json::from_value(serde_json::json!({"type": "modify_idea", "new_value": "x"})).unwrap();
        assert_eq!(iv.kind, "modify_idea");
        assert_eq!(iv.str_field("new_value"), Some("x"));
    }
}
