//! 子进程后端公共部分
//!
//! 外部框架以命令行程序形式接入：定位可执行文件、构造命令、解析输出行、收集产出文件与费用报告。

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::engine::{Artifact, ConfigMap, CostInfo, EngineError, EngineOutput};
use crate::session::workspace;

/// 外部程序 + 固定参数
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// 在 PATH 中定位程序；失败时返回可读的原因（注册表记录为加载失败）
    pub fn resolve(program: &str, args: &[String]) -> Result<Self, String> {
        let program = which::which(program).map_err(|e| format!("{program}: {e}"))?;
        Ok(Self {
            program,
            args: args.to_vec(),
        })
    }

    /// 会话级配置中的 program / args 覆盖默认值
    pub fn overridden_by(&self, config: &ConfigMap) -> Self {
        let program = config
            .get("program")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.program.clone());
        let args = config
            .get("args")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_else(|| self.args.clone());
        Self { program, args }
    }

    /// stdout / stderr 走管道，drop 时杀掉子进程
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// initialize 或 resume 之后引擎持有的会话信息
#[derive(Debug, Clone)]
pub struct RunContext {
    pub session_id: String,
    pub workspace_dir: PathBuf,
    pub config: ConfigMap,
}

impl RunContext {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "session_id": self.session_id,
            "workspace_dir": self.workspace_dir,
            "config": self.config,
        })
    }

    pub fn from_value(value: &Value) -> Result<Self, EngineError> {
        let session_id = value
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::InvalidCheckpoint("missing session_id".into()))?;
        let workspace_dir = value
            .get("workspace_dir")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::InvalidCheckpoint("missing workspace_dir".into()))?;
        let config = value
            .get("config")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            session_id: session_id.to_string(),
            workspace_dir: PathBuf::from(workspace_dir),
            config,
        })
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.workspace_dir.join(workspace::OUTPUTS)
    }
}

#[derive(Deserialize)]
struct ProgressLine {
    content: String,
    #[serde(default)]
    tokens: u64,
    #[serde(default)]
    cost_usd: f64,
    #[serde(default)]
    metadata: ConfigMap,
}

/// 子进程输出的一行 -> running 元素；JSON 行可携带 content / tokens / cost_usd / metadata
pub fn parse_progress_line(line: &str) -> EngineOutput {
    match serde_json::from_str::<ProgressLine>(line) {
        Ok(p) => {
            let mut output = EngineOutput::running(p.content);
            output.metadata = p.metadata;
            if p.tokens > 0 || p.cost_usd > 0.0 {
                output.cost_info = Some(CostInfo {
                    tokens: p.tokens,
                    cost_usd: p.cost_usd,
                });
            }
            output
        }
        Err(_) => EngineOutput::running(line.to_string()),
    }
}

/// 递归收集目录下的文件（跳过隐藏文件与 __pycache__）
pub fn collect_artifacts(dir: &Path, kind_of: impl Fn(&Path) -> Option<&'static str>) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    if !dir.is_dir() {
        return artifacts;
    }
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || path.components().any(|c| c.as_os_str() == "__pycache__") {
            continue;
        }
        let Some(kind) = kind_of(path) else { continue };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        artifacts.push(Artifact {
            name,
            path: path.to_path_buf(),
            relative_path: path
                .strip_prefix(dir)
                .ok()
                .map(|p| p.to_string_lossy().to_string()),
            size,
            kind: kind.to_string(),
        });
    }
    artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    artifacts
}

#[derive(Deserialize)]
struct CostReport {
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    total_cost: f64,
}

/// 读取外部框架写出的费用报告；不存在或格式不对时返回 None
pub async fn read_cost_report(path: &Path) -> Option<CostInfo> {
    let data = tokio::fs::read_to_string(path).await.ok()?;
    let report: CostReport = serde_json::from_str(&data).ok()?;
    Some(CostInfo {
        tokens: report.total_tokens,
        cost_usd: report.total_cost,
    })
}

/// 截断到 max 个字符，超出时追加 "..."
pub fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}
