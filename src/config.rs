//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TOMAS__*` 覆盖（双下划线表示嵌套，如 `TOMAS__STORE__DB_PATH=tomas.db`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub store: StoreSection,
    pub orchestrator: OrchestratorSection,
    pub engines: EnginesSection,
    pub modes: ModesSection,
}

/// [app] 段：应用名、会话工作区根目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            workspace_root: default_workspace_root(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("./workspaces")
}

/// [store] 段：设置 db_path 且启用 async-sqlite 时使用 SQLite，否则内存存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    pub db_path: Option<PathBuf>,
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 流式执行时驱动任务与消费者之间的缓冲元素数
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            stream_buffer: default_stream_buffer(),
        }
    }
}

fn default_stream_buffer() -> usize {
    32
}

/// [engines] 段：外部框架 API Key 与两个子进程后端的命令
#[derive(Debug, Clone, Deserialize)]
pub struct EnginesSection {
    /// 合并进每个会话的引擎配置（如 openai_api_key），会话级配置可覆盖
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    #[serde(default = "default_cmbagent")]
    pub cmbagent: CommandSection,
    #[serde(default = "default_denario")]
    pub denario: CommandSection,
}

impl Default for EnginesSection {
    fn default() -> Self {
        Self {
            api_keys: HashMap::new(),
            cmbagent: default_cmbagent(),
            denario: default_denario(),
        }
    }
}

/// [engines.<tag>] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CommandSection {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_cmbagent() -> CommandSection {
    CommandSection {
        program: "cmbagent".to_string(),
        args: Vec::new(),
    }
}

fn default_denario() -> CommandSection {
    CommandSection {
        program: "denario".to_string(),
        args: Vec::new(),
    }
}

/// [modes] 段：额外模式定义目录（*.toml），内置模式总是加载
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModesSection {
    pub dir: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 TOMAS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TOMAS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TOMAS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
