//! 多智能体后端（cmbagent）
//!
//! 一次 solve 对应一次子进程运行：stdout 每一行转为 running 元素，退出码决定终态。
//! 外部进程无法原地冻结，检查点记录已产出的行数；resume 后重新运行并跳过这些行。

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::engine::command::{
    collect_artifacts, parse_progress_line, preview, read_cost_report, CommandSpec, RunContext,
};
use crate::engine::{
    Checkpoint, ConfigMap, Engine, EngineError, EngineOutput, EngineStream, EngineType, Intervention,
};
use crate::session::workspace;

const DEFAULT_MODE: &str = "planning_and_control";
const DEFAULT_INITIAL_AGENT: &str = "task_improver";
const DEFAULT_MAX_ROUNDS: u64 = 10;

pub struct AgentEngine {
    command: CommandSpec,
    context: Option<RunContext>,
    /// 本次运行已读到的输出行数
    emitted: Arc<AtomicUsize>,
    /// resume 时需要跳过的行数
    replay_skip: usize,
}

impl AgentEngine {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            context: None,
            emitted: Arc::new(AtomicUsize::new(0)),
            replay_skip: 0,
        }
    }

    /// 上传文件清单拼到任务描述后面
    fn file_context(input_data: &Value) -> Option<String> {
        let files = input_data.get("uploaded_files")?.as_array()?;
        if files.is_empty() {
            return None;
        }
        let lines: Vec<String> = files
            .iter()
            .map(|f| {
                let name = f
                    .get("name")
                    .or_else(|| f.get("original_filename"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let path = f.get("path").and_then(Value::as_str).unwrap_or("");
                format!("- {name}: {path}")
            })
            .collect();
        Some(format!("Uploaded files:\n{}", lines.join("\n")))
    }
}

#[async_trait]
impl Engine for AgentEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::CmbAgent
    }

    async fn initialize(
        &mut self,
        session_id: &str,
        workspace_dir: &Path,
        config: ConfigMap,
    ) -> Result<(), EngineError> {
        if !workspace_dir.is_dir() {
            return Err(EngineError::Initialization(format!(
                "workspace {} does not exist",
                workspace_dir.display()
            )));
        }
        let context = RunContext {
            session_id: session_id.to_string(),
            workspace_dir: workspace_dir.to_path_buf(),
            config,
        };
        tokio::fs::create_dir_all(context.outputs_dir()).await?;
        self.command = self.command.overridden_by(&context.config);
        self.context = Some(context);
        Ok(())
    }

    fn execute<'a>(
        &'a self,
        task: &'a str,
        input_data: &'a Value,
        mode_config: &'a ConfigMap,
    ) -> EngineStream<'a> {
        Box::pin(async_stream::stream! {
            yield Ok(EngineOutput::running("Initializing CMBAgent...").with_metadata("step", "initialization"));

            let Some(context) = self.context.as_ref() else {
                yield Err(EngineError::NotInitialized);
                return;
            };

            let mode = mode_config.get("mode").and_then(Value::as_str).unwrap_or(DEFAULT_MODE);
            let initial_agent = mode_config
                .get("initial_agent")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_INITIAL_AGENT);
            let max_rounds = mode_config.get("max_rounds").and_then(Value::as_u64).unwrap_or(DEFAULT_MAX_ROUNDS);
            let full_task = match Self::file_context(input_data) {
                Some(files) => format!("{task}\n\n{files}"),
                None => task.to_string(),
            };

            yield Ok(EngineOutput::running(format!(
                "Starting execution with mode: {mode}, initial agent: {initial_agent}"
            ))
            .with_metadata("mode", mode)
            .with_metadata("initial_agent", initial_agent)
            .with_metadata("max_rounds", max_rounds));

            let outputs = context.outputs_dir();
            let mut cmd = self.command.command();
            cmd.arg("--task").arg(&full_task)
                .arg("--work-dir").arg(&outputs)
                .arg("--mode").arg(mode)
                .arg("--initial-agent").arg(initial_agent)
                .arg("--max-rounds").arg(max_rounds.to_string());
            if let Some(platform) = context.config.get("platform").and_then(Value::as_str) {
                cmd.arg("--platform").arg(platform);
            }
            if let Some(model) = context.config.get("model").and_then(Value::as_str) {
                cmd.arg("--model").arg(model);
            }

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    yield Ok(EngineOutput::failed(format!("CMBAgent execution failed: {e}"))
                        .with_metadata("error", e.to_string()));
                    return;
                }
            };

            // stderr 在后台读完
            let stderr_task = child.stderr.take().map(|mut err| {
                tokio::spawn(async move {
                    let mut tail = String::new();
                    let _ = err.read_to_string(&mut tail).await;
                    tail
                })
            });
            if let Some(stdout) = child.stdout.take() {
                let mut lines = BufReader::new(stdout).lines();
                let mut seen = 0usize;
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            seen += 1;
                            self.emitted.store(seen, Ordering::SeqCst);
                            if seen <= self.replay_skip {
                                continue;
                            }
                            yield Ok(parse_progress_line(&line));
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("Failed to read agent output: {}", e);
                            break;
                        }
                    }
                }
            }

            let status = child.wait().await;
            let cost = read_cost_report(&outputs.join("cost_report.json")).await.unwrap_or_default();
            match status {
                Ok(status) if status.success() => {
                    let artifacts = collect_artifacts(&outputs, |_| Some("file"));
                    yield Ok(EngineOutput::completed(format!(
                        "CMBAgent execution completed successfully.\n\nTask: {task}\n\nCheck the artifacts for detailed results."
                    ))
                    .with_artifacts(artifacts)
                    .with_metadata("mode", mode)
                    .with_metadata("initial_agent", initial_agent)
                    .with_cost(cost.tokens, cost.cost_usd));
                }
                Ok(status) => {
                    let tail = match stderr_task {
                        Some(task) => task.await.unwrap_or_default(),
                        None => String::new(),
                    };
                    let tail = preview(tail.trim(), 500);
                    yield Ok(EngineOutput::failed(format!("CMBAgent execution failed ({status}): {tail}"))
                        .with_metadata("error", tail)
                        .with_cost(cost.tokens, cost.cost_usd));
                }
                Err(e) => {
                    yield Err(EngineError::Execution(e.to_string()));
                }
            }
        })
    }

    async fn pause(&self) -> Result<Checkpoint, EngineError> {
        let context = self.context.as_ref().ok_or(EngineError::NoResumableState)?;
        let mut value = context.to_value();
        value["emitted"] = Value::from(self.emitted.load(Ordering::SeqCst) as u64);
        Ok(Checkpoint(value))
    }

    async fn resume(&mut self, checkpoint: Checkpoint) -> Result<(), EngineError> {
        let context = RunContext::from_value(&checkpoint.0)?;
        self.replay_skip = checkpoint.get("emitted").and_then(Value::as_u64).unwrap_or(0) as usize;
        self.command = self.command.overridden_by(&context.config);
        tokio::fs::create_dir_all(context.outputs_dir()).await?;
        self.context = Some(context);
        Ok(())
    }

    async fn intervene(&self, intervention: &Intervention) -> Result<(), EngineError> {
        // add_context 写入 inputs/interventions.jsonl，由外部进程轮询；其它类型忽略
        if intervention.kind != "add_context" {
            return Ok(());
        }
        let Some(context) = self.context.as_ref() else {
            return Ok(());
        };
        let path = context.workspace_dir.join(workspace::INPUTS).join("interventions.jsonl");
        let mut line = serde_json::to_string(intervention)
            .map_err(|e| EngineError::Execution(e.to_string()))?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), EngineError> {
        self.context = None;
        self.replay_skip = 0;
        Ok(())
    }

    fn get_cost_estimate(&self, input_data: &Value) -> f64 {
        let input_size = input_data.to_string().len() as f64;
        let base = match input_data.get("estimated_complexity").and_then(Value::as_str) {
            Some("simple") => 0.50,
            Some("complex") => 5.00,
            _ => 2.00,
        };
        base * (input_size / 10_000.0).max(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn spec() -> CommandSpec {
        CommandSpec {
            program: "true".into(),
            args: Vec::new(),
        }
    }

    #[test]
    fn estimate_scales_with_complexity() {
        let engine = AgentEngine::new(spec());
        assert!((engine.get_cost_estimate(&serde_json::json!({"estimated_complexity": "simple"})) - 0.5).abs() < 1e-9);
        assert!((engine.get_cost_estimate(&serde_json::json!({})) - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn execute_without_initialize_yields_feedback_then_error() {
        let engine = AgentEngine::new(spec());
        let input = Value::Null;
        let cfg = ConfigMap::new();
        let items: Vec<_> = engine.execute("task", &input, &cfg).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(EngineError::NotInitialized)));
    }

    #[tokio::test]
    async fn checkpoint_restores_on_fresh_instance() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AgentEngine::new(spec());
        engine.initialize("s1", dir.path(), ConfigMap::new()).await.unwrap();
        let checkpoint = engine.pause().await.unwrap();

        let mut fresh = AgentEngine::new(spec());
        fresh.resume(checkpoint).await.unwrap();
        assert_eq!(fresh.context.as_ref().unwrap().session_id, "s1");

        fresh.cleanup().await.unwrap();
        fresh.cleanup().await.unwrap();
        assert!(matches!(fresh.pause().await, Err(EngineError::NoResumableState)));
    }
}
