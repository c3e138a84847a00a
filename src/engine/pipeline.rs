//! 分阶段科研流水线后端（denario）
//!
//! idea -> methodology -> results -> paper 四个阶段，每个阶段是一次子进程调用，stdout 即阶段文本。
//! 已完成的阶段记录在检查点中，resume 后从下一个阶段继续。paper 阶段失败时仍以 completed 结束。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::command::{collect_artifacts, preview, CommandSpec, RunContext};
use crate::engine::{
    Checkpoint, ConfigMap, Engine, EngineError, EngineOutput, EngineStream, EngineType, Intervention,
};

const PROJECT_DIR: &str = "research_project";
const INPUT_DIR: &str = "input_files";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idea,
    Methodology,
    Results,
    Paper,
}

impl Stage {
    const ALL: [Stage; 4] = [Stage::Idea, Stage::Methodology, Stage::Results, Stage::Paper];

    fn command(self) -> &'static str {
        match self {
            Stage::Idea => "idea",
            Stage::Methodology => "methodology",
            Stage::Results => "results",
            Stage::Paper => "paper",
        }
    }

    fn started(self) -> &'static str {
        match self {
            Stage::Idea => "Generating research idea...",
            Stage::Methodology => "Developing research methodology...",
            Stage::Results => "Executing research and analyzing results...",
            Stage::Paper => "Generating research paper...",
        }
    }

    fn finished(self) -> &'static str {
        match self {
            Stage::Idea => "Research idea generated",
            Stage::Methodology => "Methodology developed",
            Stage::Results => "Results obtained",
            Stage::Paper => "Paper generated",
        }
    }
}

/// 流水线的累积产出
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Research {
    #[serde(default)]
    data_description: String,
    #[serde(default)]
    idea: String,
    #[serde(default)]
    methodology: String,
    #[serde(default)]
    results: String,
    /// 已完成的阶段数
    #[serde(default)]
    completed: usize,
}

impl Research {
    fn record(&mut self, stage: Stage, text: String) {
        match stage {
            Stage::Idea => self.idea = text,
            Stage::Methodology => self.methodology = text,
            Stage::Results => self.results = text,
            Stage::Paper => {}
        }
        self.completed += 1;
    }
}

pub struct PipelineEngine {
    command: CommandSpec,
    context: Option<RunContext>,
    research: Arc<Mutex<Research>>,
}

impl PipelineEngine {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            context: None,
            research: Arc::new(Mutex::new(Research::default())),
        }
    }

    fn project_dir(workspace: &Path) -> PathBuf {
        workspace.join(PROJECT_DIR)
    }

    fn snapshot(&self) -> Research {
        self.research.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn update(&self, f: impl FnOnce(&mut Research)) {
        if let Ok(mut research) = self.research.lock() {
            f(&mut research);
        }
    }

    async fn write_input(project_dir: &Path, file: &str, text: &str) -> Result<(), EngineError> {
        let dir = project_dir.join(INPUT_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(file), text).await?;
        Ok(())
    }

    async fn run_stage(&self, stage: Stage, project_dir: &Path, backend: &str) -> Result<String, String> {
        let output = self
            .command
            .command()
            .arg(stage.command())
            .arg("--project-dir")
            .arg(project_dir)
            .arg("--backend")
            .arg(backend)
            .output()
            .await
            .map_err(|e| e.to_string())?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("{} ({})", preview(stderr.trim(), 500), output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn artifact_kind(path: &Path) -> Option<&'static str> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("png") | Some("jpg") | Some("jpeg") | Some("svg") => Some("plot"),
            Some("pdf") => Some("document"),
            Some("md") => Some("markdown"),
            _ => None,
        }
    }

    fn summary_metadata(output: EngineOutput, research: &Research) -> EngineOutput {
        output
            .with_metadata("idea", research.idea.as_str())
            .with_metadata("methodology", research.methodology.as_str())
            .with_metadata("results", research.results.as_str())
    }
}

#[async_trait]
impl Engine for PipelineEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::Denario
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
        let project_dir = Self::project_dir(workspace_dir);
        let clear = config.get("clear_project_dir").and_then(Value::as_bool).unwrap_or(false);
        if clear && project_dir.exists() {
            tokio::fs::remove_dir_all(&project_dir).await?;
        }
        tokio::fs::create_dir_all(&project_dir).await?;

        self.command = self.command.overridden_by(&config);
        self.context = Some(RunContext {
            session_id: session_id.to_string(),
            workspace_dir: workspace_dir.to_path_buf(),
            config,
        });
        self.update(|r| *r = Research::default());
        Ok(())
    }

    fn execute<'a>(
        &'a self,
        task: &'a str,
        _input_data: &'a Value,
        mode_config: &'a ConfigMap,
    ) -> EngineStream<'a> {
        Box::pin(async_stream::stream! {
            let backend = mode_config
                .get("backend")
                .and_then(Value::as_str)
                .unwrap_or("fast")
                .to_string();
            yield Ok(EngineOutput::running(format!(
                "Initializing Denario research pipeline with {backend} backend..."
            ))
            .with_metadata("step", "initialization")
            .with_metadata("backend", backend.as_str()));

            let Some(context) = self.context.as_ref() else {
                yield Err(EngineError::NotInitialized);
                return;
            };
            let project_dir = Self::project_dir(&context.workspace_dir);

            if self.snapshot().completed == 0 {
                yield Ok(EngineOutput::running("Setting up research context...")
                    .with_metadata("step", "data_description"));
                if let Err(e) = Self::write_input(&project_dir, "data_description.md", task).await {
                    yield Err(e);
                    return;
                }
                self.update(|r| r.data_description = task.to_string());
            }

            let start = self.snapshot().completed;
            for stage in Stage::ALL.into_iter().skip(start) {
                yield Ok(EngineOutput::running(stage.started())
                    .with_metadata("step", stage.command())
                    .with_metadata("backend", backend.as_str()));

                match self.run_stage(stage, &project_dir, &backend).await {
                    Ok(text) => {
                        let shown = preview(&text, 500);
                        self.update(|r| r.record(stage, text));
                        if stage != Stage::Paper {
                            yield Ok(EngineOutput::running(format!("{}:\n\n{}", stage.finished(), shown))
                                .with_metadata("step", format!("{}_generated", stage.command())));
                        }
                    }
                    Err(e) if stage == Stage::Paper => {
                        tracing::warn!("Paper generation failed: {}", e);
                        let research = self.snapshot();
                        let artifacts = collect_artifacts(&project_dir, Self::artifact_kind);
                        let content = format!(
                            "Research completed (paper generation encountered issues):\n\n**Idea:** {}\n\n**Results:** {}\n\nNote: {}",
                            research.idea,
                            preview(&research.results, 500),
                            e
                        );
                        yield Ok(Self::summary_metadata(EngineOutput::completed(content), &research)
                            .with_artifacts(artifacts)
                            .with_metadata("paper_generation_error", e)
                            .with_cost(0, 0.0));
                        return;
                    }
                    Err(e) => {
                        yield Ok(EngineOutput::failed(format!("Failed at {} stage: {}", stage.command(), e))
                            .with_metadata("error", e)
                            .with_metadata("step", stage.command()));
                        return;
                    }
                }
            }

            let research = self.snapshot();
            let artifacts = collect_artifacts(&project_dir, Self::artifact_kind);
            let content = format!(
                "Research completed successfully!\n\n**Idea:** {}\n\n**Methodology:** {}\n\n**Results:** {}\n\nCheck artifacts for plots and the full research paper.",
                research.idea,
                preview(&research.methodology, 300),
                preview(&research.results, 300)
            );
            yield Ok(Self::summary_metadata(EngineOutput::completed(content), &research)
                .with_artifacts(artifacts)
                .with_cost(0, 0.0));
        })
    }

    async fn pause(&self) -> Result<Checkpoint, EngineError> {
        let context = self.context.as_ref().ok_or(EngineError::NoResumableState)?;
        let research =
            serde_json::to_value(self.snapshot()).map_err(|e| EngineError::Execution(e.to_string()))?;
        let mut value = context.to_value();
        value["research"] = research;
        Ok(Checkpoint(value))
    }

    async fn resume(&mut self, checkpoint: Checkpoint) -> Result<(), EngineError> {
        let context = RunContext::from_value(&checkpoint.0)?;
        let research: Research = match checkpoint.get("research") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| EngineError::InvalidCheckpoint(e.to_string()))?,
            None => Research::default(),
        };
        tokio::fs::create_dir_all(Self::project_dir(&context.workspace_dir)).await?;
        self.command = self.command.overridden_by(&context.config);
        self.context = Some(context);
        self.update(|r| *r = research);
        Ok(())
    }

    async fn intervene(&self, intervention: &Intervention) -> Result<(), EngineError> {
        let Some(context) = self.context.as_ref() else {
            return Ok(());
        };
        let Some(new_value) = intervention.str_field("new_value").filter(|v| !v.is_empty()) else {
            return Ok(());
        };
        let project_dir = Self::project_dir(&context.workspace_dir);
        match intervention.kind.as_str() {
            "modify_idea" => {
                Self::write_input(&project_dir, "idea.md", new_value).await?;
                self.update(|r| r.idea = new_value.to_string());
            }
            "modify_methodology" => {
                Self::write_input(&project_dir, "methods.md", new_value).await?;
                self.update(|r| r.methodology = new_value.to_string());
            }
            "modify_data_description" => {
                Self::write_input(&project_dir, "data_description.md", new_value).await?;
                self.update(|r| r.data_description = new_value.to_string());
            }
            other => tracing::debug!("Ignoring intervention type: {}", other),
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), EngineError> {
        self.context = None;
        self.update(|r| *r = Research::default());
        Ok(())
    }

    fn get_cost_estimate(&self, input_data: &Value) -> f64 {
        match input_data.get("backend").and_then(Value::as_str).unwrap_or("fast") {
            "fast" => 3.0,
            "cmbagent" => 8.0,
            _ => 5.0,
        }
    }
}
