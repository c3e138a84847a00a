//! Scripted 引擎（用于测试与本地演示，无需外部框架）
//!
//! 按脚本依次产出元素；检查点即「已消费的步数」，resume 后从下一步继续。
//! ScriptTally 在同一工厂构造的所有实例间共享，测试用它观察 cleanup 次数与干预记录。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::{
    Checkpoint, ConfigMap, Engine, EngineError, EngineOutput, EngineStream, EngineType, Intervention,
};

/// 脚本中的一步
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// 产出一个元素
    Emit(EngineOutput),
    /// 模拟长时间外部调用（挂起点）
    Wait(Duration),
    /// 在此处抛出执行错误
    Fail(String),
    /// 在此处 panic
    Panic(String),
}

/// 多个实例共享的观测点
#[derive(Debug, Default)]
pub struct ScriptTally {
    pub cleanups: AtomicUsize,
    pub constructed: AtomicUsize,
    pub interventions: Mutex<Vec<Intervention>>,
    pub last_config: Mutex<Option<ConfigMap>>,
    pub last_workspace: Mutex<Option<PathBuf>>,
}

impl ScriptTally {
    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn intervention_kinds(&self) -> Vec<String> {
        self.interventions
            .lock()
            .map(|ivs| ivs.iter().map(|iv| iv.kind.clone()).collect())
            .unwrap_or_default()
    }
}

pub struct ScriptedEngine {
    engine_type: EngineType,
    steps: Arc<Vec<ScriptStep>>,
    position: Arc<AtomicUsize>,
    ready: AtomicBool,
    /// config.fail_pause：pause 返回无可恢复状态
    fail_pause: bool,
    /// config.fail_cleanup：cleanup 返回错误
    fail_cleanup: bool,
    tally: Arc<ScriptTally>,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self::with_tally(steps, Arc::new(ScriptTally::default()))
    }

    pub fn with_tally(steps: Vec<ScriptStep>, tally: Arc<ScriptTally>) -> Self {
        tally.constructed.fetch_add(1, Ordering::SeqCst);
        Self {
            engine_type: EngineType::Custom("scripted".to_string()),
            steps: Arc::new(steps),
            position: Arc::new(AtomicUsize::new(0)),
            ready: AtomicBool::new(false),
            fail_pause: false,
            fail_cleanup: false,
            tally,
        }
    }

    pub fn named(mut self, engine_type: EngineType) -> Self {
        self.engine_type = engine_type;
        self
    }

    /// 供 EngineRegistry::register_engine 使用的工厂
    pub fn factory(
        engine_type: EngineType,
        steps: Vec<ScriptStep>,
        tally: Arc<ScriptTally>,
    ) -> impl Fn() -> Box<dyn Engine> + Send + Sync + 'static {
        move || -> Box<dyn Engine> {
            Box::new(ScriptedEngine::with_tally(steps.clone(), Arc::clone(&tally)).named(engine_type.clone()))
        }
    }

    pub fn position(&self) -> usize {
        self.position.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn engine_type(&self) -> EngineType {
        self.engine_type.clone()
    }

    async fn initialize(
        &mut self,
        _session_id: &str,
        workspace_dir: &Path,
        config: ConfigMap,
    ) -> Result<(), EngineError> {
        let flag = |key: &str| config.get(key).and_then(Value::as_bool).unwrap_or(false);
        if flag("fail_initialize") {
            return Err(EngineError::Initialization("scripted failure requested".into()));
        }
        if !workspace_dir.is_dir() {
            return Err(EngineError::Initialization(format!(
                "workspace {} does not exist",
                workspace_dir.display()
            )));
        }
        self.fail_pause = flag("fail_pause");
        self.fail_cleanup = flag("fail_cleanup");
        if let Ok(mut slot) = self.tally.last_config.lock() {
            *slot = Some(config);
        }
        if let Ok(mut slot) = self.tally.last_workspace.lock() {
            *slot = Some(workspace_dir.to_path_buf());
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn execute<'a>(
        &'a self,
        _task: &'a str,
        _input_data: &'a Value,
        _mode_config: &'a ConfigMap,
    ) -> EngineStream<'a> {
        let steps = Arc::clone(&self.steps);
        let position = Arc::clone(&self.position);
        Box::pin(async_stream::stream! {
            loop {
                let index = position.load(Ordering::SeqCst);
                let Some(step) = steps.get(index) else { break };
                match step {
                    ScriptStep::Emit(output) => {
                        position.fetch_add(1, Ordering::SeqCst);
                        let terminal = output.is_terminal();
                        yield Ok(output.clone());
                        if terminal {
                            break;
                        }
                    }
                    ScriptStep::Wait(duration) => {
                        tokio::time::sleep(*duration).await;
                        position.fetch_add(1, Ordering::SeqCst);
                    }
                    ScriptStep::Fail(reason) => {
                        position.fetch_add(1, Ordering::SeqCst);
                        yield Err(EngineError::Execution(reason.clone()));
                        break;
                    }
                    ScriptStep::Panic(reason) => {
                        position.fetch_add(1, Ordering::SeqCst);
                        panic!("{}", reason);
                    }
                }
            }
        })
    }

    async fn pause(&self) -> Result<Checkpoint, EngineError> {
        if self.fail_pause || !self.ready.load(Ordering::SeqCst) {
            return Err(EngineError::NoResumableState);
        }
        Ok(Checkpoint(serde_json::json!({ "position": self.position() })))
    }

    async fn resume(&mut self, checkpoint: Checkpoint) -> Result<(), EngineError> {
        let position = checkpoint
            .get("position")
            .and_then(Value::as_u64)
            .ok_or_else(|| EngineError::InvalidCheckpoint("missing position".into()))?;
        self.position.store(position as usize, Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn intervene(&self, intervention: &Intervention) -> Result<(), EngineError> {
        if let Ok(mut ivs) = self.tally.interventions.lock() {
            ivs.push(intervention.clone());
        }
        // skip：跳过下一步；其它类型忽略
        if intervention.kind == "skip" {
            self.position.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), EngineError> {
        self.tally.cleanups.fetch_add(1, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        if self.fail_cleanup {
            return Err(EngineError::Execution("scripted cleanup failure".into()));
        }
        Ok(())
    }

    fn get_cost_estimate(&self, _input_data: &Value) -> f64 {
        self.steps
            .iter()
            .filter_map(|step| match step {
                ScriptStep::Emit(output) => output.cost_info.as_ref().map(|c| c.cost_usd),
                _ => None,
            })
            .sum()
    }
}
