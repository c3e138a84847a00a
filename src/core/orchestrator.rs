//! 会话执行编排器
//!
//! 负责：解析模式与引擎、推进会话状态机、在独立任务中驱动引擎输出流、
//! 按顺序写入审计消息并转发给消费者、累计费用、pause / resume 检查点、协作取消。
//!
//! 每个输出元素固定顺序处理：先写入 assistant 消息（同时累加会话费用），
//! 终态元素再写入会话结果，最后才转发给消费者。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::{FutureExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::error::{OrchestratorError, OrchestratorResult};
use crate::core::session_supervisor::{DriverControl, DriverLease, DriverStatus, SessionSupervisor};
use crate::core::state::SessionStatus;
use crate::engine::{
    Checkpoint, ConfigMap, Engine, EngineError, EngineOutput, EngineRegistry, Intervention, OutputStatus,
};
use crate::modes::{Mode, ModeCatalog};
use crate::session::{
    workspace, Message, NewMessage, Session, SessionFilter, SessionStore, StatusUpdate,
};

/// 驱动任务产出的事件
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Output(EngineOutput),
    /// 未恢复的故障；之后不会再有事件
    Fault { error: String },
}

pub type SessionEventStream = Pin<Box<dyn Stream<Item = SessionEvent> + Send>>;

/// 运行参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub workspace_root: PathBuf,
    /// 流式消费者与驱动任务之间的缓冲
    pub stream_buffer: usize,
    /// 注入每个会话引擎配置的 api_keys
    pub api_keys: ConfigMap,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("./workspaces"),
            stream_buffer: 32,
            api_keys: ConfigMap::new(),
        }
    }
}

/// 会话状态 + 驱动状态
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub session_status: SessionStatus,
    pub driver: Option<DriverStatus>,
}

#[derive(Clone)]
pub struct Orchestrator {
    catalog: Arc<ModeCatalog>,
    registry: Arc<EngineRegistry>,
    store: Arc<dyn SessionStore>,
    supervisor: Arc<SessionSupervisor>,
    settings: Arc<OrchestratorSettings>,
}

/// 按序号写入消息；序号从存储中的下一个值开始连续分配
struct Recorder {
    store: Arc<dyn SessionStore>,
    session_id: String,
    next: u64,
}

impl Recorder {
    async fn open(store: Arc<dyn SessionStore>, session_id: &str) -> OrchestratorResult<Self> {
        let next = store.next_sequence_number(session_id).await?;
        Ok(Self {
            store,
            session_id: session_id.to_string(),
            next,
        })
    }

    async fn append(&mut self, message: NewMessage) -> OrchestratorResult<Message> {
        let stored = self.store.append_message(&self.session_id, self.next, message).await?;
        self.next += 1;
        Ok(stored)
    }
}

/// 驱动一次执行所需的全部状态，由驱动任务独占
struct Drive {
    session: Session,
    engine: Box<dyn Engine>,
    config: ConfigMap,
    initialize: bool,
    recorder: Recorder,
    lease: DriverLease,
    sink: Option<mpsc::Sender<SessionEvent>>,
}

/// 驱动循环的退出原因
enum Exit {
    Finished,
    Paused,
    Cancelled,
    Fault(String),
}

/// 单个元素的转发结果
enum Forwarded {
    Sent,
    Paused,
    Cancelled,
}

/// 驱动任务的可变状态；引擎与会话由 run_drive 持有，保证 panic 后仍能走故障路径
struct Driver {
    recorder: Recorder,
    token: CancellationToken,
    control_rx: mpsc::Receiver<DriverControl>,
    sink: Option<mpsc::Sender<SessionEvent>>,
    /// 已写入的终态；之后的 pause / intervene 一律拒绝
    finished: Option<SessionStatus>,
}

/// 合并引擎配置：模式静态配置 < api_keys < 调用方 input_data["config"]
pub fn merge_engine_config(mode: &Mode, api_keys: &ConfigMap, input_data: &Value) -> ConfigMap {
    let mut merged = mode.config.engine_config.clone();
    if !api_keys.is_empty() {
        merged.insert("api_keys".to_string(), Value::Object(api_keys.clone()));
    }
    if let Some(caller) = input_data.get("config").and_then(Value::as_object) {
        for (key, value) in caller {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn fault_text(e: EngineError) -> String {
    match e {
        EngineError::Execution(message) => message,
        other => other.to_string(),
    }
}

fn output_metadata(output: &EngineOutput) -> ConfigMap {
    let mut metadata = output.metadata.clone();
    metadata.insert("status".to_string(), json!(output.status.as_str()));
    metadata.insert("artifacts_count".to_string(), json!(output.artifacts.len()));
    if !output.artifacts.is_empty() {
        metadata.insert("artifacts".to_string(), json!(output.artifacts));
    }
    metadata
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<ModeCatalog>,
        registry: Arc<EngineRegistry>,
        store: Arc<dyn SessionStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            catalog,
            registry,
            store,
            supervisor: Arc::new(SessionSupervisor::new()),
            settings: Arc::new(settings),
        }
    }

    pub fn catalog(&self) -> &ModeCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    fn mode(&self, mode_id: &str) -> OrchestratorResult<&Mode> {
        self.catalog.get(mode_id).ok_or_else(|| OrchestratorError::NotFound {
            kind: "Mode",
            id: mode_id.to_string(),
        })
    }

    // ---------- 会话管理 ----------

    /// 创建会话（Created）并准备工作区
    pub async fn create_session(&self, mode_id: &str, task: &str, input_data: Value) -> OrchestratorResult<Session> {
        let mode = self.mode(mode_id)?;
        let session = Session::new(
            mode_id,
            mode.engine.clone(),
            task,
            input_data,
            &self.settings.workspace_root,
        );
        workspace::prepare(&session.workspace_path).await?;
        self.store.create_session(session.clone()).await?;
        tracing::info!("Created session {} for mode {}", session.id, mode_id);
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> OrchestratorResult<Session> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::session_not_found(session_id))
    }

    pub async fn list_sessions(&self, filter: &SessionFilter) -> OrchestratorResult<Vec<Session>> {
        Ok(self.store.list_sessions(filter).await?)
    }

    pub async fn messages(
        &self,
        session_id: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> OrchestratorResult<Vec<Message>> {
        Ok(self.store.messages(session_id, offset, limit).await?)
    }

    /// Created -> Queued
    pub async fn queue_session(&self, session_id: &str) -> OrchestratorResult<Session> {
        Ok(self
            .store
            .update_status(session_id, StatusUpdate::to(SessionStatus::Queued))
            .await?)
    }

    pub async fn task_status(&self, session_id: &str) -> OrchestratorResult<TaskStatus> {
        let session = self.get_session(session_id).await?;
        Ok(TaskStatus {
            session_status: session.status,
            driver: self.supervisor.status(session_id).await,
        })
    }

    pub async fn is_driving(&self, session_id: &str) -> bool {
        self.supervisor.is_driving(session_id).await
    }

    /// 等待当前驱动任务（若有）退出
    pub async fn wait(&self, session_id: &str) {
        if let Some(handle) = self.supervisor.get(session_id).await {
            handle.wait().await;
        }
    }

    /// 删除会话记录与工作区；驱动中时拒绝
    pub async fn delete_session(&self, session_id: &str) -> OrchestratorResult<()> {
        let session = self.get_session(session_id).await?;
        let lease = self.supervisor.reserve(session_id).await?;
        let result: OrchestratorResult<()> = async {
            self.store.delete_session(session_id).await?;
            workspace::remove(&session.workspace_path).await?;
            Ok(())
        }
        .await;
        self.supervisor.release(session_id, &lease.handle).await;
        if result.is_ok() {
            tracing::info!("Deleted session {}", session_id);
        }
        result
    }

    /// 用模式对应引擎的启发式估算费用（不产生任何外部调用）
    pub fn estimate_cost(&self, mode_id: &str, input_data: &Value) -> OrchestratorResult<f64> {
        let mode = self.mode(mode_id)?;
        let engine = self.registry.get_engine(&mode.engine)?;
        let mut estimate_input = mode.config.engine_config.clone();
        if let Some(input) = input_data.as_object() {
            for (key, value) in input {
                estimate_input.insert(key.clone(), value.clone());
            }
        }
        Ok(engine.get_cost_estimate(&Value::Object(estimate_input)))
    }

    // ---------- 执行 ----------

    /// 流式执行：返回的流按引擎产出顺序给出事件
    pub async fn execute_stream(&self, session_id: &str) -> OrchestratorResult<SessionEventStream> {
        let (tx, rx) = mpsc::channel(self.settings.stream_buffer.max(1));
        self.start(session_id, false, Some(tx)).await?;
        Ok(event_stream(rx))
    }

    /// 后台执行：Created 会话先进入 Queued；调用方通过 get_session / task_status 轮询
    pub async fn execute_background(&self, session_id: &str) -> OrchestratorResult<()> {
        self.start(session_id, true, None).await
    }

    pub async fn resume_stream(&self, session_id: &str) -> OrchestratorResult<SessionEventStream> {
        let (tx, rx) = mpsc::channel(self.settings.stream_buffer.max(1));
        self.resume_with(session_id, Some(tx)).await?;
        Ok(event_stream(rx))
    }

    pub async fn resume_background(&self, session_id: &str) -> OrchestratorResult<()> {
        self.resume_with(session_id, None).await
    }

    async fn start(
        &self,
        session_id: &str,
        queue_first: bool,
        sink: Option<mpsc::Sender<SessionEvent>>,
    ) -> OrchestratorResult<()> {
        let session = self.get_session(session_id).await?;
        let lease = self.supervisor.reserve(session_id).await?;
        match self.prepare_start(session, queue_first).await {
            Ok((session, engine, config, recorder)) => {
                self.spawn(Drive {
                    session,
                    engine,
                    config,
                    initialize: true,
                    recorder,
                    lease,
                    sink,
                });
                Ok(())
            }
            Err(e) => {
                self.supervisor.release(session_id, &lease.handle).await;
                Err(e)
            }
        }
    }

    async fn prepare_start(
        &self,
        session: Session,
        queue_first: bool,
    ) -> OrchestratorResult<(Session, Box<dyn Engine>, ConfigMap, Recorder)> {
        if !matches!(session.status, SessionStatus::Created | SessionStatus::Queued) {
            return Err(OrchestratorError::InvalidState {
                current: session.status,
                requested: SessionStatus::Running,
            });
        }
        let mode = self.mode(&session.mode_id)?;
        let engine = self.registry.get_engine(&mode.engine)?;

        if queue_first && session.status == SessionStatus::Created {
            self.store
                .update_status(&session.id, StatusUpdate::to(SessionStatus::Queued))
                .await?;
        }
        let session = self
            .store
            .update_status(&session.id, StatusUpdate::to(SessionStatus::Running))
            .await?;
        tracing::info!("Session {} running (mode {}, engine {})", session.id, mode.id, mode.engine);

        let mut recorder = Recorder::open(Arc::clone(&self.store), &session.id).await?;
        recorder
            .append(NewMessage::system(format!("Starting execution of mode: {}", mode.name)))
            .await?;

        workspace::prepare(&session.workspace_path).await?;
        let config = merge_engine_config(mode, &self.settings.api_keys, &session.input_data);
        Ok((session, engine, config, recorder))
    }

    async fn resume_with(&self, session_id: &str, sink: Option<mpsc::Sender<SessionEvent>>) -> OrchestratorResult<()> {
        let session = self.get_session(session_id).await?;
        let lease = self.supervisor.reserve(session_id).await?;
        match self.prepare_resume(session).await {
            Ok((session, engine, config, recorder)) => {
                self.spawn(Drive {
                    session,
                    engine,
                    config,
                    initialize: false,
                    recorder,
                    lease,
                    sink,
                });
                Ok(())
            }
            Err(e) => {
                self.supervisor.release(session_id, &lease.handle).await;
                Err(e)
            }
        }
    }

    async fn prepare_resume(
        &self,
        session: Session,
    ) -> OrchestratorResult<(Session, Box<dyn Engine>, ConfigMap, Recorder)> {
        if session.status != SessionStatus::Paused {
            return Err(OrchestratorError::InvalidState {
                current: session.status,
                requested: SessionStatus::Running,
            });
        }
        let mode = self.mode(&session.mode_id)?;
        let mut engine = self.registry.get_engine(&mode.engine)?;
        let checkpoint = self
            .store
            .load_checkpoint(&session.id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "Checkpoint",
                id: session.id.clone(),
            })?;

        workspace::prepare(&session.workspace_path).await?;
        if let Err(e) = engine.resume(checkpoint).await {
            tracing::warn!("Engine resume failed for session {}: {}", session.id, e);
            let _ = engine.cleanup().await;
            return Err(OrchestratorError::Initialization(e.to_string()));
        }

        let session = self
            .store
            .update_status(&session.id, StatusUpdate::to(SessionStatus::Running))
            .await?;
        tracing::info!("Session {} resumed", session.id);

        let mut recorder = Recorder::open(Arc::clone(&self.store), &session.id).await?;
        recorder.append(NewMessage::system("Execution resumed")).await?;
        let config = merge_engine_config(mode, &self.settings.api_keys, &session.input_data);
        Ok((session, engine, config, recorder))
    }

    fn spawn(&self, drive: Drive) {
        let store = Arc::clone(&self.store);
        let supervisor = Arc::clone(&self.supervisor);
        let session_id = drive.session.id.clone();
        let handle = Arc::clone(&drive.lease.handle);
        let span = tracing::info_span!("drive", session_id = %session_id);

        tokio::spawn(
            async move {
                // 引擎内的 panic 在 run_drive 中已转为故障；这里兜住其余路径（如 cleanup）
                let outcome = AssertUnwindSafe(run_drive(drive)).catch_unwind().await;
                if outcome.is_err() {
                    tracing::error!("Driver panicked");
                    mark_failed(&store, &session_id, "Driver task panicked").await;
                }
                supervisor.release(&session_id, &handle).await;
            }
            .instrument(span),
        );
    }

    // ---------- 控制 ----------

    /// Running -> Paused：由驱动任务调用 engine.pause() 并持久化检查点；返回时驱动已退出
    pub async fn pause(&self, session_id: &str) -> OrchestratorResult<()> {
        let session = self.get_session(session_id).await?;
        if session.status != SessionStatus::Running {
            return Err(OrchestratorError::InvalidState {
                current: session.status,
                requested: SessionStatus::Paused,
            });
        }
        let handle = self
            .supervisor
            .get(session_id)
            .await
            .ok_or_else(|| OrchestratorError::NoActiveDriver(session_id.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        if !handle.send(DriverControl::Pause(reply_tx)).await {
            return Err(OrchestratorError::NoActiveDriver(session_id.to_string()));
        }
        match reply_rx.await {
            Ok(Ok(_checkpoint)) => {
                handle.wait().await;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            // 驱动在处理请求前已结束
            Err(_) => {
                handle.wait().await;
                let current = self.get_session(session_id).await?.status;
                Err(OrchestratorError::InvalidState {
                    current,
                    requested: SessionStatus::Paused,
                })
            }
        }
    }

    /// 取消：有驱动时协作取消并等待其退出；无驱动时直接置为 Cancelled
    pub async fn cancel(&self, session_id: &str) -> OrchestratorResult<()> {
        let session = self.get_session(session_id).await?;
        if session.status.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                current: session.status,
                requested: SessionStatus::Cancelled,
            });
        }

        let lease = match self.supervisor.reserve(session_id).await {
            Ok(lease) => lease,
            Err(OrchestratorError::AlreadyDriving(_)) => {
                if let Some(handle) = self.supervisor.get(session_id).await {
                    handle.cancel();
                    handle.wait().await;
                }
                self.supervisor.reserve(session_id).await?
            }
            Err(e) => return Err(e),
        };

        let result = self.finish_cancel(session_id).await;
        self.supervisor.release(session_id, &lease.handle).await;
        result
    }

    async fn finish_cancel(&self, session_id: &str) -> OrchestratorResult<()> {
        self.store
            .update_status(session_id, StatusUpdate::to(SessionStatus::Cancelled))
            .await?;
        let mut recorder = Recorder::open(Arc::clone(&self.store), session_id).await?;
        recorder.append(NewMessage::system("Execution cancelled")).await?;
        tracing::info!("Session {} cancelled", session_id);
        Ok(())
    }

    /// 人工干预：仅 Running 且有驱动、且模式允许时接受；驱动在两个元素之间应用并记录为 user 消息
    pub async fn intervene(&self, session_id: &str, intervention: Intervention) -> OrchestratorResult<()> {
        let session = self.get_session(session_id).await?;
        if session.status != SessionStatus::Running {
            return Err(OrchestratorError::InvalidState {
                current: session.status,
                requested: SessionStatus::Running,
            });
        }
        let mode = self.mode(&session.mode_id)?;
        if !mode.config.allow_intervention {
            return Err(OrchestratorError::InterventionNotAllowed(mode.id.clone()));
        }
        let handle = self
            .supervisor
            .get(session_id)
            .await
            .ok_or_else(|| OrchestratorError::NoActiveDriver(session_id.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        if !handle.send(DriverControl::Intervene(intervention, reply_tx)).await {
            return Err(OrchestratorError::NoActiveDriver(session_id.to_string()));
        }
        reply_rx
            .await
            .map_err(|_| OrchestratorError::NoActiveDriver(session_id.to_string()))?
    }

    /// 进程退出前取消所有驱动，并把对应会话置为 Cancelled
    pub async fn shutdown(&self) {
        let ids = self.supervisor.active_ids().await;
        let results = join_all(ids.iter().map(|id| self.cancel(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("Failed to cancel session {} on shutdown: {}", id, e);
            }
        }
    }
}

fn event_stream(rx: mpsc::Receiver<SessionEvent>) -> SessionEventStream {
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    }))
}

/// 驱动外的失败标记（panic 兜底）
async fn mark_failed(store: &Arc<dyn SessionStore>, session_id: &str, error: &str) {
    if let Err(e) = store.update_status(session_id, StatusUpdate::failed(error)).await {
        tracing::error!("Failed to mark session {} failed: {}", session_id, e);
        return;
    }
    match store.next_sequence_number(session_id).await {
        Ok(seq) => {
            let msg = NewMessage::system(format!("Execution failed: {error}"));
            if let Err(e) = store.append_message(session_id, seq, msg).await {
                tracing::error!("Failed to record fault for session {}: {}", session_id, e);
            }
        }
        Err(e) => tracing::error!("Failed to record fault for session {}: {}", session_id, e),
    }
}

async fn run_drive(drive: Drive) {
    let Drive {
        session,
        mut engine,
        config,
        initialize,
        recorder,
        lease,
        sink,
    } = drive;
    let DriverLease { handle, control_rx, .. } = lease;
    let mut driver = Driver {
        recorder,
        token: handle.cancel_token(),
        control_rx,
        sink,
        finished: None,
    };

    let outcome = AssertUnwindSafe(async {
        if initialize {
            if let Err(e) = engine
                .initialize(&session.id, &session.workspace_path, config.clone())
                .await
            {
                return Exit::Fault(fault_text(e));
            }
        }
        driver.drive_stream(engine.as_ref(), &session, &config).await
    })
    .catch_unwind()
    .await;
    let exit = outcome.unwrap_or_else(|payload| {
        Exit::Fault(format!("Engine panicked: {}", panic_message(payload.as_ref())))
    });

    match exit {
        Exit::Finished => tracing::info!("Drive finished"),
        Exit::Paused => tracing::info!("Drive paused"),
        Exit::Cancelled => tracing::info!("Drive cancelled"),
        Exit::Fault(error) => {
            tracing::warn!("Drive failed: {}", error);
            driver.fail(engine.as_ref(), error).await;
        }
    }

    if let Err(e) = engine.cleanup().await {
        tracing::warn!("Engine cleanup failed: {}", e);
    }
}

impl Driver {
    fn session_id(&self) -> &str {
        &self.recorder.session_id
    }

    async fn drive_stream(&mut self, engine: &dyn Engine, session: &Session, config: &ConfigMap) -> Exit {
        let mut stream = engine.execute(&session.task, &session.input_data, config);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Exit::Cancelled,
                Some(control) = self.control_rx.recv() => {
                    if self.handle_control(engine, control).await {
                        return Exit::Paused;
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(output)) => {
                        let terminal = output.is_terminal();
                        match self.record_output(&output).await {
                            Ok(status) => self.finished = status,
                            Err(e) => {
                                tracing::error!("Failed to persist output: {}", e);
                                return Exit::Fault(e.to_string());
                            }
                        }
                        tracing::debug!("Forwarding {} element", output.status.as_str());
                        match self.forward(engine, SessionEvent::Output(output)).await {
                            Forwarded::Sent => {}
                            Forwarded::Paused => return Exit::Paused,
                            Forwarded::Cancelled => return Exit::Cancelled,
                        }
                        if terminal {
                            return Exit::Finished;
                        }
                    }
                    Some(Err(e)) => return Exit::Fault(fault_text(e)),
                    None => return Exit::Fault("engine output ended without a terminal status".to_string()),
                },
            }
        }
    }

    /// 把事件交给消费者；等待缓冲空位期间照常处理控制请求
    ///
    /// 消费者断开后继续驱动（结果仍会持久化）。暂停时尚未送达的事件由后台任务补发到同一个流。
    async fn forward(&mut self, engine: &dyn Engine, event: SessionEvent) -> Forwarded {
        let Some(tx) = self.sink.clone() else {
            return Forwarded::Sent;
        };
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Forwarded::Cancelled,
                Some(control) = self.control_rx.recv() => {
                    if self.handle_control(engine, control).await {
                        let handoff = tx.clone();
                        tokio::spawn(async move {
                            let _ = handoff.send(event).await;
                        });
                        return Forwarded::Paused;
                    }
                }
                permit = tx.reserve() => {
                    match permit {
                        Ok(permit) => permit.send(event),
                        Err(_) => {
                            tracing::debug!("Stream consumer disconnected, continuing in background");
                            self.sink = None;
                        }
                    }
                    return Forwarded::Sent;
                }
            }
        }
    }

    /// 处理一个控制请求；返回 true 表示已暂停，驱动应退出
    async fn handle_control(&mut self, engine: &dyn Engine, control: DriverControl) -> bool {
        match control {
            DriverControl::Pause(reply) => {
                if let Some(current) = self.finished {
                    let _ = reply.send(Err(OrchestratorError::InvalidState {
                        current,
                        requested: SessionStatus::Paused,
                    }));
                    return false;
                }
                match self.pause_here(engine).await {
                    Ok(checkpoint) => {
                        let _ = reply.send(Ok(checkpoint));
                        true
                    }
                    Err(e) => {
                        tracing::warn!("Pause rejected: {}", e);
                        let _ = reply.send(Err(e));
                        false
                    }
                }
            }
            DriverControl::Intervene(intervention, reply) => {
                let result = match self.finished {
                    Some(current) => Err(OrchestratorError::InvalidState {
                        current,
                        requested: SessionStatus::Running,
                    }),
                    None => self.intervene_here(engine, intervention).await,
                };
                let _ = reply.send(result);
                false
            }
        }
    }

    /// 写入 assistant 消息；终态元素同时写入会话结果并返回新状态
    async fn record_output(&mut self, output: &EngineOutput) -> OrchestratorResult<Option<SessionStatus>> {
        let (tokens, cost) = output
            .cost_info
            .as_ref()
            .map(|c| (c.tokens, c.cost_usd))
            .unwrap_or((0, 0.0));
        self.recorder
            .append(
                NewMessage::assistant(output.content.clone())
                    .with_metadata(output_metadata(output))
                    .with_usage(tokens, cost),
            )
            .await?;

        let update = match output.status {
            OutputStatus::Running => return Ok(None),
            OutputStatus::Completed => StatusUpdate::completed(json!({
                "content": output.content,
                "artifacts": output.artifacts,
                "metadata": output.metadata,
            })),
            OutputStatus::Failed => {
                let error = if output.content.trim().is_empty() {
                    "Engine reported failure".to_string()
                } else {
                    output.content.clone()
                };
                StatusUpdate::failed(error)
            }
        };
        let updated = self.recorder.store.update_status(self.session_id(), update).await?;
        tracing::info!("Session {} {}", updated.id, updated.status);
        Ok(Some(updated.status))
    }

    async fn pause_here(&mut self, engine: &dyn Engine) -> OrchestratorResult<Checkpoint> {
        let checkpoint = engine.pause().await?;
        let store = Arc::clone(&self.recorder.store);
        store.save_checkpoint(self.session_id(), checkpoint.clone()).await?;
        store
            .update_status(self.session_id(), StatusUpdate::to(SessionStatus::Paused))
            .await?;
        self.recorder.append(NewMessage::system("Execution paused")).await?;
        tracing::info!("Session {} paused", self.session_id());
        Ok(checkpoint)
    }

    async fn intervene_here(&mut self, engine: &dyn Engine, intervention: Intervention) -> OrchestratorResult<()> {
        engine.intervene(&intervention).await?;
        let mut metadata = intervention.data.clone();
        metadata.insert("intervention_type".to_string(), json!(intervention.kind));
        self.recorder
            .append(NewMessage::user(format!("Intervention: {}", intervention.kind)).with_metadata(metadata))
            .await?;
        Ok(())
    }

    /// 故障路径：记录 system 消息、置为 Failed、向消费者发送错误事件
    async fn fail(&mut self, engine: &dyn Engine, error: String) {
        if let Err(e) = self
            .recorder
            .append(NewMessage::system(format!("Execution failed: {error}")))
            .await
        {
            tracing::error!("Failed to record fault: {}", e);
        }
        let store = Arc::clone(&self.recorder.store);
        match store.update_status(self.session_id(), StatusUpdate::failed(error.clone())).await {
            Ok(session) => self.finished = Some(session.status),
            Err(e) => {
                tracing::error!("Failed to mark session failed: {}", e);
                self.finished = Some(SessionStatus::Failed);
            }
        }
        self.forward(engine, SessionEvent::Fault { error }).await;
    }
}
