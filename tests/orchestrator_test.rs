//! 编排器集成测试：用 Scripted 引擎驱动完整会话生命周期

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tempfile::TempDir;
use tomas::config::AppConfig;
use tomas::core::{Orchestrator, OrchestratorBuilder, OrchestratorError, SessionEvent, SessionEventStream};
use tomas::engine::{
    ConfigMap, EngineOutput, EngineRegistry, EngineType, Intervention, ScriptTally, ScriptStep, ScriptedEngine,
};
use tomas::modes::{Mode, ModeCatalog, ModeConfig};
use tomas::session::{Message, MessageRole, SessionFilter};
use tomas::{SessionStatus, StreamEvent};

struct Harness {
    orchestrator: Orchestrator,
    tally: Arc<ScriptTally>,
    _root: TempDir,
}

fn stub_mode(id: &str, allow_intervention: bool) -> Mode {
    let mut engine_config = ConfigMap::new();
    engine_config.insert("backend".into(), json!("fast"));
    engine_config.insert("depth".into(), json!(1));
    Mode {
        id: id.to_string(),
        name: format!("Stub {id}"),
        description: String::new(),
        category: "test".to_string(),
        engine: EngineType::from("stub"),
        tags: Vec::new(),
        config: ModeConfig {
            engine_config,
            allow_intervention,
            ..ModeConfig::default()
        },
    }
}

fn harness(steps: Vec<ScriptStep>) -> Harness {
    harness_with_buffer(steps, 32)
}

fn harness_with_buffer(steps: Vec<ScriptStep>, stream_buffer: usize) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let tally = Arc::new(ScriptTally::default());

    let mut registry = EngineRegistry::new();
    registry
        .register_engine(
            EngineType::from("stub"),
            ScriptedEngine::factory(EngineType::from("stub"), steps, Arc::clone(&tally)),
        )
        .unwrap();

    let mut catalog = ModeCatalog::new();
    catalog.register(stub_mode("stub", true)).unwrap();
    catalog.register(stub_mode("locked", false)).unwrap();

    let mut config = AppConfig::default();
    config.orchestrator.stream_buffer = stream_buffer;
    let orchestrator = OrchestratorBuilder::new(config)
        .with_catalog(catalog)
        .with_registry(registry)
        .with_workspace_root(root.path())
        .build_in_memory()
        .unwrap();

    Harness {
        orchestrator,
        tally,
        _root: root,
    }
}

fn three_step_script() -> Vec<ScriptStep> {
    vec![
        ScriptStep::Emit(EngineOutput::running("step 1").with_cost(10, 0.01)),
        ScriptStep::Emit(EngineOutput::running("step 2").with_cost(10, 0.01)),
        ScriptStep::Emit(EngineOutput::completed("all done")),
    ]
}

async fn drain(stream: SessionEventStream) -> Vec<SessionEvent> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("drive did not finish in time")
}

fn contents(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Output(o) => Some(o.content.clone()),
            SessionEvent::Fault { .. } => None,
        })
        .collect()
}

fn assert_gapless(messages: &[Message]) {
    for (i, m) in messages.iter().enumerate() {
        assert_eq!(m.sequence_number, i as u64, "gap at index {i}");
    }
}

async fn assert_totals_match(h: &Harness, session_id: &str) {
    let session = h.orchestrator.get_session(session_id).await.unwrap();
    let messages = h.orchestrator.messages(session_id, 0, None).await.unwrap();
    let tokens: u64 = messages.iter().map(|m| m.tokens_used).sum();
    let cost: f64 = messages.iter().map(|m| m.cost).sum();
    assert_eq!(session.total_tokens, tokens);
    assert!((session.total_cost - cost).abs() < 1e-9);
}

fn count_role(messages: &[Message], role: MessageRole) -> usize {
    messages.iter().filter(|m| m.role == role).count()
}

#[tokio::test]
async fn streamed_run_completes_with_costs() {
    let h = harness(three_step_script());
    let session = h.orchestrator.create_session("stub", "demo task", json!({})).await.unwrap();

    let events = drain(h.orchestrator.execute_stream(&session.id).await.unwrap()).await;
    assert_eq!(contents(&events), vec!["step 1", "step 2", "all done"]);
    h.orchestrator.wait(&session.id).await;

    let done = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.total_tokens, 20);
    assert!((done.total_cost - 0.02).abs() < 1e-9);
    assert_eq!(done.output_data.as_ref().and_then(|o| o.get("content")), Some(&json!("all done")));
    assert!(done.error_message.is_none());

    let messages = h.orchestrator.messages(&session.id, 0, None).await.unwrap();
    assert_gapless(&messages);
    assert_eq!(count_role(&messages, MessageRole::Assistant), 3);
    assert_eq!(messages[0].role, MessageRole::System);
    assert!(messages[0].content.starts_with("Starting execution of mode"));
    assert_totals_match(&h, &session.id).await;
    assert_eq!(h.tally.cleanup_count(), 1);
}

#[tokio::test]
async fn engine_fault_marks_session_failed() {
    let h = harness(vec![
        ScriptStep::Emit(EngineOutput::running("first")),
        ScriptStep::Fail("backend crashed".into()),
    ]);
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();

    let events = drain(h.orchestrator.execute_stream(&session.id).await.unwrap()).await;
    assert_eq!(events.len(), 2);
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Fault {
            error: "backend crashed".into()
        })
    );
    h.orchestrator.wait(&session.id).await;

    let failed = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(failed.status, SessionStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("backend crashed"));
    assert!(failed.output_data.is_none());
    assert!(failed.completed_at.is_some());

    let messages = h.orchestrator.messages(&session.id, 0, None).await.unwrap();
    assert_gapless(&messages);
    assert_eq!(count_role(&messages, MessageRole::Assistant), 1);
    let faults = messages
        .iter()
        .filter(|m| m.role == MessageRole::System && m.content.starts_with("Execution failed"))
        .count();
    assert_eq!(faults, 1);
    assert_eq!(h.tally.cleanup_count(), 1);
}

#[tokio::test]
async fn cancel_without_driver_succeeds() {
    let h = harness(three_step_script());
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();

    h.orchestrator.cancel(&session.id).await.unwrap();
    let cancelled = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    assert!(cancelled.started_at.is_none());
}

#[tokio::test]
async fn pause_before_start_is_rejected() {
    let h = harness(three_step_script());
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();

    let err = h.orchestrator.pause(&session.id).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidState {
            current: SessionStatus::Created,
            requested: SessionStatus::Paused
        }
    ));
    let unchanged = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(unchanged.status, SessionStatus::Created);
}

#[tokio::test]
async fn terminal_sessions_reject_control() {
    let h = harness(three_step_script());
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();
    drain(h.orchestrator.execute_stream(&session.id).await.unwrap()).await;
    h.orchestrator.wait(&session.id).await;
    let before = h.orchestrator.get_session(&session.id).await.unwrap();

    assert!(matches!(
        h.orchestrator.pause(&session.id).await,
        Err(OrchestratorError::InvalidState { .. })
    ));
    assert!(matches!(
        h.orchestrator.resume_background(&session.id).await,
        Err(OrchestratorError::InvalidState { .. })
    ));
    assert!(matches!(
        h.orchestrator.cancel(&session.id).await,
        Err(OrchestratorError::InvalidState { .. })
    ));
    assert!(matches!(
        h.orchestrator.execute_background(&session.id).await,
        Err(OrchestratorError::InvalidState { .. })
    ));

    let after = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(after.status, SessionStatus::Completed);
    assert_eq!(after.completed_at, before.completed_at);
}

#[tokio::test]
async fn second_driver_is_rejected() {
    let h = harness(vec![
        ScriptStep::Emit(EngineOutput::running("working")),
        ScriptStep::Wait(Duration::from_millis(300)),
        ScriptStep::Emit(EngineOutput::completed("done")),
    ]);
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();

    h.orchestrator.execute_background(&session.id).await.unwrap();
    assert!(matches!(
        h.orchestrator.execute_background(&session.id).await,
        Err(OrchestratorError::AlreadyDriving(_))
    ));
    assert!(h.orchestrator.task_status(&session.id).await.unwrap().driver.is_some());

    tokio::time::timeout(Duration::from_secs(5), h.orchestrator.wait(&session.id))
        .await
        .unwrap();
    let done = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(h.tally.constructed.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(h.orchestrator.task_status(&session.id).await.unwrap().driver.is_none());
}

#[tokio::test]
async fn pause_then_resume_continues_remaining_output() {
    let h = harness(vec![
        ScriptStep::Emit(EngineOutput::running("one").with_cost(5, 0.005)),
        ScriptStep::Wait(Duration::from_millis(200)),
        ScriptStep::Emit(EngineOutput::running("two").with_cost(5, 0.005)),
        ScriptStep::Wait(Duration::from_millis(50)),
        ScriptStep::Emit(EngineOutput::completed("done")),
    ]);
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();

    let mut stream = h.orchestrator.execute_stream(&session.id).await.unwrap();
    let first = stream.next().await;
    assert!(matches!(first, Some(SessionEvent::Output(ref o)) if o.content == "one"));

    h.orchestrator.pause(&session.id).await.unwrap();
    assert!(drain(stream).await.is_empty());
    let paused = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);
    assert!(paused.checkpoint_data.is_some());
    let started_at = paused.started_at;
    assert!(started_at.is_some());
    assert!(paused.completed_at.is_none());

    let rest = drain(h.orchestrator.resume_stream(&session.id).await.unwrap()).await;
    assert_eq!(contents(&rest), vec!["two", "done"]);
    h.orchestrator.wait(&session.id).await;

    let done = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.started_at, started_at);
    assert_eq!(done.total_tokens, 10);

    let messages = h.orchestrator.messages(&session.id, 0, None).await.unwrap();
    assert_gapless(&messages);
    let log: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        &log[1..],
        &["one", "Execution paused", "Execution resumed", "two", "done"]
    );
    assert_totals_match(&h, &session.id).await;
    assert_eq!(h.tally.cleanup_count(), 2);
}

#[tokio::test]
async fn cancel_stops_active_driver() {
    let h = harness(vec![
        ScriptStep::Emit(EngineOutput::running("started")),
        ScriptStep::Wait(Duration::from_secs(30)),
        ScriptStep::Emit(EngineOutput::completed("never")),
    ]);
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();

    let mut stream = h.orchestrator.execute_stream(&session.id).await.unwrap();
    assert!(stream.next().await.is_some());

    tokio::time::timeout(Duration::from_secs(5), h.orchestrator.cancel(&session.id))
        .await
        .unwrap()
        .unwrap();
    assert!(drain(stream).await.is_empty());

    let cancelled = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert!(!h.orchestrator.is_driving(&session.id).await);
    assert_eq!(h.tally.cleanup_count(), 1);

    let messages = h.orchestrator.messages(&session.id, 0, None).await.unwrap();
    assert_gapless(&messages);
    assert_eq!(messages.last().map(|m| m.content.as_str()), Some("Execution cancelled"));
}

#[tokio::test]
async fn cancel_paused_session() {
    let h = harness(vec![
        ScriptStep::Emit(EngineOutput::running("one")),
        ScriptStep::Wait(Duration::from_millis(200)),
        ScriptStep::Emit(EngineOutput::completed("done")),
    ]);
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();
    let mut stream = h.orchestrator.execute_stream(&session.id).await.unwrap();
    stream.next().await;
    h.orchestrator.pause(&session.id).await.unwrap();

    h.orchestrator.cancel(&session.id).await.unwrap();
    assert_eq!(
        h.orchestrator.get_session(&session.id).await.unwrap().status,
        SessionStatus::Cancelled
    );
}

#[tokio::test]
async fn intervention_is_applied_and_logged() {
    let h = harness(vec![
        ScriptStep::Emit(EngineOutput::running("a")),
        ScriptStep::Wait(Duration::from_millis(200)),
        ScriptStep::Emit(EngineOutput::completed("b")),
    ]);
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();
    let mut stream = h.orchestrator.execute_stream(&session.id).await.unwrap();
    stream.next().await;

    let intervention = Intervention::new("add_context").with("text", "focus on the tails");
    h.orchestrator.intervene(&session.id, intervention).await.unwrap();
    drain(stream).await;
    h.orchestrator.wait(&session.id).await;

    assert_eq!(h.tally.intervention_kinds(), vec!["add_context".to_string()]);
    let messages = h.orchestrator.messages(&session.id, 0, None).await.unwrap();
    assert_gapless(&messages);
    let user = messages
        .iter()
        .find(|m| m.role == MessageRole::User)
        .expect("intervention message");
    assert_eq!(user.content, "Intervention: add_context");
    assert_eq!(user.metadata.get("intervention_type"), Some(&json!("add_context")));
    assert_eq!(user.metadata.get("text"), Some(&json!("focus on the tails")));
}

#[tokio::test]
async fn intervention_rejected_when_mode_disallows_or_not_running() {
    let h = harness(vec![
        ScriptStep::Emit(EngineOutput::running("a")),
        ScriptStep::Wait(Duration::from_millis(200)),
        ScriptStep::Emit(EngineOutput::completed("b")),
    ]);
    let idle = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();
    assert!(matches!(
        h.orchestrator.intervene(&idle.id, Intervention::new("skip")).await,
        Err(OrchestratorError::InvalidState { .. })
    ));

    let locked = h.orchestrator.create_session("locked", "t", json!({})).await.unwrap();
    let mut stream = h.orchestrator.execute_stream(&locked.id).await.unwrap();
    stream.next().await;
    assert!(matches!(
        h.orchestrator.intervene(&locked.id, Intervention::new("skip")).await,
        Err(OrchestratorError::InterventionNotAllowed(_))
    ));
    drain(stream).await;
    assert!(h.tally.intervention_kinds().is_empty());
}

#[tokio::test]
async fn initialization_failure_reaches_transport_as_error() {
    let h = harness(three_step_script());
    let session = h
        .orchestrator
        .create_session("stub", "t", json!({"config": {"fail_initialize": true}}))
        .await
        .unwrap();

    let events = h.orchestrator.execute_stream(&session.id).await.unwrap();
    let events = tokio::time::timeout(Duration::from_secs(5), tomas::transport::collect(&session.id, events))
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_error());
    let frame = events[0].to_sse_frame();
    assert!(frame.contains("\"status\":\"error\""));
    assert!(matches!(&events[0], StreamEvent::Error { error, .. } if error.contains("scripted failure requested")));
    h.orchestrator.wait(&session.id).await;

    let failed = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(failed.status, SessionStatus::Failed);
    assert!(failed.error_message.unwrap().contains("scripted failure requested"));
    assert_eq!(h.tally.cleanup_count(), 1);
}

#[tokio::test]
async fn failed_element_without_content_gets_message() {
    let h = harness(vec![ScriptStep::Emit(EngineOutput::failed(""))]);
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();
    drain(h.orchestrator.execute_stream(&session.id).await.unwrap()).await;
    h.orchestrator.wait(&session.id).await;

    let failed = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(failed.status, SessionStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("Engine reported failure"));
}

#[tokio::test]
async fn caller_config_overrides_mode_config() {
    let h = harness(three_step_script());
    let session = h
        .orchestrator
        .create_session("stub", "t", json!({"config": {"depth": 2}}))
        .await
        .unwrap();
    drain(h.orchestrator.execute_stream(&session.id).await.unwrap()).await;

    let config = h.tally.last_config.lock().unwrap().clone().unwrap();
    assert_eq!(config.get("depth"), Some(&json!(2)));
    assert_eq!(config.get("backend"), Some(&json!("fast")));
    let workspace = h.tally.last_workspace.lock().unwrap().clone().unwrap();
    assert_eq!(workspace, session.workspace_path);
    assert!(workspace.join("inputs").is_dir());
    assert!(workspace.join("outputs").is_dir());
}

#[tokio::test]
async fn background_sessions_run_concurrently() {
    let h = harness(vec![
        ScriptStep::Emit(EngineOutput::running("go").with_cost(1, 0.001)),
        ScriptStep::Wait(Duration::from_millis(100)),
        ScriptStep::Emit(EngineOutput::completed("ok").with_cost(1, 0.001)),
    ]);
    let mut ids = Vec::new();
    for i in 0..4 {
        let session = h
            .orchestrator
            .create_session("stub", &format!("task {i}"), json!({}))
            .await
            .unwrap();
        h.orchestrator.execute_background(&session.id).await.unwrap();
        ids.push(session.id);
    }
    for id in &ids {
        tokio::time::timeout(Duration::from_secs(5), h.orchestrator.wait(id))
            .await
            .unwrap();
    }
    let completed = h
        .orchestrator
        .list_sessions(&SessionFilter {
            status: Some(SessionStatus::Completed),
            ..SessionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(completed.len(), 4);
    for id in &ids {
        assert_totals_match(&h, id).await;
    }
    assert_eq!(h.tally.cleanup_count(), 4);
}

#[tokio::test]
async fn queued_session_can_be_driven() {
    let h = harness(three_step_script());
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();
    let queued = h.orchestrator.queue_session(&session.id).await.unwrap();
    assert_eq!(queued.status, SessionStatus::Queued);

    drain(h.orchestrator.execute_stream(&session.id).await.unwrap()).await;
    h.orchestrator.wait(&session.id).await;
    assert_eq!(
        h.orchestrator.get_session(&session.id).await.unwrap().status,
        SessionStatus::Completed
    );
}

#[tokio::test]
async fn delete_refused_while_driving() {
    let h = harness(vec![
        ScriptStep::Emit(EngineOutput::running("a")),
        ScriptStep::Wait(Duration::from_millis(200)),
        ScriptStep::Emit(EngineOutput::completed("b")),
    ]);
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();
    h.orchestrator.execute_background(&session.id).await.unwrap();
    assert!(matches!(
        h.orchestrator.delete_session(&session.id).await,
        Err(OrchestratorError::AlreadyDriving(_))
    ));

    h.orchestrator.wait(&session.id).await;
    h.orchestrator.delete_session(&session.id).await.unwrap();
    assert!(matches!(
        h.orchestrator.get_session(&session.id).await,
        Err(OrchestratorError::NotFound { .. })
    ));
    assert!(!session.workspace_path.exists());
}

#[tokio::test]
async fn unknown_mode_and_estimate() {
    let h = harness(three_step_script());
    assert!(matches!(
        h.orchestrator.create_session("nope", "t", json!({})).await,
        Err(OrchestratorError::NotFound { kind: "Mode", .. })
    ));
    let estimate = h.orchestrator.estimate_cost("stub", &json!({})).unwrap();
    assert!((estimate - 0.02).abs() < 1e-9);
    assert!(matches!(
        h.orchestrator.estimate_cost("nope", &json!({})),
        Err(OrchestratorError::NotFound { .. })
    ));
}

#[tokio::test]
async fn pause_while_consumer_lags_behind() {
    let h = harness_with_buffer(
        vec![
            ScriptStep::Emit(EngineOutput::running("1")),
            ScriptStep::Emit(EngineOutput::running("2")),
            ScriptStep::Emit(EngineOutput::running("3")),
            ScriptStep::Wait(Duration::from_millis(500)),
            ScriptStep::Emit(EngineOutput::completed("done")),
        ],
        1,
    );
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();

    let mut stream = h.orchestrator.execute_stream(&session.id).await.unwrap();
    assert!(matches!(stream.next().await, Some(SessionEvent::Output(ref o)) if o.content == "1"));

    tokio::time::timeout(Duration::from_secs(3), h.orchestrator.pause(&session.id))
        .await
        .expect("pause must not wait for the consumer")
        .unwrap();
    assert_eq!(
        h.orchestrator.get_session(&session.id).await.unwrap().status,
        SessionStatus::Paused
    );

    // 已写入审计日志的元素仍会送达原来的流
    let mut live = vec!["1".to_string()];
    live.extend(contents(&drain(stream).await));
    let rest = drain(h.orchestrator.resume_stream(&session.id).await.unwrap()).await;
    live.extend(contents(&rest));
    h.orchestrator.wait(&session.id).await;

    let messages = h.orchestrator.messages(&session.id, 0, None).await.unwrap();
    assert_gapless(&messages);
    let assistant: Vec<String> = messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(live, assistant);
    assert_eq!(assistant.last().map(String::as_str), Some("done"));
    assert_eq!(
        h.orchestrator.get_session(&session.id).await.unwrap().status,
        SessionStatus::Completed
    );
}

#[tokio::test]
async fn engine_panic_fails_session_and_runs_cleanup() {
    let h = harness(vec![
        ScriptStep::Emit(EngineOutput::running("first")),
        ScriptStep::Panic("engine blew up".into()),
    ]);
    let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();

    let events = drain(h.orchestrator.execute_stream(&session.id).await.unwrap()).await;
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[1], SessionEvent::Fault { error } if error.contains("engine blew up")));
    h.orchestrator.wait(&session.id).await;

    let failed = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(failed.status, SessionStatus::Failed);
    assert!(failed.error_message.unwrap().contains("engine blew up"));
    assert_eq!(h.tally.cleanup_count(), 1);

    let messages = h.orchestrator.messages(&session.id, 0, None).await.unwrap();
    assert_gapless(&messages);
    assert!(messages
        .last()
        .is_some_and(|m| m.role == MessageRole::System && m.content.starts_with("Execution failed")));
}

#[tokio::test]
async fn cleanup_failure_keeps_terminal_status() {
    let h = harness(three_step_script());
    let session = h
        .orchestrator
        .create_session("stub", "t", json!({"config": {"fail_cleanup": true}}))
        .await
        .unwrap();
    drain(h.orchestrator.execute_stream(&session.id).await.unwrap()).await;
    h.orchestrator.wait(&session.id).await;

    let done = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert!(done.error_message.is_none());
    assert_eq!(h.tally.cleanup_count(), 1);
}

#[tokio::test]
async fn engine_pause_failure_keeps_drive_running() {
    let h = harness(vec![
        ScriptStep::Emit(EngineOutput::running("a")),
        ScriptStep::Wait(Duration::from_millis(200)),
        ScriptStep::Emit(EngineOutput::completed("b")),
    ]);
    let session = h
        .orchestrator
        .create_session("stub", "t", json!({"config": {"fail_pause": true}}))
        .await
        .unwrap();
    let mut stream = h.orchestrator.execute_stream(&session.id).await.unwrap();
    stream.next().await;

    assert!(matches!(
        h.orchestrator.pause(&session.id).await,
        Err(OrchestratorError::EngineExecution(_))
    ));
    assert_eq!(contents(&drain(stream).await), vec!["b"]);
    h.orchestrator.wait(&session.id).await;

    let done = h.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert!(done.checkpoint_data.is_none());
    let messages = h.orchestrator.messages(&session.id, 0, None).await.unwrap();
    assert!(messages.iter().all(|m| m.content != "Execution paused"));
}

#[tokio::test]
async fn shutdown_cancels_active_sessions() {
    let h = harness(vec![
        ScriptStep::Emit(EngineOutput::running("started")),
        ScriptStep::Wait(Duration::from_secs(30)),
        ScriptStep::Emit(EngineOutput::completed("never")),
    ]);
    let mut ids = Vec::new();
    for _ in 0..2 {
        let session = h.orchestrator.create_session("stub", "t", json!({})).await.unwrap();
        h.orchestrator.execute_background(&session.id).await.unwrap();
        ids.push(session.id);
    }

    tokio::time::timeout(Duration::from_secs(5), h.orchestrator.shutdown())
        .await
        .unwrap();
    for id in &ids {
        assert!(!h.orchestrator.is_driving(id).await);
        let session = h.orchestrator.get_session(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert!(session.completed_at.is_some());
    }
    assert_eq!(h.tally.cleanup_count(), 2);
}
