//! Tomas 命令行入口
//!
//! - `tomas modes`：列出模式目录
//! - `tomas estimate <mode> [input-json]`：费用估算
//! - `tomas run <mode> <task> [input-json]`：创建会话并以 SSE 帧输出执行过程

use std::io::Write;

use anyhow::{bail, Context};
use futures_util::StreamExt;
use serde_json::Value;
use tomas::core::create_orchestrator_builder;
use tomas::transport::{event_stream, StreamEvent};

fn parse_input(arg: Option<&String>) -> anyhow::Result<Value> {
    match arg {
        Some(raw) => serde_json::from_str(raw).context("input must be a JSON object"),
        None => Ok(Value::Object(Default::default())),
    }
}

fn usage() -> &'static str {
    "usage: tomas <modes | estimate <mode> [input-json] | run <mode> <task> [input-json]>"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tomas::observability::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!(usage());
    };

    let orchestrator = create_orchestrator_builder(None)
        .build()
        .await
        .context("Failed to build orchestrator")?;

    for (engine, reason) in orchestrator.registry().load_failures() {
        tracing::warn!("Engine {} unavailable: {}", engine, reason);
    }

    match command.as_str() {
        "modes" => {
            for mode in orchestrator.catalog().list_all() {
                println!("{:<12} {:<10} {:<10} {}", mode.id, mode.engine.as_str(), mode.category, mode.name);
            }
        }
        "estimate" => {
            let Some(mode_id) = args.get(1) else {
                bail!(usage());
            };
            let input = parse_input(args.get(2))?;
            let cost = orchestrator.estimate_cost(mode_id, &input)?;
            println!("{cost:.2}");
        }
        "run" => {
            let (Some(mode_id), Some(task)) = (args.get(1), args.get(2)) else {
                bail!(usage());
            };
            let input = parse_input(args.get(3))?;
            let session = orchestrator.create_session(mode_id, task, input).await?;
            tracing::info!("Session {} workspace {:?}", session.id, session.workspace_path);

            let events = orchestrator.execute_stream(&session.id).await?;
            let mut events = event_stream(&session.id, events);
            let mut stdout = std::io::stdout();

            loop {
                tokio::select! {
                    event = events.next() => {
                        let Some(event) = event else { break };
                        stdout.write_all(event.to_sse_frame().as_bytes())?;
                        stdout.flush()?;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Interrupted, cancelling session {}", session.id);
                        orchestrator.cancel(&session.id).await?;
                        let frame = StreamEvent::error(&session.id, "Execution cancelled").to_sse_frame();
                        stdout.write_all(frame.as_bytes())?;
                        break;
                    }
                }
            }

            orchestrator.wait(&session.id).await;
            let session = orchestrator.get_session(&session.id).await?;
            tracing::info!(
                "Session {} {} (cost ${:.4}, {} tokens)",
                session.id,
                session.status,
                session.total_cost,
                session.total_tokens
            );
        }
        other => bail!("unknown command '{}'; {}", other, usage()),
    }

    orchestrator.shutdown().await;
    Ok(())
}
