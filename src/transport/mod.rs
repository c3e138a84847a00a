//! 流式传输：把会话事件渲染为推送记录
//!
//! 每个 SessionEvent 对应一条 StreamEvent，顺序不变；故障时最后一条为 status = "error"。

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::core::{SessionEvent, SessionEventStream};
use crate::engine::{Artifact, ConfigMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Output {
        session_id: String,
        status: String,
        content: String,
        artifacts: Vec<Artifact>,
        metadata: ConfigMap,
    },
    Error {
        session_id: String,
        status: String,
        error: String,
    },
}

impl StreamEvent {
    pub fn from_session_event(session_id: &str, event: SessionEvent) -> Self {
        match event {
            SessionEvent::Output(output) => Self::Output {
                session_id: session_id.to_string(),
                status: output.status.as_str().to_string(),
                content: output.content,
                artifacts: output.artifacts,
                metadata: output.metadata,
            },
            SessionEvent::Fault { error } => Self::error(session_id, error),
        }
    }

    pub fn error(session_id: &str, error: impl Into<String>) -> Self {
        Self::Error {
            session_id: session_id.to_string(),
            status: "error".to_string(),
            error: error.into(),
        }
    }

    pub fn status(&self) -> &str {
        match self {
            Self::Output { status, .. } | Self::Error { status, .. } => status,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// `data: <json>\n\n`
    pub fn to_sse_frame(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("data: {json}\n\n"),
            Err(e) => {
                tracing::warn!("Failed to encode stream event: {}", e);
                String::new()
            }
        }
    }
}

pub type StreamEventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// 会话事件流 -> 传输事件流（一进一出，保持顺序）
pub fn event_stream(session_id: &str, events: SessionEventStream) -> StreamEventStream {
    let session_id = session_id.to_string();
    Box::pin(events.map(move |event| StreamEvent::from_session_event(&session_id, event)))
}

/// 后台路径：消费到流结束，返回全部事件
pub async fn collect(session_id: &str, events: SessionEventStream) -> Vec<StreamEvent> {
    event_stream(session_id, events).collect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOutput;

    #[test]
    fn error_frame_shape() {
        let frame = StreamEvent::error("s1", "boom").to_sse_frame();
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        let json: serde_json::Value = serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(json, serde_json::json!({"session_id": "s1", "status": "error", "error": "boom"}));
    }

    #[tokio::test]
    async fn one_event_per_element_in_order() {
        let events: SessionEventStream = Box::pin(futures_util::stream::iter(vec![
            SessionEvent::Output(EngineOutput::running("a")),
            SessionEvent::Output(EngineOutput::running("b")),
            SessionEvent::Fault { error: "bad".into() },
        ]));
        let collected = collect("s1", events).await;
        let statuses: Vec<&str> = collected.iter().map(|e| e.status()).collect();
        assert_eq!(statuses, vec!["running", "running", "error"]);
        assert!(collected[2].is_error());
    }
}
