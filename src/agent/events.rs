//! Events emitted by the agent loop, and where they go.

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::models::ToolCallStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    Token {
        content: String,
    },
    ToolCallStart {
        id: String,
        tool_name: String,
        arguments: Value,
    },
    ToolCallEnd {
        id: String,
        tool_name: String,
        status: ToolCallStatus,
        output: Value,
        elapsed_seconds: f64,
    },
    /// Everything a nested loop emitted, replayed as one batch.
    SubagentEvent {
        tool_call_id: String,
        events: Vec<AgentEvent>,
    },
    CanvasStreamStart {
        id: String,
        tool_name: String,
    },
    CanvasStreaming {
        id: String,
        content: String,
    },
    CanvasCreated {
        id: String,
        title: String,
        content: String,
        version: i32,
    },
    CanvasUpdated {
        id: String,
        title: String,
        content: String,
        version: i32,
    },
    ApprovalRequired {
        approval_id: String,
        tool_name: String,
        reason: String,
        details: Map<String, Value>,
    },
    AssistantMessage {
        content: String,
    },
    Error {
        message: String,
    },
    Done {},
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::Token { .. } => "token",
            AgentEvent::ToolCallStart { .. } => "tool_call_start",
            AgentEvent::ToolCallEnd { .. } => "tool_call_end",
            AgentEvent::SubagentEvent { .. } => "subagent_event",
            AgentEvent::CanvasStreamStart { .. } => "canvas_stream_start",
            AgentEvent::CanvasStreaming { .. } => "canvas_streaming",
            AgentEvent::CanvasCreated { .. } => "canvas_created",
            AgentEvent::CanvasUpdated { .. } => "canvas_updated",
            AgentEvent::ApprovalRequired { .. } => "approval_required",
            AgentEvent::AssistantMessage { .. } => "assistant_message",
            AgentEvent::Error { .. } => "error",
            AgentEvent::Done {} => "done",
        }
    }

    /// The event body without its `kind` tag: the SSE `data:` line.
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => {
                map.remove("kind");
                Value::Object(map)
            }
            _ => Value::Object(Map::new()),
        }
    }
}

/// Destination for loop events: the live transport, or a buffer for sub-agents.
pub enum EventSink {
    Live(mpsc::Sender<AgentEvent>),
    Buffer(Vec<AgentEvent>),
}

impl EventSink {
    pub fn buffer() -> Self {
        EventSink::Buffer(Vec::new())
    }

    /// Returns `false` once the live receiver is gone.
    pub async fn emit(&mut self, event: AgentEvent) -> bool {
        match self {
            EventSink::Live(tx) => tx.send(event).await.is_ok(),
            EventSink::Buffer(events) => {
                events.push(event);
                true
            }
        }
    }

    pub fn into_events(self) -> Vec<AgentEvent> {
        match self {
            EventSink::Live(_) => Vec::new(),
            EventSink::Buffer(events) => events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn kind_matches_serialized_tag() {
        let events = vec![
            AgentEvent::Token { content: "hi".into() },
            AgentEvent::ToolCallEnd {
                id: "c1".into(),
                tool_name: "bash".into(),
                status: ToolCallStatus::Success,
                output: json!({}),
                elapsed_seconds: 0.5,
            },
            AgentEvent::SubagentEvent { tool_call_id: "c1".into(), events: vec![] },
            AgentEvent::Done {},
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["kind"], event.kind());
        }
    }

    #[test]
    fn payload_drops_kind() {
        let event = AgentEvent::ToolCallStart {
            id: "call_1".into(),
            tool_name: "bash".into(),
            arguments: json!({"command": "ls"}),
        };
        assert_eq!(
            event.payload(),
            json!({"id": "call_1", "tool_name": "bash", "arguments": {"command": "ls"}})
        );
        assert_eq!(AgentEvent::Done {}.payload(), json!({}));
    }

    #[test]
    fn nested_events_keep_their_kind() {
        let event = AgentEvent::SubagentEvent {
            tool_call_id: "c1".into(),
            events: vec![AgentEvent::Token { content: "x".into() }],
        };
        assert_eq!(event.payload()["events"][0], json!({"kind": "token", "content": "x"}));
    }

    #[tokio::test]
    async fn live_sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(4);
        let mut sink = EventSink::Live(tx);
        assert!(sink.emit(AgentEvent::Done {}).await);
        drop(rx);
        assert!(!sink.emit(AgentEvent::Done {}).await);
    }
}
