//! End-to-end checks of the HTTP surface against the in-memory store and a scripted model.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use anteroom::agent::model::DeltaStream;
use anteroom::agent::{AgentLoop, ChatMessage, ChatModel, ModelDelta};
use anteroom::config::{AgentConfig, SafetyConfig};
use anteroom::db::memory::MemoryStore;
use anteroom::errors::AppError;
use anteroom::routes::{self, AppState};
use anteroom::service::{ActiveStreams, ApprovalBroker, ChatService, SearchService};
use anteroom::tools::{ToolDefinition, ToolRegistry};

enum Reply {
    Tokens(Vec<&'static str>),
    Call { id: &'static str, name: &'static str, arguments: &'static str },
    /// Never finishes on its own.
    Hang,
    /// A token every few milliseconds, forever.
    Drip,
}

struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _cancel: &CancellationToken,
        _extra_system_prompt: Option<&str>,
    ) -> Result<DeltaStream, AppError> {
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Tokens(Vec::new()));
        let stream: DeltaStream = match reply {
            Reply::Tokens(tokens) => {
                let deltas: Vec<Result<ModelDelta, AppError>> =
                    tokens.into_iter().map(|t| Ok(ModelDelta::Token(t.to_string()))).collect();
                Box::pin(futures_util::stream::iter(deltas))
            }
            Reply::Call { id, name, arguments } => {
                let delta = ModelDelta::ToolCallDelta {
                    index: 0,
                    id: Some(id.to_string()),
                    name: Some(name.to_string()),
                    arguments: arguments.to_string(),
                };
                Box::pin(futures_util::stream::iter(vec![Ok::<_, AppError>(delta)]))
            }
            Reply::Hang => Box::pin(futures_util::stream::pending::<Result<ModelDelta, AppError>>()),
            Reply::Drip => Box::pin(futures_util::stream::unfold(0u64, |n| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Some((Ok::<_, AppError>(ModelDelta::Token(format!("t{n} "))), n + 1))
            })),
        };
        Ok(stream)
    }
}

struct TestServer {
    base: String,
    client: reqwest::Client,
    _workspace: tempfile::TempDir,
}

impl TestServer {
    async fn start(replies: Vec<Reply>) -> Self {
        let workspace = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let model = Arc::new(ScriptedModel { replies: Mutex::new(replies.into()) });
        let config = AgentConfig { working_dir: Some(workspace.path().to_path_buf()), ..AgentConfig::default() };
        let registry = ToolRegistry::with_builtin_tools(SafetyConfig::default(), &config, store.clone());
        let agent = AgentLoop::new(model, Arc::new(registry), config);

        let state = AppState {
            chat: ChatService::new(store.clone()),
            agent: Arc::new(agent),
            streams: Arc::new(ActiveStreams::new(Duration::from_secs(300))),
            approvals: Arc::new(ApprovalBroker::new(Duration::from_secs(5))),
            search: SearchService::new(store, None),
            worker: None,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, routes::router(state)).await.unwrap();
        });

        Self { base: format!("http://{addr}"), client: reqwest::Client::new(), _workspace: workspace }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn create_conversation(&self) -> String {
        let resp = self
            .client
            .post(self.url("/api/conversations"))
            .json(&json!({ "title": "integration" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        body["id"].as_str().unwrap().to_string()
    }

    async fn chat(&self, id: &str, message: &str) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/api/conversations/{id}/chat")))
            .json(&json!({ "message": message }))
            .send()
            .await
            .unwrap()
    }
}

/// Reads SSE frames off a streaming response as `(kind, data)` pairs.
struct EventReader {
    resp: reqwest::Response,
    buf: String,
}

impl EventReader {
    fn new(resp: reqwest::Response) -> Self {
        Self { resp, buf: String::new() }
    }

    async fn next(&mut self) -> Option<(String, Value)> {
        loop {
            if let Some(end) = self.buf.find("\n\n") {
                let frame: String = self.buf.drain(..end + 2).collect();
                let mut kind = None;
                let mut data = String::new();
                for line in frame.lines() {
                    if let Some(k) = line.strip_prefix("event:") {
                        kind = Some(k.trim().to_string());
                    } else if let Some(d) = line.strip_prefix("data:") {
                        data.push_str(d.trim_start());
                    }
                }
                // Keep-alive comments carry no event.
                if let Some(kind) = kind {
                    return Some((kind, serde_json::from_str(&data).unwrap_or(Value::Null)));
                }
                continue;
            }
            let chunk = self.resp.chunk().await.unwrap()?;
            self.buf.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    /// Reads until `kind` arrives, returning its data.
    async fn until(&mut self, kind: &str) -> Value {
        while let Some((k, data)) = self.next().await {
            if k == kind {
                return data;
            }
        }
        panic!("stream ended before {kind}");
    }

    async fn remaining(mut self) -> Vec<(String, Value)> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

#[tokio::test]
async fn create_list_and_delete_conversation() {
    let server = TestServer::start(Vec::new()).await;
    let id = server.create_conversation().await;

    let list: Value = server.client.get(server.url("/api/conversations")).send().await.unwrap().json().await.unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["title"], "integration");
    assert_eq!(list[0]["type"], "chat");

    let resp = server.client.delete(server.url(&format!("/api/conversations/{id}"))).send().await.unwrap();
    assert_eq!(resp.status(), 204);

    let resp = server.client.delete(server.url(&format!("/api/conversations/{id}"))).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn stop_on_idle_conversation_then_chat_streams() {
    let server = TestServer::start(vec![Reply::Tokens(vec!["Hel", "lo"])]).await;
    let id = server.create_conversation().await;

    let resp = server.client.post(server.url(&format!("/api/conversations/{id}/stop"))).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "stopped");

    let resp = server.chat(&id, "hi").await;
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"].to_str().unwrap().starts_with("text/event-stream"));
    let text = resp.text().await.unwrap();
    assert!(text.contains("event: token"), "{text}");
    assert!(text.contains("event: done"), "{text}");

    let messages: Value = server
        .client
        .get(server.url(&format!("/api/conversations/{id}/messages")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "Hello");
}

#[tokio::test]
async fn chat_rejects_bad_input() {
    let server = TestServer::start(Vec::new()).await;
    let id = server.create_conversation().await;

    assert_eq!(server.chat("not-a-uuid", "hi").await.status(), 400);
    let missing = uuid::Uuid::new_v4().to_string();
    assert_eq!(server.chat(&missing, "hi").await.status(), 404);
    assert_eq!(server.chat(&id, "   ").await.status(), 400);
    let huge = "x".repeat(32_001);
    assert_eq!(server.chat(&id, &huge).await.status(), 400);
}

#[tokio::test]
async fn second_stream_conflicts_until_stopped() {
    let server = TestServer::start(vec![Reply::Hang, Reply::Tokens(vec!["again"])]).await;
    let id = server.create_conversation().await;

    let first = server.chat(&id, "long task").await;
    assert_eq!(first.status(), 200);

    let second = server.chat(&id, "another").await;
    assert_eq!(second.status(), 409);

    let rewind = server
        .client
        .post(server.url(&format!("/api/conversations/{id}/rewind")))
        .json(&json!({ "position": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(rewind.status(), 409);

    let stop = server.client.post(server.url(&format!("/api/conversations/{id}/stop"))).send().await.unwrap();
    assert_eq!(stop.status(), 200);

    // The cancelled stream closes, which releases the conversation.
    tokio::time::timeout(Duration::from_secs(5), first.text()).await.unwrap().unwrap();

    let mut status = 409;
    for _ in 0..50 {
        let resp = server.chat(&id, "after stop").await;
        status = resp.status().as_u16();
        if status == 200 {
            let text = resp.text().await.unwrap();
            assert!(text.contains("event: done"), "{text}");
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, 200);
}

#[tokio::test]
async fn unknown_approval_is_not_found() {
    let server = TestServer::start(Vec::new()).await;
    let resp = server
        .client
        .post(server.url("/api/approvals/does-not-exist"))
        .json(&json!({ "approved": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn search_and_embeddings_report_disabled() {
    let server = TestServer::start(Vec::new()).await;

    let resp = server.client.get(server.url("/api/search?q=hello")).send().await.unwrap();
    assert_eq!(resp.status(), 503);

    let status: Value =
        server.client.get(server.url("/api/embeddings/status")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status, json!({ "enabled": false }));

    let resp = server.client.post(server.url("/api/embeddings/reset")).send().await.unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn missing_canvas_is_not_found() {
    let server = TestServer::start(Vec::new()).await;
    let id = server.create_conversation().await;
    let resp = server.client.get(server.url(&format!("/api/conversations/{id}/canvas"))).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn client_disconnect_cancels_the_turn_and_frees_the_conversation() {
    let server = TestServer::start(vec![Reply::Drip, Reply::Tokens(vec!["back"])]).await;
    let id = server.create_conversation().await;

    let mut reader = EventReader::new(server.chat(&id, "talk forever").await);
    reader.until("token").await;
    assert_eq!(server.chat(&id, "too soon").await.status(), 409);
    drop(reader);

    let accepted = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let resp = server.chat(&id, "after disconnect").await;
            if resp.status() == 200 {
                return resp;
            }
            assert_eq!(resp.status(), 409);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("conversation still locked after the client went away");

    let events = EventReader::new(accepted).remaining().await;
    assert_eq!(events.last().map(|(k, _)| k.as_str()), Some("done"));
}

async fn gated_bash_turn(approved: bool) -> Vec<(String, Value)> {
    let server = TestServer::start(vec![
        Reply::Call { id: "call_1", name: "bash", arguments: r#"{"command": "rm -rf scratch"}"# },
        Reply::Tokens(vec!["handled"]),
    ])
    .await;
    let id = server.create_conversation().await;

    let mut reader = EventReader::new(server.chat(&id, "clean up").await);
    let request = reader.until("approval_required").await;
    assert_eq!(request["tool_name"], "bash");
    assert!(request["reason"].as_str().unwrap().contains("rm"));

    let approval_id = request["approval_id"].as_str().unwrap();
    let resp = server
        .client
        .post(server.url(&format!("/api/approvals/{approval_id}")))
        .json(&json!({ "approved": approved }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["approved"], approved);

    reader.remaining().await
}

fn tool_end_status(events: &[(String, Value)]) -> Value {
    events
        .iter()
        .find(|(kind, _)| kind == "tool_call_end")
        .map(|(_, data)| data["status"].clone())
        .expect("no tool_call_end")
}

#[tokio::test]
async fn approved_tool_call_runs() {
    let events = gated_bash_turn(true).await;
    assert_eq!(tool_end_status(&events), "success");
    assert_eq!(events.last().map(|(k, _)| k.as_str()), Some("done"));
}

#[tokio::test]
async fn denied_tool_call_is_reported_to_the_model() {
    let events = gated_bash_turn(false).await;
    assert_eq!(tool_end_status(&events), "denied");
    assert_eq!(events.last().map(|(k, _)| k.as_str()), Some("done"));
}

#[tokio::test]
async fn run_agent_events_arrive_in_order_on_the_wire() {
    let server = TestServer::start(vec![
        Reply::Call { id: "call_sub", name: "run_agent", arguments: r#"{"prompt": "count files"}"# },
        Reply::Tokens(vec!["child result"]),
        Reply::Tokens(vec!["final"]),
    ])
    .await;
    let id = server.create_conversation().await;

    let events = EventReader::new(server.chat(&id, "delegate").await).remaining().await;
    let kinds: Vec<&str> = events.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(
        kinds,
        vec!["tool_call_start", "subagent_event", "tool_call_end", "token", "assistant_message", "done"]
    );

    let (_, nested) = &events[1];
    assert_eq!(nested["tool_call_id"], "call_sub");
    let nested_kinds: Vec<&str> =
        nested["events"].as_array().unwrap().iter().map(|e| e["kind"].as_str().unwrap()).collect();
    assert_eq!(nested_kinds, vec!["token", "assistant_message", "done"]);
    assert_eq!(events[2].1["output"]["output"], "child result");
}
