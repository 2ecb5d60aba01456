//! Streaming client for OpenAI-compatible `/chat/completions` endpoints.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::model::{ChatMessage, ChatModel, ChatRole, DeltaStream, ModelDelta};
use crate::config::AiConfig;
use crate::errors::AppError;
use crate::http::{bearer_headers, build_client, parse_sse_data, ApiKeyProvider};
use crate::tools::ToolDefinition;

#[derive(Clone)]
pub struct OpenAiChatService {
    client: reqwest::Client,
    base_url: String,
    model: String,
    system_prompt: String,
    api_key: ApiKeyProvider,
}

impl OpenAiChatService {
    pub fn new(config: &AiConfig, api_key: ApiKeyProvider) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(config.request_timeout_secs)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            api_key,
        })
    }

    fn request_body(&self, messages: &[ChatMessage], tools: &[ToolDefinition], extra_system_prompt: Option<&str>) -> Value {
        let mut system = self.system_prompt.clone();
        if let Some(extra) = extra_system_prompt.filter(|e| !e.trim().is_empty()) {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(extra);
        }

        let mut wire: Vec<Value> = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            wire.push(json!({ "role": "system", "content": system }));
        }
        wire.extend(messages.iter().map(message_to_openai));

        let mut body = json!({
            "model": self.model,
            "messages": wire,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(ToolDefinition::to_function_schema).collect());
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .headers(bearer_headers(&self.api_key.current()))
            .json(body)
            .send()
            .await?;
        Ok(resp)
    }

    /// Sends the request, refreshing the key once on a 401.
    async fn send(&self, body: &Value) -> Result<reqwest::Response, AppError> {
        let mut resp = self.post(body).await?;
        if resp.status().as_u16() == 401 && self.api_key.can_refresh() {
            warn!(model = %self.model, "Chat completion unauthorized, refreshing API key");
            self.api_key.refresh().await?;
            resp = self.post(body).await?;
        }

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::from_status(status, &text, &self.model));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatService {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
        extra_system_prompt: Option<&str>,
    ) -> Result<DeltaStream, AppError> {
        let body = self.request_body(messages, tools, extra_system_prompt);
        debug!(model = %self.model, messages = messages.len(), tools = tools.len(), "Starting chat completion stream");

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Ok(Box::pin(futures_util::stream::empty())),
            resp = self.send(&body) => resp?,
        };

        let cancel = cancel.clone();
        let byte_stream = resp.bytes_stream();
        let stream = async_stream::stream! {
            let mut lines = LineBuffer::default();
            futures_util::pin_mut!(byte_stream);

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = byte_stream.next() => next,
                };
                let chunk = match next {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        yield Err(AppError::from(e));
                        break;
                    }
                    None => break,
                };

                for line in lines.push(&chunk) {
                    let Some(data) = parse_sse_data(&line) else { continue };
                    match parse_chunk(data) {
                        Ok(deltas) => {
                            for delta in deltas {
                                yield Ok(delta);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Byte buffer for the response body. Lines are decoded only once complete, so a
/// multi-byte character split across network chunks survives intact.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.bytes.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.bytes.drain(..=end).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }
}

fn message_to_openai(msg: &ChatMessage) -> Value {
    match msg.role {
        ChatRole::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        }),
        ChatRole::Assistant if !msg.tool_calls.is_empty() => {
            let calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": { "name": tc.name, "arguments": tc.arguments },
                    })
                })
                .collect();
            let content = if msg.content.is_empty() { Value::Null } else { Value::String(msg.content.clone()) };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        role => json!({ "role": role.as_str(), "content": msg.content }),
    }
}

// ── Stream chunk wire types ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StreamToolCall>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

fn parse_chunk(data: &str) -> Result<Vec<ModelDelta>, AppError> {
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            debug!(error = %e, "Skipping unparseable stream chunk");
            return Ok(Vec::new());
        }
    };
    if let Some(err) = chunk.error {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(AppError::InferenceError { message });
    }

    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            deltas.push(ModelDelta::Token(text));
        }
        for tc in choice.delta.tool_calls {
            let (name, arguments) = match tc.function {
                Some(f) => (f.name, f.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            deltas.push(ModelDelta::ToolCallDelta { index: tc.index, id: tc.id, name, arguments });
        }
    }
    Ok(deltas)
}
