//! The agent loop: drives one model turn through tool-call rounds to a terminal state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{AgentEvent, EventSink};
use super::model::{ChatMessage, ChatModel, ModelDelta, ToolCallRequest};
use super::streaming_content::extract_streaming_content;
use crate::config::AgentConfig;
use crate::models::{ToolCallRecord, ToolCallStatus};
use crate::tools::canvas::{is_canvas_tool, CREATE_CANVAS};
use crate::tools::{subagent, truncate_output, ConfirmCallback, ToolContext, ToolRegistry};

#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Done,
    Error(String),
    Cancelled,
}

/// One model response and the tool calls it triggered.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundRecord {
    pub text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    /// What was fed back to the model for each call, same order as `tool_calls`.
    pub tool_results: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub termination: Termination,
    pub rounds: Vec<RoundRecord>,
    /// Text of the closing response when the turn finished normally.
    pub final_text: String,
}

impl TurnOutcome {
    fn new(termination: Termination, rounds: Vec<RoundRecord>) -> Self {
        Self { termination, rounds, final_text: String::new() }
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallRecord> {
        self.rounds.iter().flat_map(|r| r.tool_calls.iter())
    }
}

/// A tool call whose arguments are still streaming in.
#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
    preview_started: bool,
    last_preview: Option<String>,
}

#[derive(Clone)]
pub struct AgentLoop {
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRegistry>,
    config: AgentConfig,
    working_dir: PathBuf,
}

impl AgentLoop {
    pub fn new(model: Arc<dyn ChatModel>, tools: Arc<ToolRegistry>, config: AgentConfig) -> Self {
        let working_dir = config.resolved_working_dir();
        Self { model, tools, config, working_dir }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// A loop without tools runs without `run_agent` as well.
    fn subagents_enabled(&self) -> bool {
        !self.tools.is_empty()
    }

    /// Runs one turn over `history`, emitting events into `sink`.
    pub async fn run(
        &self,
        conversation_id: &str,
        history: Vec<ChatMessage>,
        sink: &mut EventSink,
        cancel: &CancellationToken,
        confirm: Option<&ConfirmCallback>,
    ) -> TurnOutcome {
        self.run_at_depth(conversation_id, history, sink, cancel, confirm, 0, None)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    fn run_at_depth<'a>(
        &'a self,
        conversation_id: &'a str,
        history: Vec<ChatMessage>,
        sink: &'a mut EventSink,
        cancel: &'a CancellationToken,
        confirm: Option<&'a ConfirmCallback>,
        depth: usize,
        extra_system_prompt: Option<&'a str>,
    ) -> BoxFuture<'a, TurnOutcome> {
        Box::pin(async move {
            let mut messages = history;
            let mut rounds: Vec<RoundRecord> = Vec::new();
            let mut tool_rounds = 0usize;

            let mut tools = self.tools.definitions();
            if self.subagents_enabled() && depth < self.config.max_subagent_depth {
                tools.push(subagent::definition());
            }

            let ctx = ToolContext {
                conversation_id: conversation_id.to_string(),
                working_dir: self.working_dir.clone(),
            };

            loop {
                // ── Model call ───────────────────────────────────────────────
                if cancel.is_cancelled() {
                    return TurnOutcome::new(Termination::Cancelled, rounds);
                }

                let stream = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return TurnOutcome::new(Termination::Cancelled, rounds),
                    res = self.model.stream_chat(&messages, &tools, cancel, extra_system_prompt) => res,
                };
                let mut stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(conversation_id, depth, error = %e, "Model request failed");
                        return fail(sink, cancel, rounds, e.to_string()).await;
                    }
                };

                let mut text = String::new();
                let mut pending: BTreeMap<usize, PendingCall> = BTreeMap::new();

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return TurnOutcome::new(Termination::Cancelled, rounds),
                        next = stream.next() => next,
                    };
                    let delta = match next {
                        None => break,
                        Some(Ok(delta)) => delta,
                        Some(Err(e)) => {
                            warn!(conversation_id, depth, error = %e, "Model stream failed");
                            return fail(sink, cancel, rounds, e.to_string()).await;
                        }
                    };

                    match delta {
                        ModelDelta::Token(token) => {
                            text.push_str(&token);
                            if !emit(sink, cancel, AgentEvent::Token { content: token }).await {
                                return TurnOutcome::new(Termination::Cancelled, rounds);
                            }
                        }
                        ModelDelta::ToolCallDelta { index, id, name, arguments } => {
                            let call = pending.entry(index).or_default();
                            if let Some(id) = id.filter(|i| !i.is_empty()) {
                                call.id = id;
                            }
                            if let Some(name) = name.filter(|n| !n.is_empty()) {
                                call.name = name;
                            }
                            call.arguments.push_str(&arguments);

                            if let Some(event) = canvas_preview(call) {
                                if !emit(sink, cancel, event).await {
                                    return TurnOutcome::new(Termination::Cancelled, rounds);
                                }
                            }
                            if let Some(event) = canvas_progress(call) {
                                if !emit(sink, cancel, event).await {
                                    return TurnOutcome::new(Termination::Cancelled, rounds);
                                }
                            }
                        }
                    }
                }

                if cancel.is_cancelled() {
                    return TurnOutcome::new(Termination::Cancelled, rounds);
                }

                // ── Final answer ─────────────────────────────────────────────
                if pending.is_empty() {
                    if !text.is_empty() {
                        let event = AgentEvent::AssistantMessage { content: text.clone() };
                        if !emit(sink, cancel, event).await {
                            return TurnOutcome::new(Termination::Cancelled, rounds);
                        }
                    }
                    rounds.push(RoundRecord { text: text.clone(), tool_calls: Vec::new(), tool_results: Vec::new() });
                    if !emit(sink, cancel, AgentEvent::Done {}).await {
                        return TurnOutcome::new(Termination::Cancelled, rounds);
                    }
                    info!(conversation_id, depth, rounds = rounds.len(), "Agent turn complete");
                    return TurnOutcome { termination: Termination::Done, rounds, final_text: text };
                }

                // ── Tool round ───────────────────────────────────────────────
                tool_rounds += 1;
                if tool_rounds > self.config.max_tool_iterations {
                    warn!(conversation_id, depth, limit = self.config.max_tool_iterations, "Tool iteration limit reached");
                    rounds.push(RoundRecord { text, tool_calls: Vec::new(), tool_results: Vec::new() });
                    let message = format!(
                        "Exceeded maximum tool iterations ({})",
                        self.config.max_tool_iterations
                    );
                    return fail(sink, cancel, rounds, message).await;
                }

                let requests: Vec<ToolCallRequest> = pending
                    .into_values()
                    .map(|p| ToolCallRequest {
                        id: if p.id.is_empty() { format!("call_{}", Uuid::new_v4().simple()) } else { p.id },
                        name: p.name,
                        arguments: p.arguments,
                    })
                    .collect();

                let mut round = RoundRecord { text: text.clone(), tool_calls: Vec::new(), tool_results: Vec::new() };
                let mut executed: Vec<ToolCallRequest> = Vec::new();
                let mut cancelled = false;

                for request in &requests {
                    if cancel.is_cancelled() {
                        cancelled = true;
                        break;
                    }

                    let parsed = parse_arguments(&request.arguments);
                    let arguments = parsed.clone().unwrap_or_else(|_| Value::String(request.arguments.clone()));
                    let start = AgentEvent::ToolCallStart {
                        id: request.id.clone(),
                        tool_name: request.name.clone(),
                        arguments: arguments.clone(),
                    };
                    if !emit(sink, cancel, start).await {
                        cancelled = true;
                        break;
                    }

                    let started = Instant::now();
                    let mut child_events = None;
                    let (status, output) = match parsed {
                        Err(message) => (ToolCallStatus::Error, json!({ "error": message })),
                        Ok(args) if request.name == subagent::NAME && self.subagents_enabled() => {
                            let (status, output, events) = self
                                .run_subagent(conversation_id, &args, cancel, confirm, depth)
                                .await;
                            child_events = Some(events);
                            (status, output)
                        }
                        Ok(args) => match self.tools.call(&request.name, &args, &ctx, confirm).await {
                            Ok(result) => (result.status, result.output),
                            Err(e) => {
                                warn!(tool = %request.name, error = %e, "Tool call failed");
                                (ToolCallStatus::Error, json!({ "error": e.to_string() }))
                            }
                        },
                    };
                    let elapsed_seconds = round_millis(started.elapsed().as_secs_f64());
                    let output = match (&request.name[..], output) {
                        (subagent::NAME, Value::Object(mut map)) => {
                            map.insert("elapsed_seconds".to_string(), json!(elapsed_seconds));
                            Value::Object(map)
                        }
                        (_, other) => other,
                    };

                    let fed_back = truncate_output(&output.to_string(), self.config.tool_output_max_chars);
                    round.tool_calls.push(ToolCallRecord {
                        id: request.id.clone(),
                        tool_name: request.name.clone(),
                        arguments,
                        status,
                        output: output.clone(),
                        elapsed_seconds,
                    });
                    round.tool_results.push(fed_back);
                    executed.push(request.clone());

                    // The call finished; its result is kept but never fed back.
                    if cancel.is_cancelled() {
                        cancelled = true;
                        break;
                    }

                    if let Some(events) = child_events {
                        let batch = AgentEvent::SubagentEvent { tool_call_id: request.id.clone(), events };
                        if !emit(sink, cancel, batch).await {
                            cancelled = true;
                            break;
                        }
                    }

                    let end = AgentEvent::ToolCallEnd {
                        id: request.id.clone(),
                        tool_name: request.name.clone(),
                        status,
                        output: output.clone(),
                        elapsed_seconds,
                    };
                    if !emit(sink, cancel, end).await {
                        cancelled = true;
                        break;
                    }

                    if status == ToolCallStatus::Success && is_canvas_tool(&request.name) {
                        if let Some(event) = canvas_result_event(&request.name, &output) {
                            if !emit(sink, cancel, event).await {
                                cancelled = true;
                                break;
                            }
                        }
                    }
                }

                if cancelled {
                    rounds.push(round);
                    return TurnOutcome::new(Termination::Cancelled, rounds);
                }

                messages.push(ChatMessage::assistant(text, executed));
                for (record, content) in round.tool_calls.iter().zip(&round.tool_results) {
                    messages.push(ChatMessage::tool(record.id.clone(), content.clone()));
                }
                debug!(conversation_id, depth, calls = round.tool_calls.len(), "Tool round complete");
                rounds.push(round);
            }
        })
    }

    /// Runs `run_agent` as a nested loop whose events are buffered.
    async fn run_subagent(
        &self,
        conversation_id: &str,
        args: &Value,
        cancel: &CancellationToken,
        confirm: Option<&ConfirmCallback>,
        depth: usize,
    ) -> (ToolCallStatus, Value, Vec<AgentEvent>) {
        if depth >= self.config.max_subagent_depth {
            let message = format!("Maximum sub-agent depth ({}) reached", self.config.max_subagent_depth);
            return (ToolCallStatus::Error, json!({ "error": message }), Vec::new());
        }
        let prompt = match subagent::prompt_from_args(args) {
            Ok(p) => p,
            Err(e) => return (ToolCallStatus::Error, json!({ "error": e.to_string() }), Vec::new()),
        };

        info!(conversation_id, depth = depth + 1, "Starting sub-agent");
        let mut child_sink = EventSink::buffer();
        let outcome = self
            .run_at_depth(
                conversation_id,
                vec![ChatMessage::user(prompt)],
                &mut child_sink,
                cancel,
                confirm,
                depth + 1,
                Some(subagent::SUBAGENT_PROMPT),
            )
            .await;
        let events = child_sink.into_events();

        match outcome.termination {
            Termination::Done => (ToolCallStatus::Success, json!({ "output": outcome.final_text }), events),
            Termination::Error(message) => (ToolCallStatus::Error, json!({ "error": message }), events),
            Termination::Cancelled => (ToolCallStatus::Error, json!({ "error": "Sub-agent cancelled" }), events),
        }
    }
}

/// Sends an event; a vanished receiver cancels the turn.
async fn emit(sink: &mut EventSink, cancel: &CancellationToken, event: AgentEvent) -> bool {
    if sink.emit(event).await {
        return true;
    }
    debug!("Event receiver dropped, cancelling turn");
    cancel.cancel();
    false
}

async fn fail(sink: &mut EventSink, cancel: &CancellationToken, rounds: Vec<RoundRecord>, message: String) -> TurnOutcome {
    if cancel.is_cancelled() {
        return TurnOutcome::new(Termination::Cancelled, rounds);
    }
    emit(sink, cancel, AgentEvent::Error { message: message.clone() }).await;
    TurnOutcome::new(Termination::Error(message), rounds)
}

fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ Value::Object(_)) => Ok(v),
        Ok(_) => Err("Tool arguments must be a JSON object".to_string()),
        Err(e) => Err(format!("Invalid JSON in tool arguments: {e}")),
    }
}

fn round_millis(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

/// `canvas_stream_start`, once per canvas call, as soon as its name is known.
fn canvas_preview(call: &mut PendingCall) -> Option<AgentEvent> {
    if call.preview_started || !is_canvas_tool(&call.name) {
        return None;
    }
    call.preview_started = true;
    Some(AgentEvent::CanvasStreamStart { id: call.id.clone(), tool_name: call.name.clone() })
}

/// `canvas_streaming` whenever the decoded `content` preview changes.
fn canvas_progress(call: &mut PendingCall) -> Option<AgentEvent> {
    if !call.preview_started {
        return None;
    }
    let content = extract_streaming_content(&call.arguments)?;
    if call.last_preview.as_deref() == Some(content.as_str()) {
        return None;
    }
    call.last_preview = Some(content.clone());
    Some(AgentEvent::CanvasStreaming { id: call.id.clone(), content })
}

fn canvas_result_event(tool_name: &str, output: &Value) -> Option<AgentEvent> {
    let id = output.get("id")?.as_str()?.to_string();
    let title = output.get("title").and_then(Value::as_str).unwrap_or_default().to_string();
    let content = output.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
    let version = output.get("version").and_then(Value::as_i64).unwrap_or(1) as i32;
    Some(if tool_name == CREATE_CANVAS {
        AgentEvent::CanvasCreated { id, title, content, version }
    } else {
        AgentEvent::CanvasUpdated { id, title, content, version }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::model::DeltaStream;
    use crate::config::SafetyConfig;
    use crate::db::memory::MemoryStore;
    use crate::errors::AppError;
    use crate::tools::{ToolDefinition, ToolHandler};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Script = Result<Vec<ModelDelta>, AppError>;

    #[derive(Default)]
    struct ScriptedModel {
        script: Mutex<VecDeque<Script>>,
        calls: AtomicUsize,
        prompts: Mutex<Vec<Option<String>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
        offered: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedModel {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()), ..Self::default() })
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn stream_chat(
            &self,
            messages: &[ChatMessage],
            tools: &[ToolDefinition],
            _cancel: &CancellationToken,
            extra_system_prompt: Option<&str>,
        ) -> Result<DeltaStream, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.offered.lock().unwrap().push(tools.iter().map(|t| t.name.clone()).collect());
            self.prompts.lock().unwrap().push(extra_system_prompt.map(str::to_string));
            self.seen.lock().unwrap().push(messages.to_vec());
            let next = self.script.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()));
            let deltas = next?;
            Ok(Box::pin(futures_util::stream::iter(deltas.into_iter().map(Ok))))
        }
    }

    struct EchoTool {
        cancel_on_run: Option<CancellationToken>,
    }

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("echo", "echo", json!({"type": "object"}))
        }

        async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<Value, AppError> {
            if let Some(token) = &self.cancel_on_run {
                token.cancel();
            }
            Ok(json!({ "echoed": args }))
        }
    }

    fn tokens(text: &str) -> ModelDelta {
        ModelDelta::Token(text.to_string())
    }

    fn call(id: &str, name: &str, args: &str) -> ModelDelta {
        ModelDelta::ToolCallDelta { index: 0, id: Some(id.into()), name: Some(name.into()), arguments: args.into() }
    }

    fn fragment(args: &str) -> ModelDelta {
        ModelDelta::ToolCallDelta { index: 0, id: None, name: None, arguments: args.into() }
    }

    fn agent(model: Arc<ScriptedModel>, registry: ToolRegistry, config: AgentConfig) -> AgentLoop {
        AgentLoop::new(model, Arc::new(registry), AgentConfig { working_dir: Some(PathBuf::from(".")), ..config })
    }

    fn echo_registry(cancel_on_run: Option<CancellationToken>) -> ToolRegistry {
        let mut registry = ToolRegistry::new(SafetyConfig::default());
        registry.register(Arc::new(EchoTool { cancel_on_run }));
        registry
    }

    async fn run(agent: &AgentLoop, cancel: &CancellationToken) -> (TurnOutcome, Vec<AgentEvent>) {
        let mut sink = EventSink::buffer();
        let outcome = agent.run("c1", vec![ChatMessage::user("hi")], &mut sink, cancel, None).await;
        (outcome, sink.into_events())
    }

    fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
        events.iter().map(AgentEvent::kind).collect()
    }

    #[tokio::test]
    async fn plain_answer_streams_tokens_then_done() {
        let model = ScriptedModel::new(vec![Ok(vec![tokens("Hel"), tokens("lo")])]);
        let agent = agent(model, echo_registry(None), AgentConfig::default());

        let (outcome, events) = run(&agent, &CancellationToken::new()).await;

        assert_eq!(kinds(&events), vec!["token", "token", "assistant_message", "done"]);
        assert_eq!(outcome.termination, Termination::Done);
        assert_eq!(outcome.final_text, "Hello");
        assert_eq!(outcome.rounds.len(), 1);
    }

    #[tokio::test]
    async fn tool_round_feeds_result_back() {
        let model = ScriptedModel::new(vec![
            Ok(vec![call("call_1", "echo", r#"{"x":"#), fragment("1}")]),
            Ok(vec![tokens("done")]),
        ]);
        let agent = agent(model.clone(), echo_registry(None), AgentConfig::default());

        let (outcome, events) = run(&agent, &CancellationToken::new()).await;

        assert_eq!(
            kinds(&events),
            vec!["tool_call_start", "tool_call_end", "token", "assistant_message", "done"]
        );
        match &events[1] {
            AgentEvent::ToolCallEnd { status, output, .. } => {
                assert_eq!(*status, ToolCallStatus::Success);
                assert_eq!(output, &json!({"echoed": {"x": 1}}));
            }
            other => panic!("unexpected {other:?}"),
        }
        let second = &model.seen.lock().unwrap()[1];
        assert_eq!(second.len(), 3);
        assert_eq!(second[1].tool_calls[0].id, "call_1");
        assert_eq!(second[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(outcome.tool_calls().count(), 1);
    }

    #[tokio::test]
    async fn run_agent_replays_child_events_before_tool_end() {
        let model = ScriptedModel::new(vec![
            Ok(vec![call("call_sub", "run_agent", r#"{"prompt": "count files"}"#)]),
            Ok(vec![tokens("child result")]),
            Ok(vec![tokens("final")]),
        ]);
        let agent = agent(model.clone(), echo_registry(None), AgentConfig::default());

        let (outcome, events) = run(&agent, &CancellationToken::new()).await;

        assert_eq!(
            kinds(&events),
            vec!["tool_call_start", "subagent_event", "tool_call_end", "token", "assistant_message", "done"]
        );
        match &events[1] {
            AgentEvent::SubagentEvent { tool_call_id, events } => {
                assert_eq!(tool_call_id, "call_sub");
                assert_eq!(kinds(events), vec!["token", "assistant_message", "done"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &events[2] {
            AgentEvent::ToolCallEnd { output, status, .. } => {
                assert_eq!(*status, ToolCallStatus::Success);
                assert_eq!(output["output"], "child result");
                assert!(output["elapsed_seconds"].is_number());
            }
            other => panic!("unexpected {other:?}"),
        }

        let prompts = model.prompts.lock().unwrap().clone();
        assert_eq!(prompts[0], None);
        assert!(prompts[1].as_deref().unwrap().contains("sub-agent"));
        assert_eq!(outcome.termination, Termination::Done);
    }

    #[tokio::test]
    async fn empty_registry_offers_no_tools_at_all() {
        let model = ScriptedModel::new(vec![
            Ok(vec![call("call_sub", "run_agent", r#"{"prompt": "count files"}"#)]),
            Ok(vec![tokens("fine")]),
        ]);
        let agent = agent(model.clone(), ToolRegistry::new(SafetyConfig::default()), AgentConfig::default());

        let (_, events) = run(&agent, &CancellationToken::new()).await;

        assert!(model.offered.lock().unwrap().iter().all(Vec::is_empty));
        assert_eq!(kinds(&events), vec!["tool_call_start", "tool_call_end", "token", "assistant_message", "done"]);
        match &events[1] {
            AgentEvent::ToolCallEnd { status, .. } => assert_eq!(*status, ToolCallStatus::Error),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_agent_is_offered_alongside_registered_tools() {
        let model = ScriptedModel::new(vec![Ok(vec![tokens("hi")])]);
        let agent = agent(model.clone(), echo_registry(None), AgentConfig::default());

        run(&agent, &CancellationToken::new()).await;

        assert_eq!(model.offered.lock().unwrap()[0], vec!["echo".to_string(), "run_agent".to_string()]);
    }

    #[tokio::test]
    async fn sub_agent_depth_is_bounded() {
        let model = ScriptedModel::new(vec![
            Ok(vec![call("c", "run_agent", r#"{"prompt": "go"}"#)]),
            Ok(vec![tokens("ok")]),
        ]);
        let config = AgentConfig { max_subagent_depth: 0, ..AgentConfig::default() };
        let agent = agent(model, echo_registry(None), config);

        let (_, events) = run(&agent, &CancellationToken::new()).await;
        match &events[1] {
            AgentEvent::ToolCallEnd { status, output, .. } => {
                assert_eq!(*status, ToolCallStatus::Error);
                assert!(output["error"].as_str().unwrap().contains("depth"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn round_limit_ends_with_error() {
        let looping: Vec<Script> = (0..5).map(|i| Ok(vec![call(&format!("c{i}"), "echo", "{}")])).collect();
        let model = ScriptedModel::new(looping);
        let config = AgentConfig { max_tool_iterations: 2, ..AgentConfig::default() };
        let agent = agent(model.clone(), echo_registry(None), config);

        let (outcome, events) = run(&agent, &CancellationToken::new()).await;

        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
        let last = events.last().unwrap();
        assert_eq!(last.kind(), "error");
        assert!(matches!(outcome.termination, Termination::Error(ref m) if m.contains("maximum tool iterations")));
    }

    #[tokio::test]
    async fn invalid_arguments_are_reported_and_loop_continues() {
        let model = ScriptedModel::new(vec![
            Ok(vec![call("c1", "echo", "{not json")]),
            Ok(vec![tokens("sorry")]),
        ]);
        let agent = agent(model, echo_registry(None), AgentConfig::default());

        let (outcome, events) = run(&agent, &CancellationToken::new()).await;
        match &events[1] {
            AgentEvent::ToolCallEnd { status, output, .. } => {
                assert_eq!(*status, ToolCallStatus::Error);
                assert!(output["error"].as_str().unwrap().contains("Invalid JSON"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(outcome.termination, Termination::Done);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let model = ScriptedModel::new(vec![Ok(vec![call("c1", "nope", "{}")]), Ok(vec![tokens("ok")])]);
        let agent = agent(model, echo_registry(None), AgentConfig::default());

        let (_, events) = run(&agent, &CancellationToken::new()).await;
        match &events[1] {
            AgentEvent::ToolCallEnd { status, output, .. } => {
                assert_eq!(*status, ToolCallStatus::Error);
                assert_eq!(output["error"], "Unknown tool: nope");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn upstream_failure_is_terminal_error() {
        let model = ScriptedModel::new(vec![Err(AppError::RateLimited)]);
        let agent = agent(model, echo_registry(None), AgentConfig::default());

        let (outcome, events) = run(&agent, &CancellationToken::new()).await;
        assert_eq!(kinds(&events), vec!["error"]);
        assert!(matches!(outcome.termination, Termination::Error(_)));
    }

    #[tokio::test]
    async fn cancelled_before_start_emits_nothing() {
        let model = ScriptedModel::new(vec![Ok(vec![tokens("never")])]);
        let agent = agent(model.clone(), echo_registry(None), AgentConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (outcome, events) = run(&agent, &cancel).await;
        assert!(events.is_empty());
        assert_eq!(outcome.termination, Termination::Cancelled);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_during_tool_keeps_result_but_stops() {
        let cancel = CancellationToken::new();
        let model = ScriptedModel::new(vec![
            Ok(vec![call("c1", "echo", "{}")]),
            Ok(vec![tokens("should not run")]),
        ]);
        let agent = agent(model.clone(), echo_registry(Some(cancel.clone())), AgentConfig::default());

        let (outcome, events) = run(&agent, &cancel).await;

        assert_eq!(kinds(&events), vec!["tool_call_start"]);
        assert_eq!(outcome.termination, Termination::Cancelled);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.rounds[0].tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn dropped_receiver_cancels_turn() {
        let model = ScriptedModel::new(vec![Ok(vec![tokens("a"), tokens("b")])]);
        let agent = agent(model, echo_registry(None), AgentConfig::default());
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        drop(rx);
        let cancel = CancellationToken::new();
        let mut sink = EventSink::Live(tx);

        let outcome = agent.run("c1", vec![ChatMessage::user("hi")], &mut sink, &cancel, None).await;
        assert_eq!(outcome.termination, Termination::Cancelled);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn canvas_arguments_stream_as_previews() {
        let store = Arc::new(MemoryStore::new());
        let registry = ToolRegistry::with_builtin_tools(SafetyConfig::default(), &AgentConfig::default(), store.clone());
        let model = ScriptedModel::new(vec![
            Ok(vec![
                call("cv", "create_canvas", r#"{"title": "Plan", "#),
                fragment(r#""content": "He"#),
                fragment("llo"),
                fragment(r#" world"}"#),
            ]),
            Ok(vec![tokens("created")]),
        ]);
        let agent = agent(model, registry, AgentConfig::default());

        let (_, events) = run(&agent, &CancellationToken::new()).await;

        let previews: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::CanvasStreaming { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(previews, vec!["He", "Hello", "Hello world"]);
        assert_eq!(kinds(&events).iter().filter(|k| **k == "canvas_stream_start").count(), 1);
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::CanvasCreated { title, content, version: 1, .. } if title == "Plan" && content == "Hello world"
        )));
    }
}
