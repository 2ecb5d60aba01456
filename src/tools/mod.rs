//! Tool registry: capability handlers keyed by name, gated by the safety evaluator.

pub mod bash;
pub mod canvas;
pub mod files;
pub mod grep;
pub mod safety;
pub mod subagent;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, SafetyConfig};
use crate::db::CanvasStore;
use crate::errors::AppError;
use crate::models::ToolCallStatus;

pub use safety::SafetyVerdict;

/// Function-calling schema for one tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }

    /// `{"type": "function", "function": {...}}` as sent to the model.
    pub fn to_function_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Per-call context handed to handlers.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    pub working_dir: PathBuf,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value, AppError>;
}

/// Asks a human whether a gated call may proceed.
pub type ConfirmCallback = Arc<dyn Fn(SafetyVerdict) -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub status: ToolCallStatus,
    pub output: Value,
}

#[derive(Clone)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    safety: SafetyConfig,
    default_confirm: Option<ConfirmCallback>,
}

impl ToolRegistry {
    pub fn new(safety: SafetyConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            safety,
            default_confirm: None,
        }
    }

    /// Registry with every built-in handler.
    pub fn with_builtin_tools(safety: SafetyConfig, agent: &AgentConfig, canvases: Arc<dyn CanvasStore>) -> Self {
        let mut registry = Self::new(safety);
        registry.register(Arc::new(bash::BashTool::new(agent.bash_timeout_secs, agent.tool_output_max_chars)));
        registry.register(Arc::new(files::ReadFileTool::new(agent.tool_output_max_chars)));
        registry.register(Arc::new(files::WriteFileTool));
        registry.register(Arc::new(grep::GrepTool));
        registry.register(Arc::new(canvas::CreateCanvasTool::new(canvases.clone())));
        registry.register(Arc::new(canvas::UpdateCanvasTool::new(canvases)));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.definition().name;
        debug!(tool = %name, "Registered tool");
        self.handlers.insert(name, handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Used when a call supplies no callback of its own.
    pub fn with_default_confirm(mut self, confirm: ConfirmCallback) -> Self {
        self.default_confirm = Some(confirm);
        self
    }

    /// Definitions sorted by name so the model sees a stable tool list.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.handlers.values().map(|h| h.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn call(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolContext,
        confirm: Option<&ConfirmCallback>,
    ) -> Result<ToolResult, AppError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| AppError::ToolNotFound { name: name.to_string() })?;

        let verdict = safety::evaluate(name, args, &ctx.working_dir, &self.safety);
        if verdict.needs_approval {
            let Some(confirm) = confirm.or(self.default_confirm.as_ref()) else {
                warn!(tool = %name, reason = %verdict.reason, "Blocked: no approval channel");
                return Ok(ToolResult {
                    status: ToolCallStatus::Denied,
                    output: json!({
                        "error": "Operation blocked: no approval channel available",
                        "safety_blocked": true,
                    }),
                });
            };

            info!(tool = %name, reason = %verdict.reason, "Requesting approval");
            if !confirm(verdict).await {
                info!(tool = %name, "Denied by user");
                return Ok(ToolResult {
                    status: ToolCallStatus::Denied,
                    output: json!({ "error": "Operation denied by user", "exit_code": -1 }),
                });
            }
        }

        let output = handler.execute(args, ctx).await?;
        Ok(ToolResult { status: ToolCallStatus::Success, output })
    }
}

/// Reads a required string argument.
pub(crate) fn required_str<'a>(args: &'a Value, tool: &str, key: &str) -> Result<&'a str, AppError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::tool(tool, format!("missing required argument '{key}'")))
}

/// Cuts `text` to at most `max_chars` characters, marking the cut.
pub(crate) fn truncate_output(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!(
            "{}\n... [truncated, {} more characters]",
            &text[..idx],
            text[idx..].chars().count()
        ),
        None => text.to_string(),
    }
}
