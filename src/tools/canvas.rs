use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{required_str, ToolContext, ToolDefinition, ToolHandler};
use crate::db::CanvasStore;
use crate::errors::AppError;
use crate::models::Canvas;

pub const CREATE_CANVAS: &str = "create_canvas";
pub const UPDATE_CANVAS: &str = "update_canvas";

/// Tools whose `content` argument is previewed while it streams.
pub fn is_canvas_tool(name: &str) -> bool {
    name == CREATE_CANVAS || name == UPDATE_CANVAS
}

fn canvas_output(canvas: &Canvas) -> Value {
    json!({
        "id": canvas.id,
        "title": canvas.title,
        "content": canvas.content,
        "version": canvas.version,
    })
}

pub struct CreateCanvasTool {
    store: Arc<dyn CanvasStore>,
}

impl CreateCanvasTool {
    pub fn new(store: Arc<dyn CanvasStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolHandler for CreateCanvasTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            CREATE_CANVAS,
            "Create the conversation's canvas: a markdown document shown next to the chat.",
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "content": { "type": "string", "description": "Markdown body" }
                },
                "required": ["title", "content"]
            }),
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value, AppError> {
        let title = required_str(args, CREATE_CANVAS, "title")?;
        let content = required_str(args, CREATE_CANVAS, "content")?;
        let canvas = self
            .store
            .create_canvas(&ctx.conversation_id, title, content)
            .await
            .map_err(|e| AppError::tool(CREATE_CANVAS, e.to_string()))?;
        info!(conversation_id = %ctx.conversation_id, canvas_id = %canvas.id, "Canvas created");
        Ok(canvas_output(&canvas))
    }
}

pub struct UpdateCanvasTool {
    store: Arc<dyn CanvasStore>,
}

impl UpdateCanvasTool {
    pub fn new(store: Arc<dyn CanvasStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolHandler for UpdateCanvasTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            UPDATE_CANVAS,
            "Replace the canvas content (and optionally its title).",
            json!({
                "type": "object",
                "properties": {
                    "content": { "type": "string", "description": "Full new markdown body" },
                    "title": { "type": "string" }
                },
                "required": ["content"]
            }),
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value, AppError> {
        let content = required_str(args, UPDATE_CANVAS, "content")?;
        let title = args.get("title").and_then(Value::as_str);
        let canvas = self
            .store
            .update_canvas(&ctx.conversation_id, content, title)
            .await
            .map_err(|e| AppError::tool(UPDATE_CANVAS, e.to_string()))?;
        info!(conversation_id = %ctx.conversation_id, version = canvas.version, "Canvas updated");
        Ok(canvas_output(&canvas))
    }
}
