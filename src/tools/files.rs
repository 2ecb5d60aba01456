use async_trait::async_trait;
use serde_json::{json, Value};

use super::safety::resolve_path;
use super::{required_str, truncate_output, ToolContext, ToolDefinition, ToolHandler};
use crate::errors::AppError;

fn target_path(path: &str, ctx: &ToolContext) -> std::path::PathBuf {
    let home = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf());
    resolve_path(path, &ctx.working_dir, home.as_deref())
}

pub struct ReadFileTool {
    max_chars: usize,
}

impl ReadFileTool {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait]
impl ToolHandler for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "read_file",
            "Read a text file. Relative paths resolve against the working directory.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File to read" }
                },
                "required": ["path"]
            }),
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value, AppError> {
        let path = target_path(required_str(args, "read_file", "path")?, ctx);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AppError::tool("read_file", format!("cannot read {}: {e}", path.display())))?;
        Ok(json!({
            "path": path.display().to_string(),
            "content": truncate_output(&content, self.max_chars),
        }))
    }
}

pub struct WriteFileTool;

#[async_trait]
impl ToolHandler for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "write_file",
            "Write text to a file, creating parent directories and replacing existing content.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File to write" },
                    "content": { "type": "string", "description": "Full new content" }
                },
                "required": ["path", "content"]
            }),
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value, AppError> {
        let path = target_path(required_str(args, "write_file", "path")?, ctx);
        let content = required_str(args, "write_file", "content")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::tool("write_file", format!("cannot create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| AppError::tool("write_file", format!("cannot write {}: {e}", path.display())))?;

        Ok(json!({
            "path": path.display().to_string(),
            "bytes_written": content.len(),
        }))
    }
}
