use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{required_str, truncate_output, ToolContext, ToolDefinition, ToolHandler};
use crate::errors::AppError;

pub const NAME: &str = "bash";

/// Runs a shell command in the working directory.
pub struct BashTool {
    timeout: Duration,
    max_output_chars: usize,
}

impl BashTool {
    pub fn new(timeout_secs: u64, max_output_chars: usize) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            max_output_chars,
        }
    }
}

#[async_trait]
impl ToolHandler for BashTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            NAME,
            "Execute a shell command in the working directory and return stdout, stderr and the exit code.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "The command to run with sh -c" }
                },
                "required": ["command"]
            }),
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value, AppError> {
        let command = required_str(args, NAME, "command")?;
        debug!(command = %command, cwd = %ctx.working_dir.display(), "Running bash tool");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(AppError::tool(NAME, format!("failed to spawn shell: {e}"))),
            Err(_) => {
                warn!(command = %command, "Bash command timed out");
                return Err(AppError::tool(
                    NAME,
                    format!("command timed out after {}s", self.timeout.as_secs()),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(json!({
            "stdout": truncate_output(&stdout, self.max_output_chars),
            "stderr": truncate_output(&stderr, self.max_output_chars),
            "exit_code": output.status.code().unwrap_or(-1),
        }))
    }
}
