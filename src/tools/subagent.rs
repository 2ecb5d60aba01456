//! `run_agent`: delegates a task to a nested agent loop. The loop executes it
//! directly; the registry only publishes the schema.

use serde_json::{json, Value};

use super::{required_str, ToolDefinition};
use crate::errors::AppError;

pub const NAME: &str = "run_agent";

/// Appended to the system prompt of every nested loop.
pub const SUBAGENT_PROMPT: &str = "You are a sub-agent working on a single delegated task. \
    Complete it using the available tools, then reply with a concise report of what you found or did. \
    Do not ask the user questions; nobody is watching this conversation live.";

pub fn definition() -> ToolDefinition {
    ToolDefinition::new(
        NAME,
        "Delegate a self-contained task to a sub-agent with the same tools. \
         Returns the sub-agent's final answer.",
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string", "description": "Complete instructions for the sub-agent" }
            },
            "required": ["prompt"]
        }),
    )
}

pub fn prompt_from_args(args: &Value) -> Result<String, AppError> {
    let prompt = required_str(args, NAME, "prompt")?;
    if prompt.trim().is_empty() {
        return Err(AppError::tool(NAME, "prompt cannot be empty"));
    }
    Ok(prompt.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_agent_prompt_marks_nesting() {
        assert!(SUBAGENT_PROMPT.contains("sub-agent"));
    }

    #[test]
    fn prompt_is_required() {
        assert_eq!(prompt_from_args(&json!({"prompt": "count files"})).unwrap(), "count files");
        assert!(prompt_from_args(&json!({})).is_err());
        assert!(prompt_from_args(&json!({"prompt": "  "})).is_err());
    }
}
