use std::path::Path;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::safety::resolve_path;
use super::{required_str, ToolContext, ToolDefinition, ToolHandler};
use crate::errors::AppError;

const MAX_MATCHES: usize = 200;
const MAX_FILE_BYTES: u64 = 1024 * 1024;
const MAX_LINE_CHARS: usize = 300;
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "__pycache__"];

/// Regex search across text files under the working directory.
pub struct GrepTool;

#[async_trait]
impl ToolHandler for GrepTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "grep",
            "Search files under the working directory for a regular expression.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Regular expression" },
                    "path": { "type": "string", "description": "Directory or file to search (default: working directory)" },
                    "case_insensitive": { "type": "boolean" }
                },
                "required": ["pattern"]
            }),
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value, AppError> {
        let pattern = required_str(args, "grep", "pattern")?;
        let case_insensitive = args.get("case_insensitive").and_then(Value::as_bool).unwrap_or(false);
        let re = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| AppError::tool("grep", format!("invalid pattern: {e}")))?;

        let root = match args.get("path").and_then(Value::as_str) {
            Some(p) if !p.trim().is_empty() => resolve_path(p, &ctx.working_dir, None),
            _ => ctx.working_dir.clone(),
        };
        let base = ctx.working_dir.clone();

        tokio::task::spawn_blocking(move || search(&re, &root, &base))
            .await
            .map_err(|e| AppError::tool("grep", format!("search task failed: {e}")))
    }
}

fn search(re: &regex::Regex, root: &Path, base: &Path) -> Value {
    let mut matches = Vec::new();
    let mut truncated = false;

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        !(entry.file_type().is_dir()
            && entry.depth() > 0
            && SKIPPED_DIRS.contains(&entry.file_name().to_string_lossy().as_ref()))
    });

    'files: for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        // Binary or non-UTF-8 files are skipped.
        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let shown = entry.path().strip_prefix(base).unwrap_or(entry.path());
        for (idx, line) in text.lines().enumerate() {
            if re.is_match(line) {
                if matches.len() == MAX_MATCHES {
                    truncated = true;
                    break 'files;
                }
                matches.push(json!({
                    "path": shown.display().to_string(),
                    "line": idx + 1,
                    "text": line.chars().take(MAX_LINE_CHARS).collect::<String>(),
                }));
            }
        }
    }

    json!({ "matches": matches, "truncated": truncated })
}
