//! Approval gating for destructive tool invocations.
//!
//! Everything here is pure: no filesystem or network access, so a verdict can be
//! computed for every call without blocking the agent loop.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::SafetyConfig;

/// Matches a command word at the start of the command, after whitespace, a shell
/// separator, an opening quote (`sh -c 'rm …'`) or a path prefix (`/bin/rm`), so
/// `myrmdir` or `--rm` never count as `rm`.
const CMD_START: &str = r#"(?:^|[\s;&|(`'"/])"#;

const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    (r"rm(?:\s|$)", "rm (file deletion)"),
    (r"rmdir(?:\s|$)", "rmdir (directory deletion)"),
    (r"git\s+push\b.*\s(?:--force|-f)\b", "git push --force (history rewrite)"),
    (r"git\s+reset\s+--hard\b", "git reset --hard (discards changes)"),
    (r"git\s+clean\b", "git clean (deletes untracked files)"),
    (r"git\s+checkout\s+(?:--\s+)?\.(?:\s|$)", "git checkout . (discards changes)"),
    (r"\bdrop\s+table\b", "DROP TABLE"),
    (r"\bdrop\s+database\b", "DROP DATABASE"),
    (r"\btruncate\s+\w", "TRUNCATE"),
    (
        r">\s*/dev/(?:sd|hd|vd|xvd|nvme|disk|mmcblk|mem|kmem|port)",
        "redirect into device file",
    ),
    (r"dd\b.*\bof=/dev/", "dd to device file"),
    (r"mkfs(?:\.\w+)?(?:\s|$)", "mkfs (filesystem format)"),
    (r"chmod\s+(?:-\w+\s+)*0?777\b", "chmod 777 (world-writable)"),
    (r"(?:kill|pkill|killall)\s+-(?:9|kill|sigkill)\b", "kill -9 (forced process kill)"),
];

/// Path component sequences that must never be written without approval.
const SENSITIVE_PATHS: &[&[&str]] = &[
    &[".env"],
    &[".ssh"],
    &[".aws"],
    &[".gnupg"],
    &[".config", "gcloud"],
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyVerdict {
    pub tool_name: String,
    pub needs_approval: bool,
    pub reason: String,
    pub details: Map<String, Value>,
}

impl SafetyVerdict {
    fn allow(tool_name: &str) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            needs_approval: false,
            reason: String::new(),
            details: Map::new(),
        }
    }

    fn require(tool_name: &str, reason: String, details: Value) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            needs_approval: true,
            reason,
            details: match details {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }
}

fn dangerous_patterns() -> &'static [(Regex, &'static str, &'static str)] {
    static COMPILED: OnceLock<Vec<(Regex, &'static str, &'static str)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        DANGEROUS_PATTERNS
            .iter()
            .map(|(pattern, description)| {
                let anchored = if pattern.starts_with(r"\b") || pattern.starts_with('>') {
                    pattern.to_string()
                } else {
                    format!("{CMD_START}{pattern}")
                };
                let re = RegexBuilder::new(&anchored)
                    .case_insensitive(true)
                    .build()
                    .expect("built-in safety pattern must compile");
                (re, *pattern, *description)
            })
            .collect()
    })
}

/// Decides whether `tool_name` invoked with `arguments` needs human approval.
pub fn evaluate(
    tool_name: &str,
    arguments: &Value,
    working_dir: &Path,
    config: &SafetyConfig,
) -> SafetyVerdict {
    if !config.enabled {
        return SafetyVerdict::allow(tool_name);
    }
    let str_arg = |key: &str| arguments.get(key).and_then(Value::as_str).unwrap_or("");
    match tool_name {
        "bash" if config.bash.enabled => {
            check_bash_command(str_arg("command"), &config.custom_patterns)
        }
        "write_file" if config.write_file.enabled => {
            check_write_path(str_arg("path"), working_dir, &config.sensitive_paths)
        }
        _ => SafetyVerdict::allow(tool_name),
    }
}

pub fn check_bash_command(command: &str, custom_patterns: &[String]) -> SafetyVerdict {
    let normalized = normalize_whitespace(command);
    if normalized.is_empty() {
        return SafetyVerdict::allow("bash");
    }

    for (re, pattern, description) in dangerous_patterns() {
        if re.is_match(&normalized) {
            return SafetyVerdict::require(
                "bash",
                format!("Destructive command detected: {description}"),
                json!({ "command": normalized, "matched_pattern": pattern }),
            );
        }
    }

    for pattern in custom_patterns {
        if custom_pattern_matches(pattern, &normalized) {
            return SafetyVerdict::require(
                "bash",
                format!("Command matches custom safety pattern: {pattern}"),
                json!({ "command": normalized, "matched_pattern": pattern }),
            );
        }
    }

    SafetyVerdict::allow("bash")
}

fn normalize_whitespace(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn custom_pattern_matches(pattern: &str, command: &str) -> bool {
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => re.is_match(command),
        // Not a valid regex: treat it as a literal.
        Err(_) => command.to_lowercase().contains(&pattern.to_lowercase()),
    }
}

pub fn check_write_path(path: &str, working_dir: &Path, sensitive_paths: &[String]) -> SafetyVerdict {
    if path.trim().is_empty() {
        return SafetyVerdict::allow("write_file");
    }

    let home = home_dir();
    let target = resolve_path(path.trim(), working_dir, home.as_deref());
    let components = normal_components(&target);

    let builtin_hit = SENSITIVE_PATHS
        .iter()
        .find(|seq| contains_sequence(&components, seq))
        .map(|seq| seq.join("/"));

    let custom_hit = || {
        sensitive_paths
            .iter()
            .find(|entry| custom_path_matches(entry, &target, &components, home.as_deref()))
            .cloned()
    };

    match builtin_hit.or_else(custom_hit) {
        Some(matched) => SafetyVerdict::require(
            "write_file",
            format!("Write to sensitive path: {matched}"),
            json!({ "path": target.display().to_string(), "matched_path": matched }),
        ),
        None => SafetyVerdict::allow("write_file"),
    }
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}

/// Joins `path` onto `working_dir` (expanding `~/`) and folds `.`/`..` lexically.
pub(crate) fn resolve_path(path: &str, working_dir: &Path, home: Option<&Path>) -> PathBuf {
    let joined = match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => {
            let p = Path::new(path);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                working_dir.join(p)
            }
        }
    };
    normalize_path(&joined)
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn normal_components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

fn component_matches(component: &str, pattern: &str) -> bool {
    component == pattern || (pattern == ".env" && component.starts_with(".env."))
}

fn contains_sequence<S: AsRef<str>>(components: &[String], seq: &[S]) -> bool {
    if seq.is_empty() || seq.len() > components.len() {
        return false;
    }
    components.windows(seq.len()).any(|window| {
        window
            .iter()
            .zip(seq)
            .all(|(c, p)| component_matches(c, p.as_ref()))
    })
}

fn custom_path_matches(entry: &str, target: &Path, components: &[String], home: Option<&Path>) -> bool {
    let entry = entry.trim();
    if entry.is_empty() {
        return false;
    }
    let relative = match entry.strip_prefix("~/") {
        Some(rest) => {
            if let Some(home) = home {
                if target.starts_with(normalize_path(&home.join(rest))) {
                    return true;
                }
            }
            rest
        }
        None if Path::new(entry).is_absolute() => {
            return target.starts_with(normalize_path(Path::new(entry)));
        }
        None => entry,
    };
    let seq = normal_components(Path::new(relative));
    contains_sequence(components, &seq)
}
