//! Application configuration (layered: TOML file < environment).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::AppError;

const CONFIG_ENV_VAR: &str = "AI_CHAT_CONFIG";
const MIN_APPROVAL_TIMEOUT: u64 = 10;
const MAX_APPROVAL_TIMEOUT: u64 = 600;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub ai: AiConfig,
    pub embeddings: EmbeddingsConfig,
    pub safety: SafetyConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/anteroom".to_string(),
            max_connections: 10,
        }
    }
}

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub base_url: String,
    pub api_key: String,
    /// Shell command printing a fresh API key; run on start-up and after a 401.
    pub api_key_command: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub request_timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: String::new(),
            api_key_command: None,
            model: "gpt-4o-mini".to_string(),
            system_prompt: "You are a helpful AI assistant. Be concise, accurate, and friendly. \
                            If you don't know something, say so."
                .to_string(),
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub enabled: bool,
    /// Falls back to `ai.base_url` when unset.
    pub base_url: Option<String>,
    /// Falls back to `ai.api_key` when unset.
    pub api_key: Option<String>,
    pub api_key_command: Option<String>,
    pub model: String,
    pub dimensions: u32,
    pub batch_size: usize,
    pub poll_interval_secs: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            api_key: None,
            api_key_command: None,
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            batch_size: 50,
            poll_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolSafetyConfig {
    pub enabled: bool,
}

impl Default for ToolSafetyConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub enabled: bool,
    /// Seconds to wait for a human decision; clamped to 10..=600.
    pub approval_timeout: u64,
    pub bash: ToolSafetyConfig,
    pub write_file: ToolSafetyConfig,
    /// Extra bash patterns: regular expressions, or literal substrings when they fail to compile.
    pub custom_patterns: Vec<String>,
    /// Extra sensitive paths; `~/` prefixes are home-relative.
    pub sensitive_paths: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            approval_timeout: 120,
            bash: ToolSafetyConfig::default(),
            write_file: ToolSafetyConfig::default(),
            custom_patterns: Vec::new(),
            sensitive_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_tool_iterations: usize,
    pub max_subagent_depth: usize,
    pub tool_output_max_chars: usize,
    pub bash_timeout_secs: u64,
    /// Root for file and shell tools; defaults to the process working directory.
    pub working_dir: Option<PathBuf>,
    /// A stream whose client is gone is reaped once it is older than this.
    pub stream_stale_after_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: 50,
            max_subagent_depth: 3,
            tool_output_max_chars: 20_000,
            bash_timeout_secs: 120,
            working_dir: None,
            stream_stale_after_secs: 120,
        }
    }
}

impl AgentConfig {
    pub fn resolved_working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

impl AppConfig {
    /// Loads `.env`, the TOML file (if any) and environment overrides.
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        let path = std::env::var(CONFIG_ENV_VAR)
            .ok()
            .map(PathBuf::from)
            .or_else(default_config_path);

        let mut config = match path {
            Some(p) if p.exists() => Self::from_file(&p)?,
            _ => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.normalize();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read {}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, AppError> {
        let mut config: AppConfig = toml::from_str(raw)
            .map_err(|e| AppError::Config(format!("Invalid config: {e}")))?;
        config.normalize();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(url) = lookup("AI_CHAT_BASE_URL") {
            self.ai.base_url = url;
        }
        if let Some(key) = lookup("AI_CHAT_API_KEY") {
            self.ai.api_key = key;
        }
        if let Some(model) = lookup("AI_CHAT_MODEL") {
            self.ai.model = model;
        }
        if let Some(flag) = lookup("AI_CHAT_SAFETY_ENABLED") {
            match parse_bool(&flag) {
                Some(v) => self.safety.enabled = v,
                None => warn!(value = %flag, "Ignoring invalid AI_CHAT_SAFETY_ENABLED"),
            }
        }
        if let Some(flag) = lookup("AI_CHAT_EMBEDDINGS_ENABLED") {
            match parse_bool(&flag) {
                Some(v) => self.embeddings.enabled = v,
                None => warn!(value = %flag, "Ignoring invalid AI_CHAT_EMBEDDINGS_ENABLED"),
            }
        }
    }

    fn normalize(&mut self) {
        self.safety.approval_timeout = self
            .safety
            .approval_timeout
            .clamp(MIN_APPROVAL_TIMEOUT, MAX_APPROVAL_TIMEOUT);
        self.embeddings.batch_size = self.embeddings.batch_size.max(1);
        self.embeddings.poll_interval_secs = self.embeddings.poll_interval_secs.max(1);
    }

    pub fn embeddings_base_url(&self) -> &str {
        self.embeddings.base_url.as_deref().unwrap_or(&self.ai.base_url)
    }

    pub fn embeddings_api_key(&self) -> &str {
        self.embeddings.api_key.as_deref().unwrap_or(&self.ai.api_key)
    }

    pub fn embeddings_api_key_command(&self) -> Option<&str> {
        self.embeddings
            .api_key_command
            .as_deref()
            .or(self.ai.api_key_command.as_deref())
    }
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "anteroom")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
