//! Outbound HTTP helpers shared by the chat and embeddings clients.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tokio::process::Command;
use tracing::{info, warn};

use crate::errors::AppError;

pub fn build_client(timeout_secs: u64) -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .pool_max_idle_per_host(10)
        .build()
        .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {e}")))
}

pub fn bearer_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if !api_key.is_empty() {
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
            headers.insert(AUTHORIZATION, val);
        }
    }
    headers
}

/// Payload of an SSE `data:` line; `None` for other lines and for `[DONE]`.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return None;
    }
    Some(data)
}

/// API key that can be re-read from a shell command after it expires.
#[derive(Clone)]
pub struct ApiKeyProvider {
    key: Arc<RwLock<String>>,
    command: Option<String>,
}

impl ApiKeyProvider {
    pub fn new(initial: &str, command: Option<&str>) -> Self {
        Self {
            key: Arc::new(RwLock::new(initial.to_string())),
            command: command.map(str::to_string).filter(|c| !c.trim().is_empty()),
        }
    }

    pub fn current(&self) -> String {
        self.key.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn can_refresh(&self) -> bool {
        self.command.is_some()
    }

    /// Runs the key command and stores its trimmed stdout as the new key.
    pub async fn refresh(&self) -> Result<String, AppError> {
        let Some(command) = &self.command else {
            return Err(AppError::Authentication { message: "no api_key_command configured".to_string() });
        };
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| AppError::Authentication { message: format!("api_key_command failed to start: {e}") })?;
        if !output.status.success() {
            warn!(status = ?output.status.code(), "api_key_command exited unsuccessfully");
            return Err(AppError::Authentication {
                message: format!("api_key_command exited with {:?}", output.status.code()),
            });
        }
        let fresh = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if fresh.is_empty() {
            return Err(AppError::Authentication { message: "api_key_command printed nothing".to_string() });
        }
        *self.key.write().unwrap_or_else(|p| p.into_inner()) = fresh.clone();
        info!("API key refreshed from api_key_command");
        Ok(fresh)
    }
}
