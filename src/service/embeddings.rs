//! Client for OpenAI-compatible `/embeddings` endpoints.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::AppError;
use crate::http::{bearer_headers, build_client, ApiKeyProvider};

const MAX_INPUT_TOKENS: usize = 8191;
/// Rough chars-per-token bound used to keep inputs under the model limit.
const MAX_INPUT_CHARS: usize = MAX_INPUT_TOKENS * 4;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;

    /// `None` for empty or whitespace-only text.
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, AppError>;

    /// One slot per input, in input order; `None` where no vector was produced.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, AppError>;
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct EmbeddingService {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: u32,
    api_key: ApiKeyProvider,
}

impl EmbeddingService {
    pub fn new(
        base_url: &str,
        model: &str,
        dimensions: u32,
        api_key: ApiKeyProvider,
        timeout_secs: u64,
    ) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(timeout_secs)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimensions,
            api_key,
        })
    }

    /// `None` when embeddings are disabled or no credentials are configured.
    pub async fn from_config(config: &AppConfig) -> Result<Option<Self>, AppError> {
        if !config.embeddings.enabled {
            info!("Embeddings disabled by configuration");
            return Ok(None);
        }
        let key = config.embeddings_api_key();
        let command = config.embeddings_api_key_command();
        if key.is_empty() && command.is_none() {
            warn!("Embeddings enabled but no API key configured, disabling");
            return Ok(None);
        }

        let provider = ApiKeyProvider::new(key, command);
        if provider.can_refresh() {
            provider.refresh().await?;
        }
        let service = Self::new(
            config.embeddings_base_url(),
            &config.embeddings.model,
            config.embeddings.dimensions,
            provider,
            config.ai.request_timeout_secs,
        )?;
        info!(model = %service.model, dimensions = service.dimensions, "Embedding service ready");
        Ok(Some(service))
    }

    async fn post(&self, inputs: &[&str]) -> Result<reqwest::Response, AppError> {
        let body = json!({
            "model": self.model,
            "input": inputs,
            "dimensions": self.dimensions,
        });
        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .headers(bearer_headers(&self.api_key.current()))
            .json(&body)
            .send()
            .await?;
        Ok(resp)
    }

    async fn request(&self, inputs: &[&str]) -> Result<Vec<EmbeddingData>, AppError> {
        let mut resp = self.post(inputs).await?;
        if resp.status().as_u16() == 401 && self.api_key.can_refresh() {
            warn!(model = %self.model, "Embedding request unauthorized, refreshing API key");
            self.api_key.refresh().await?;
            resp = self.post(inputs).await?;
        }

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::from_status(status, &text, &self.model));
        }
        let parsed: EmbeddingResponse = resp.json().await?;
        Ok(parsed.data)
    }
}

#[async_trait]
impl Embedder for EmbeddingService {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, AppError> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        Ok(batch.pop().flatten())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, AppError> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let slots: Vec<usize> = (0..texts.len()).filter(|&i| !texts[i].trim().is_empty()).collect();
        if slots.is_empty() {
            return Ok(results);
        }

        let inputs: Vec<&str> = slots.iter().map(|&i| truncate_input(&texts[i])).collect();
        let data = self.request(&inputs).await?;
        for item in data {
            match slots.get(item.index) {
                Some(&slot) => results[slot] = Some(item.embedding),
                None => warn!(index = item.index, "Embedding response index out of range"),
            }
        }
        debug!(requested = inputs.len(), "Embedding batch complete");
        Ok(results)
    }
}

fn truncate_input(text: &str) -> &str {
    match text.char_indices().nth(MAX_INPUT_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
