use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use super::embeddings::Embedder;
use crate::db::EmbeddingStore;
use crate::errors::AppError;
use crate::models::SearchHit;

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 50;

/// Semantic search over stored message embeddings.
#[derive(Clone)]
pub struct SearchService {
    store: Arc<dyn EmbeddingStore>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl SearchService {
    pub fn new(store: Arc<dyn EmbeddingStore>, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self { store, embedder }
    }

    pub fn is_enabled(&self) -> bool {
        self.embedder.is_some()
    }

    pub async fn search(&self, query: &str, limit: Option<usize>) -> Result<Vec<SearchHit>, AppError> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| AppError::Unavailable("semantic search requires embeddings".to_string()))?;
        if query.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "q".to_string() });
        }
        let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

        let Some(query_vec) = embedder.embed(query).await? else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<SearchHit> = self
            .store
            .all_embeddings()
            .await?
            .into_iter()
            .map(|e| SearchHit {
                score: cosine_similarity(&query_vec, &e.embedding),
                message_id: e.message_id,
                conversation_id: e.conversation_id,
                content: e.content,
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(limit);
        debug!(results = hits.len(), "Semantic search complete");
        Ok(hits)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
