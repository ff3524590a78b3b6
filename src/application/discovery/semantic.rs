use super::rank;
use crate::application::catalog::{ToolCatalog, index_text};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding backend failed: {message}")]
    Backend { message: String },
    #[error("embedding backend returned an empty vector")]
    EmptyVector,
}

/// Pre-trained embedding function, consumed as a black box.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

struct SemanticEntry {
    id: String,
    vector: Vec<f32>,
}

/// Nearest-neighbour index over descriptor embeddings. Vectors are computed
/// once at build time and stored normalized, so similarity is a dot product.
pub struct SemanticIndex {
    entries: Vec<SemanticEntry>,
    embedder: Arc<dyn Embedder>,
    floor: f32,
}

impl SemanticIndex {
    /// Embed every descriptor once. A descriptor whose embedding fails is
    /// reported and skipped; it stays lexically searchable.
    pub async fn build(catalog: &ToolCatalog, embedder: Arc<dyn Embedder>, floor: f32) -> Self {
        let mut entries = Vec::with_capacity(catalog.len());
        for tool in catalog.iter() {
            let text = index_text(tool);
            match embedder.embed(&text).await {
                Ok(vector) => match normalize(vector) {
                    Some(vector) => entries.push(SemanticEntry {
                        id: tool.id.clone(),
                        vector,
                    }),
                    None => {
                        warn!(tool = %tool.id, "Embedding was zero-length; descriptor skipped");
                    }
                },
                Err(err) => {
                    warn!(tool = %tool.id, %err, "Failed to embed descriptor; it will not be semantically searchable");
                }
            }
        }
        debug!(
            embedded = entries.len(),
            total = catalog.len(),
            "Semantic index built"
        );
        Self {
            entries,
            embedder,
            floor,
        }
    }

    /// Top `k` by cosine similarity, ties broken by id ascending. Entries
    /// below the similarity floor are excluded even when `k` is not filled.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<(String, f32)>, EmbedError> {
        if text.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(text).await?;
        let query = normalize(query).ok_or(EmbedError::EmptyVector)?;

        let scored = self
            .entries
            .iter()
            .filter_map(|entry| {
                let similarity = dot(&entry.vector, &query)?;
                (similarity >= self.floor).then(|| (entry.id.clone(), similarity))
            })
            .collect();
        Ok(rank(scored, k))
    }
}

fn normalize(mut vector: Vec<f32>) -> Option<Vec<f32>> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if !norm.is_normal() {
        return None;
    }
    for value in &mut vector {
        *value /= norm;
    }
    Some(vector)
}

fn dot(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.iter().zip(b).map(|(x, y)| x * y).sum())
}
