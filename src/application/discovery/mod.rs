mod lexical;
mod semantic;

pub use lexical::LexicalIndex;
pub use semantic::{EmbedError, Embedder, SemanticIndex};

use crate::types::{DiscoveryResult, SearchStrategy};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Default and ceiling for the result-count parameter of a search.
pub const DEFAULT_RESULT_COUNT: usize = 5;
pub const MAX_RESULT_COUNT: usize = 20;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The strategy backend failed; callers degrade to lexical search
    /// instead of aborting the conversation.
    #[error("discovery strategy '{strategy}' unavailable: {source}")]
    Unavailable {
        strategy: &'static str,
        #[source]
        source: EmbedError,
    },
}

/// Score descending, ties broken by id ascending, capped at `k`.
pub(crate) fn rank(mut scored: Vec<(String, f32)>, k: usize) -> Vec<(String, f32)> {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(k);
    scored
}

/// Single search front door over the configured indices. A pure query: it
/// never touches catalog or loading state.
pub struct DiscoveryRouter {
    lexical: LexicalIndex,
    semantic: Option<SemanticIndex>,
}

impl DiscoveryRouter {
    pub fn new(lexical: LexicalIndex, semantic: Option<SemanticIndex>) -> Self {
        Self { lexical, semantic }
    }

    pub async fn search(
        &self,
        query: &str,
        strategy: SearchStrategy,
        k: usize,
    ) -> Result<Vec<DiscoveryResult>, DiscoveryError> {
        let k = if k == 0 {
            DEFAULT_RESULT_COUNT
        } else {
            k.min(MAX_RESULT_COUNT)
        };

        let hits = match strategy {
            SearchStrategy::LexicalPattern => self.lexical.query_pattern(query, k),
            SearchStrategy::LexicalRanked => self.lexical.query_ranked(query, k),
            SearchStrategy::Semantic => match &self.semantic {
                Some(index) => {
                    index
                        .query(query, k)
                        .await
                        .map_err(|source| DiscoveryError::Unavailable {
                            strategy: SearchStrategy::Semantic.as_str(),
                            source,
                        })?
                }
                None => {
                    return Err(DiscoveryError::Unavailable {
                        strategy: SearchStrategy::Semantic.as_str(),
                        source: EmbedError::Backend {
                            message: "no semantic index configured".into(),
                        },
                    });
                }
            },
        };

        let mut seen = HashSet::new();
        let results: Vec<DiscoveryResult> = hits
            .into_iter()
            .filter(|(tool_id, _)| seen.insert(tool_id.clone()))
            .map(|(tool_id, score)| DiscoveryResult {
                tool_id,
                score,
                strategy,
            })
            .collect();
        debug!(
            query,
            strategy = strategy.as_str(),
            matches = results.len(),
            "Discovery search completed"
        );
        Ok(results)
    }
}
