use super::rank;
use crate::application::catalog::{ToolCatalog, index_text};
use regex::RegexBuilder;
use std::collections::{HashMap, HashSet};
use tracing::debug;

// Okapi BM25 constants: term-frequency saturation and length normalization.
const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

struct IndexedDoc {
    id: String,
    text: String,
    len: usize,
}

/// Term index over descriptor text. Supports a regex/substring mode and a
/// BM25-ranked relevance mode over the same postings.
pub struct LexicalIndex {
    docs: Vec<IndexedDoc>,
    postings: HashMap<String, Vec<(usize, u32)>>,
    avg_len: f32,
}

/// Case-insensitive split on non-alphanumeric boundaries.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

impl LexicalIndex {
    pub fn build(catalog: &ToolCatalog) -> Self {
        let mut docs = Vec::with_capacity(catalog.len());
        let mut postings: HashMap<String, Vec<(usize, u32)>> = HashMap::new();
        let mut total_len = 0usize;

        for tool in catalog.iter() {
            let text = index_text(tool).to_lowercase();
            let tokens = tokenize(&text);
            let doc_index = docs.len();
            total_len += tokens.len();

            let mut frequencies: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *frequencies.entry(token.clone()).or_default() += 1;
            }
            for (term, tf) in frequencies {
                postings.entry(term).or_default().push((doc_index, tf));
            }

            docs.push(IndexedDoc {
                id: tool.id.clone(),
                len: tokens.len(),
                text,
            });
        }

        let avg_len = if docs.is_empty() {
            0.0
        } else {
            total_len as f32 / docs.len() as f32
        };
        debug!(
            docs = docs.len(),
            terms = postings.len(),
            "Lexical index built"
        );
        Self {
            docs,
            postings,
            avg_len,
        }
    }

    /// Pattern mode: `query` is compiled as a case-insensitive regex; if it
    /// is not a valid pattern it degrades to a set of literal terms. Matching
    /// descriptors are ordered by distinct matching terms descending, then
    /// id ascending, capped at `k`.
    pub fn query_pattern(&self, query: &str, k: usize) -> Vec<(String, f32)> {
        if query.trim().is_empty() || k == 0 {
            return Vec::new();
        }

        let mut scored = Vec::new();
        match RegexBuilder::new(query).case_insensitive(true).build() {
            Ok(pattern) => {
                for doc in &self.docs {
                    let distinct: HashSet<&str> = pattern
                        .find_iter(&doc.text)
                        .map(|found| found.as_str())
                        .collect();
                    if !distinct.is_empty() {
                        scored.push((doc.id.clone(), distinct.len() as f32));
                    }
                }
            }
            Err(_) => {
                debug!(query, "Query is not a valid pattern; matching literal terms");
                let terms: HashSet<String> = tokenize(query).into_iter().collect();
                if terms.is_empty() {
                    return Vec::new();
                }
                for doc in &self.docs {
                    let matched = terms
                        .iter()
                        .filter(|term| doc.text.contains(term.as_str()))
                        .count();
                    if matched > 0 {
                        scored.push((doc.id.clone(), matched as f32));
                    }
                }
            }
        }

        rank(scored, k)
    }

    /// Ranked relevance mode: BM25 over the query terms. Unknown terms
    /// contribute nothing; a query matching no descriptor yields an empty
    /// list, never the whole catalog.
    pub fn query_ranked(&self, query: &str, k: usize) -> Vec<(String, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let terms: HashSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let doc_count = self.docs.len() as f32;
        let mut scores: HashMap<usize, f32> = HashMap::new();
        for term in &terms {
            let Some(entries) = self.postings.get(term) else {
                continue;
            };
            let df = entries.len() as f32;
            let idf = (1.0 + (doc_count - df + 0.5) / (df + 0.5)).ln();
            for (doc_index, tf) in entries {
                let doc = &self.docs[*doc_index];
                let tf = *tf as f32;
                let norm = 1.0 - BM25_B + BM25_B * doc.len as f32 / self.avg_len;
                let contribution = idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * norm);
                *scores.entry(*doc_index).or_default() += contribution;
            }
        }

        let scored = scores
            .into_iter()
            .map(|(doc_index, score)| (self.docs[doc_index].id.clone(), score))
            .collect();
        rank(scored, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::catalog::descriptor;

    fn sample_index() -> LexicalIndex {
        let catalog = ToolCatalog::new(vec![
            descriptor(
                "convert_currency",
                "Convert an amount from one currency to another using exchange rates",
                false,
            ),
            descriptor("get_weather", "Get the current weather in a given location", false),
            descriptor(
                "get_forecast",
                "Get the weather forecast for multiple days ahead",
                false,
            ),
        ])
        .expect("catalog builds");
        LexicalIndex::build(&catalog)
    }

    #[test]
    fn tokenizes_on_non_alphanumeric_boundaries() {
        assert_eq!(
            tokenize("Get the weather, e.g. San-Francisco!"),
            vec!["get", "the", "weather", "e", "g", "san", "francisco"]
        );
    }

    #[test]
    fn ranked_query_prefers_matching_descriptor() {
        let index = sample_index();
        let hits = index.query_ranked("currency exchange", 5);
        assert_eq!(hits[0].0, "convert_currency");
    }

    #[test]
    fn ranked_query_is_idempotent() {
        let index = sample_index();
        let first = index.query_ranked("weather forecast", 5);
        let second = index.query_ranked("weather forecast", 5);
        let first_ids: Vec<_> = first.iter().map(|(id, _)| id.clone()).collect();
        let second_ids: Vec<_> = second.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn empty_or_unknown_queries_return_nothing() {
        let index = sample_index();
        assert!(index.query_ranked("", 5).is_empty());
        assert!(index.query_ranked("zzzzz", 5).is_empty());
        assert!(index.query_pattern("", 5).is_empty());
        assert!(index.query_pattern("zzzzz", 5).is_empty());
    }

    #[test]
    fn pattern_query_matches_regex() {
        let index = sample_index();
        let hits = index.query_pattern("weather|forecast", 5);
        let ids: Vec<_> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"get_weather"));
        assert!(ids.contains(&"get_forecast"));
        assert!(!ids.contains(&"convert_currency"));
        // Both terms match get_forecast, only one matches get_weather.
        assert_eq!(hits[0].0, "get_forecast");
    }

    #[test]
    fn invalid_pattern_falls_back_to_literal_terms() {
        let index = sample_index();
        let hits = index.query_pattern("currency(", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "convert_currency");
    }

    #[test]
    fn results_are_capped_at_k() {
        let index = sample_index();
        let hits = index.query_ranked("get weather forecast currency", 1);
        assert_eq!(hits.len(), 1);
    }
}
