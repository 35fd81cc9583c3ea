//! Rerankers: post-retrieval candidate reordering.

use crate::Reranker;
use fathom_core::Document;

/// Blends retrieval rank with query-term overlap (70/30). A cheap lexical
/// sanity pass over a vector candidate set; not a learned model.
pub struct KeywordOverlapReranker;

impl Reranker for KeywordOverlapReranker {
    fn rerank(&self, query: &str, candidates: Vec<Document>) -> Vec<Document> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() || candidates.is_empty() {
            return candidates;
        }

        let total = candidates.len() as f32;
        let mut scored: Vec<(f32, Document)> = candidates
            .into_iter()
            .enumerate()
            .map(|(rank, doc)| {
                let content = doc.content.to_lowercase();
                let hits = terms.iter().filter(|t| content.contains(*t)).count() as f32;
                let rank_score = (total - rank as f32) / total;
                let overlap = hits / terms.len() as f32;
                (rank_score * 0.7 + overlap * 0.3, doc)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, doc)| doc).collect()
    }
}
