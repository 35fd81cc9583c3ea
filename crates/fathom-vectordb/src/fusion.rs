//! Hybrid search fusion.
//!
//! Reciprocal Rank Fusion combines the vector and keyword candidate lists
//! into a single ranking: `score(d) = sum(1 / (k + rank_i + 1))` over the
//! lists that contain `d`. Rank-based, so the two retrievals' incomparable
//! score scales never need normalizing.

use fathom_core::Document;
use std::collections::HashMap;

/// RRF constant; dampens the advantage of a single top rank.
const RRF_K: f32 = 60.0;

/// Fuse two ranked candidate lists, keyed by effective document id.
/// A document present in both lists accumulates both contributions.
pub fn rrf_fusion(
    vector_results: Vec<Document>,
    keyword_results: Vec<Document>,
    limit: usize,
) -> Vec<Document> {
    let mut scores: HashMap<String, f32> =
        HashMap::with_capacity(vector_results.len() + keyword_results.len());
    let mut docs: HashMap<String, Document> = HashMap::with_capacity(scores.capacity());

    for list in [vector_results, keyword_results] {
        for (rank, doc) in list.into_iter().enumerate() {
            let id = doc.effective_id();
            *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (RRF_K + rank as f32 + 1.0);
            docs.entry(id).or_insert(doc);
        }
    }

    let mut ranked: Vec<(String, f32)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
        .into_iter()
        .take(limit)
        .filter_map(|(id, _)| docs.remove(&id))
        .collect()
}
