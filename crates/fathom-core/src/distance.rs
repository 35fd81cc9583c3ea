//! Distance metrics for vector ranking.
//!
//! Cosine and max-inner-product score "higher is more similar" and sort
//! descending; L2 scores "lower is more similar" and sorts ascending.
//! The exact f32 kernels back the SQL functions the relational backend
//! registers at connection open.

use crate::error::FathomError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Distance metric, selected at adapter construction and fixed for the
/// table's lifetime. Drives the query ordering expression, not the stored
/// representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distance {
    #[default]
    Cosine,
    L2,
    MaxInnerProduct,
}

impl Distance {
    /// Whether larger values mean more similar (descending sort).
    pub fn sorts_descending(&self) -> bool {
        !matches!(self, Distance::L2)
    }
}

impl FromStr for Distance {
    type Err = FathomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(Distance::Cosine),
            "l2" | "euclidean" => Ok(Distance::L2),
            "max_inner_product" | "dot" => Ok(Distance::MaxInnerProduct),
            other => Err(FathomError::Config(format!(
                "unknown distance metric: {other}"
            ))),
        }
    }
}

/// Cosine similarity in [-1, 1]. Returns 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot = dot_product(a, b);
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Squared Euclidean distance. Ordering-equivalent to true L2.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
