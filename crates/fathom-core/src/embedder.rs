//! Embedding provider contract.

use crate::error::Result;
use async_trait::async_trait;

/// Converts text into a fixed-dimension vector on demand.
///
/// Adapters fix their table schema to [`dimensions`](Embedder::dimensions)
/// at creation time; changing dimensionality afterwards means dropping and
/// recreating the table.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn get_embedding(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;
}
