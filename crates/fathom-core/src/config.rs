//! Vector store configuration.

use crate::distance::Distance;
use crate::error::{FathomError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Vector store configuration.
///
/// `insert_batch_size` and `upsert_batch_size` are independent knobs with
/// different defaults (10 and 20); both bound transaction size on the
/// relational backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// Backend name: "lancedb" or "sqlite".
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Connection target: a LanceDB directory or a SQLite database path.
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Query mode: "vector", "keyword", or "hybrid".
    #[serde(default = "default_search_type")]
    pub search_type: String,
    #[serde(default)]
    pub distance: Distance,
    /// Candidate search depth for ANN indexes, when the engine supports it.
    #[serde(default)]
    pub nprobes: Option<usize>,
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
}

fn default_backend() -> String { "lancedb".into() }
fn default_uri() -> String { "/tmp/fathom".into() }
fn default_table_name() -> String { "fathom".into() }
fn default_search_type() -> String { "vector".into() }
fn default_insert_batch_size() -> usize { 10 }
fn default_upsert_batch_size() -> usize { 20 }

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            uri: default_uri(),
            table_name: default_table_name(),
            search_type: default_search_type(),
            distance: Distance::default(),
            nprobes: None,
            insert_batch_size: default_insert_batch_size(),
            upsert_batch_size: default_upsert_batch_size(),
        }
    }
}

impl VectorStoreConfig {
    /// Load config from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FathomError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| FathomError::Config(format!("Failed to parse config: {e}")))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }
}
