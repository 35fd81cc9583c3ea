//! # Fathom VectorDb
//!
//! Uniform vector-store backends for agent retrieval.
//!
//! Two engines sit behind one [`VectorDb`] contract:
//! - **LanceDB** ([`LanceVectorDb`]) — embedded columnar vector engine;
//!   one bulk add per insert, native FTS index, no true upsert.
//! - **SQLite** ([`SqliteVectorDb`]) — embedded relational engine; vector
//!   ordering through registered SQL functions, FTS5 lexical search,
//!   batched transactional commits, real `ON CONFLICT` upsert.
//!
//! Backend quirks are deliberate, documented capability gaps rather than
//! silent fallthrough: the columnar backend reports
//! `upsert_available() == false` (its upsert delegates to insert and can
//! duplicate rows) and does not implement `name_exists`.
//!
//! All three query modes — vector similarity, keyword (full-text), and
//! hybrid fusion of both — run behind `search`, dispatched by the
//! configured search type.

pub mod fusion;
pub mod lance;
pub mod rerank;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fathom_core::config::VectorStoreConfig;
use fathom_core::error::{FathomError, Result};
use fathom_core::{Document, Embedder};
use serde_json::Value;

pub use lance::LanceVectorDb;
pub use rerank::KeywordOverlapReranker;
pub use sqlite::SqliteVectorDb;

/// How `search` interprets a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    /// Order rows by vector distance against the embedded query.
    Vector,
    /// Full-text match against the lexical index.
    Keyword,
    /// Vector and keyword candidates fused into one ranking.
    Hybrid,
}

impl SearchType {
    /// Lenient parse of the configured mode string. Returns `None` for
    /// unknown modes; the adapters log a diagnostic and return an empty
    /// result instead of failing the call.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vector" => Some(Self::Vector),
            "keyword" | "fts" => Some(Self::Keyword),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

/// Post-retrieval candidate reordering, applied before truncation to the
/// requested limit.
pub trait Reranker: Send + Sync {
    fn rerank(&self, query: &str, candidates: Vec<Document>) -> Vec<Document>;
}

/// The uniform vector-store contract.
///
/// Absent-object conditions are normal outcomes, never errors: `exists`
/// on a missing table is `Ok(false)`, `get_count` is `Ok(0)`, `delete` is
/// a no-op. Batched commits inside one `insert`/`upsert` call are not
/// atomic across the whole call — a failure after N of M documents leaves
/// the first N committed, and callers re-check via `doc_exists`/`id_exists`
/// before retrying.
#[async_trait]
pub trait VectorDb: Send + Sync {
    /// Backend name, e.g. "lancedb" or "sqlite".
    fn name(&self) -> &str;

    /// Create the backing table if it does not exist. Idempotent.
    async fn create(&self) -> Result<()>;

    /// Whether the backing table is present.
    async fn exists(&self) -> Result<bool>;

    /// Drop the backing table. No-op when absent.
    async fn delete(&self) -> Result<()>;

    /// Number of stored rows; 0 when the table does not exist.
    async fn get_count(&self) -> Result<usize>;

    /// Embed, encode, and persist documents in input order. No implicit
    /// dedup: a duplicate identifier fails on the relational backend
    /// (primary-key violation) and duplicates the row on the columnar one.
    async fn insert(&self, documents: &[Document]) -> Result<()>;

    /// Whether `upsert` is a true insert-or-update on this backend.
    fn upsert_available(&self) -> bool;

    /// Insert or, on identifier conflict, update every non-key column.
    async fn upsert(&self, documents: &[Document]) -> Result<()>;

    /// Run the configured query mode, returning at most `limit` documents.
    /// Filters apply as equality predicates on known columns (relational
    /// backend only); unknown filter keys are ignored.
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<Document>>;

    /// Existence by content identity (hash of cleaned content).
    async fn doc_exists(&self, document: &Document) -> Result<bool>;

    /// Existence by display name.
    async fn name_exists(&self, name: &str) -> Result<bool>;

    /// Existence by row identifier.
    async fn id_exists(&self, id: &str) -> Result<bool>;
}

/// Create a vector store from configuration.
pub async fn create_store(
    config: &VectorStoreConfig,
    embedder: Arc<dyn Embedder>,
) -> Result<Box<dyn VectorDb>> {
    match config.backend.as_str() {
        "lancedb" => Ok(Box::new(
            LanceVectorDb::connect_with(config, embedder).await?,
        )),
        "sqlite" => Ok(Box::new(SqliteVectorDb::open_with(config, embedder)?)),
        other => Err(FathomError::Config(format!(
            "unknown vector store backend: {other}"
        ))),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_type_parse() {
        assert_eq!(SearchType::parse("vector"), Some(SearchType::Vector));
        assert_eq!(SearchType::parse("keyword"), Some(SearchType::Keyword));
        assert_eq!(SearchType::parse("fts"), Some(SearchType::Keyword));
        assert_eq!(SearchType::parse("hybrid"), Some(SearchType::Hybrid));
        assert_eq!(SearchType::parse("bm42"), None);
    }

    #[tokio::test]
    async fn test_create_store_unknown_backend() {
        let config = VectorStoreConfig {
            backend: "duckdb".into(),
            ..Default::default()
        };
        let embedder = Arc::new(testutil::StubEmbedder::new(3));
        let err = create_store(&config, embedder).await.err().unwrap();
        assert!(matches!(err, FathomError::Config(_)));
    }
}
