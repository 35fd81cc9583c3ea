//! SQLite vector store backend.
//!
//! Relational adapter over an embedded SQLite database. The engine has no
//! native vector type, so embeddings are stored as JSON arrays and ranked
//! through deterministic scalar SQL functions registered at connection
//! open (`vec_cosine`, `vec_l2`, `vec_dot`). Lexical search runs against
//! an FTS5 shadow table with BM25 ranking, built lazily on the first
//! keyword or hybrid query and kept in sync by later writes.
//!
//! Writes commit in batches: one transaction per `insert_batch_size`
//! (or `upsert_batch_size`) documents plus a final one for the remainder.
//! A failure mid-call leaves earlier batches committed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fathom_core::config::VectorStoreConfig;
use fathom_core::distance::{cosine_similarity, dot_product, l2_distance};
use fathom_core::error::{FathomError, Result};
use fathom_core::{Distance, Document, Embedder, clean_content, content_hash};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::{Connection, ToSql, params};
use serde_json::Value;

use crate::{Reranker, SearchType, VectorDb, fusion};

/// Columns filters may target. Unknown filter keys are ignored with a
/// warning rather than rejected.
const FILTER_COLUMNS: &[&str] = &["id", "name", "content_hash"];

pub struct SqliteVectorDb {
    conn: Mutex<Connection>,
    table_name: String,
    embedder: Arc<dyn Embedder>,
    distance: Distance,
    search_type: String,
    insert_batch_size: usize,
    upsert_batch_size: usize,
    reranker: Option<Box<dyn Reranker>>,
    fts_index_built: AtomicBool,
}

/// A document encoded for storage: metadata, usage, and embedding
/// serialized to JSON text, content cleaned, identifier resolved.
struct Record {
    id: String,
    name: String,
    meta_data: String,
    content: String,
    embedding: String,
    usage: String,
    content_hash: String,
}

/// Raw row as read back from the table, before JSON decoding.
struct RawRow {
    id: String,
    name: Option<String>,
    meta_data: String,
    content: String,
    embedding: String,
    usage: String,
}

impl SqliteVectorDb {
    /// Open (or create) a database file. Fails fatally when the path is
    /// unusable — a store without a connection is a configuration error.
    pub fn open(path: &Path, table_name: &str, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| FathomError::Store(format!("sqlite open: {e}")))?;
        Self::from_connection(conn, table_name, embedder)
    }

    /// Wrap a caller-managed connection.
    pub fn from_connection(
        conn: Connection,
        table_name: &str,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        register_vector_functions(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            table_name: table_name.to_string(),
            embedder,
            distance: Distance::default(),
            search_type: "vector".into(),
            insert_batch_size: 10,
            upsert_batch_size: 20,
            reranker: None,
            fts_index_built: AtomicBool::new(false),
        })
    }

    /// Open from configuration.
    pub fn open_with(config: &VectorStoreConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let mut db = Self::open(Path::new(&config.uri), &config.table_name, embedder)?;
        db.distance = config.distance;
        db.search_type = config.search_type.clone();
        db.insert_batch_size = config.insert_batch_size;
        db.upsert_batch_size = config.upsert_batch_size;
        Ok(db)
    }

    pub fn with_distance(mut self, distance: Distance) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_search_type(mut self, search_type: impl Into<String>) -> Self {
        self.search_type = search_type.into();
        self
    }

    pub fn with_reranker(mut self, reranker: Box<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_insert_batch_size(mut self, batch_size: usize) -> Self {
        self.insert_batch_size = batch_size;
        self
    }

    pub fn with_upsert_batch_size(mut self, batch_size: usize) -> Self {
        self.upsert_batch_size = batch_size;
        self
    }

    /// Whether the lazy FTS5 index has been built
    /// (`NO_INDEX -> INDEX_BUILT` for this adapter instance).
    pub fn fts_index_built(&self) -> bool {
        self.fts_index_built.load(Ordering::SeqCst)
    }

    fn table_exists(&self, conn: &Connection) -> Result<bool> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![self.table_name],
                |row| row.get(0),
            )
            .map_err(|e| FathomError::Store(e.to_string()))?;
        Ok(count > 0)
    }

    /// Embed (unless a vector is already present) and encode one document.
    async fn encode(&self, document: &Document) -> Result<Record> {
        let embedding = match &document.embedding {
            Some(v) => v.clone(),
            None => self.embedder.get_embedding(&document.content).await?,
        };
        if embedding.len() != self.embedder.dimensions() {
            return Err(FathomError::Embedding(format!(
                "expected {} dimensions, got {}",
                self.embedder.dimensions(),
                embedding.len()
            )));
        }
        let cleaned = clean_content(&document.content);
        let hash = content_hash(&document.content);
        Ok(Record {
            id: document.id.clone().unwrap_or_else(|| hash.clone()),
            name: document.name.clone(),
            meta_data: serde_json::to_string(&document.meta_data)?,
            content: cleaned,
            embedding: serde_json::to_string(&embedding)?,
            usage: serde_json::to_string(&document.usage)?,
            content_hash: hash,
        })
    }

    /// Write documents in chunks of `batch_size`, one transaction per
    /// chunk. Embedding runs outside the connection lock; a failed
    /// embedding aborts its chunk before anything in it is committed.
    async fn write_batches(
        &self,
        documents: &[Document],
        batch_size: usize,
        upsert: bool,
    ) -> Result<()> {
        for chunk in documents.chunks(batch_size.max(1)) {
            let mut records = Vec::with_capacity(chunk.len());
            for document in chunk {
                records.push(self.encode(document).await?);
            }
            self.write_chunk(&records, upsert)?;
        }
        Ok(())
    }

    fn write_chunk(&self, records: &[Record], upsert: bool) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| FathomError::Store(e.to_string()))?;
        let tx = conn
            .transaction()
            .map_err(|e| FathomError::Store(e.to_string()))?;
        let sql = if upsert {
            format!(
                "INSERT INTO {t} (id, name, meta_data, content, embedding, usage, content_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     meta_data = excluded.meta_data,
                     content = excluded.content,
                     embedding = excluded.embedding,
                     usage = excluded.usage,
                     content_hash = excluded.content_hash,
                     updated_at = datetime('now')",
                t = self.table_name
            )
        } else {
            format!(
                "INSERT INTO {t} (id, name, meta_data, content, embedding, usage, content_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                t = self.table_name
            )
        };
        for record in records {
            tx.execute(
                &sql,
                params![
                    record.id,
                    record.name,
                    record.meta_data,
                    record.content,
                    record.embedding,
                    record.usage,
                    record.content_hash,
                ],
            )
            .map_err(|e| FathomError::Store(e.to_string()))?;
            // Keep the lexical index in step once it exists.
            if self.fts_index_built.load(Ordering::SeqCst) {
                tx.execute(
                    &format!("DELETE FROM {t}_fts WHERE id = ?1", t = self.table_name),
                    params![record.id],
                )
                .ok();
                // A failed index write would silently desync lexical
                // search from the main table; fail the chunk instead.
                tx.execute(
                    &format!(
                        "INSERT INTO {t}_fts (id, content) VALUES (?1, ?2)",
                        t = self.table_name
                    ),
                    params![record.id, record.content],
                )
                .map_err(|e| FathomError::Store(e.to_string()))?;
            }
            tracing::debug!("Wrote document: {} ({})", record.name, record.id);
        }
        tx.commit().map_err(|e| FathomError::Store(e.to_string()))?;
        tracing::debug!("Committed {} documents", records.len());
        Ok(())
    }

    /// Build the FTS5 shadow table and backfill it from the main table.
    /// One-time per adapter instance; cached in `fts_index_built`.
    fn ensure_fts_index(&self) -> Result<()> {
        if self.fts_index_built.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self
            .conn
            .lock()
            .map_err(|e| FathomError::Store(e.to_string()))?;
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {t}_fts USING fts5(
                id UNINDEXED,
                content,
                tokenize='unicode61'
            );
            DELETE FROM {t}_fts;
            INSERT INTO {t}_fts (id, content) SELECT id, content FROM {t};",
            t = self.table_name
        ))
        .map_err(|e| FathomError::Store(e.to_string()))?;
        self.fts_index_built.store(true, Ordering::SeqCst);
        tracing::debug!("Built FTS index: {}_fts", self.table_name);
        Ok(())
    }

    async fn vector_search(
        &self,
        query: &str,
        limit: usize,
        filters: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<Document>> {
        let query_embedding = match self.embedder.get_embedding(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Error getting embedding for query '{query}': {e}");
                return Ok(Vec::new());
            }
        };
        let query_json = serde_json::to_string(&query_embedding)?;
        self.vector_query(&query_json, limit, filters)
    }

    fn vector_query(
        &self,
        query_json: &str,
        limit: usize,
        filters: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<Document>> {
        let (func, dir) = match self.distance {
            Distance::Cosine => ("vec_cosine", "DESC"),
            Distance::L2 => ("vec_l2", "ASC"),
            Distance::MaxInnerProduct => ("vec_dot", "DESC"),
        };

        let mut sql = format!(
            "SELECT id, name, meta_data, content, embedding, usage FROM {t}",
            t = self.table_name
        );
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        let clauses = filter_clauses(filters, &mut args, "");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        args.push(Box::new(query_json.to_string()));
        sql.push_str(&format!(
            " ORDER BY {func}(embedding, ?{n}) {dir} LIMIT {limit}",
            n = args.len()
        ));
        tracing::debug!("Vector query: {sql}");

        let conn = self
            .conn
            .lock()
            .map_err(|e| FathomError::Store(e.to_string()))?;
        if !self.table_exists(&conn)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| FathomError::Store(e.to_string()))?;
        let arg_refs: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt
            .query_map(arg_refs.as_slice(), decode_row)
            .map_err(|e| FathomError::Store(e.to_string()))?;
        let mut raw = Vec::new();
        for row in rows {
            raw.push(row.map_err(|e| FathomError::Store(e.to_string()))?);
        }
        Ok(build_documents(raw))
    }

    fn keyword_query(
        &self,
        query: &str,
        limit: usize,
        filters: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<Document>> {
        // FTS5 chokes on raw punctuation; strip it the way the MATCH
        // grammar expects bare terms.
        let clean_query: String = query
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .collect();
        if clean_query.trim().is_empty() {
            return Ok(Vec::new());
        }

        {
            let conn = self
                .conn
                .lock()
                .map_err(|e| FathomError::Store(e.to_string()))?;
            if !self.table_exists(&conn)? {
                return Ok(Vec::new());
            }
        }
        self.ensure_fts_index()?;

        let conn = self
            .conn
            .lock()
            .map_err(|e| FathomError::Store(e.to_string()))?;
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(clean_query)];
        let clauses = filter_clauses(filters, &mut args, "m.");
        let mut sql = format!(
            "SELECT m.id, m.name, m.meta_data, m.content, m.embedding, m.usage
             FROM {t}_fts f
             JOIN {t} m ON m.id = f.id
             WHERE {t}_fts MATCH ?1",
            t = self.table_name
        );
        for clause in &clauses {
            sql.push_str(" AND ");
            sql.push_str(clause);
        }
        args.push(Box::new(limit as i64));
        sql.push_str(&format!(
            " ORDER BY bm25({t}_fts) LIMIT ?{n}",
            t = self.table_name,
            n = args.len()
        ));
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| FathomError::Store(e.to_string()))?;
        let arg_refs: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt
            .query_map(arg_refs.as_slice(), decode_row)
            .map_err(|e| FathomError::Store(e.to_string()))?;
        let mut raw = Vec::new();
        for row in rows {
            raw.push(row.map_err(|e| FathomError::Store(e.to_string()))?);
        }
        Ok(build_documents(raw))
    }

    fn exists_query(&self, column: &str, value: &str) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FathomError::Store(e.to_string()))?;
        if !self.table_exists(&conn)? {
            return Ok(false);
        }
        let count: i64 = conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM {t} WHERE {column} = ?1",
                    t = self.table_name
                ),
                params![value],
                |row| row.get(0),
            )
            .map_err(|e| FathomError::Store(e.to_string()))?;
        Ok(count > 0)
    }
}

#[async_trait]
impl VectorDb for SqliteVectorDb {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FathomError::Store(e.to_string()))?;
        if self.table_exists(&conn)? {
            return Ok(());
        }
        tracing::debug!("Creating table: {}", self.table_name);
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                id TEXT PRIMARY KEY,
                name TEXT,
                meta_data TEXT NOT NULL DEFAULT '{{}}',
                content TEXT NOT NULL,
                embedding TEXT NOT NULL,
                usage TEXT NOT NULL DEFAULT '{{}}',
                content_hash TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT
            );",
            t = self.table_name
        ))
        .map_err(|e| FathomError::Store(e.to_string()))
    }

    async fn exists(&self) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FathomError::Store(e.to_string()))?;
        self.table_exists(&conn)
    }

    async fn delete(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FathomError::Store(e.to_string()))?;
        if self.table_exists(&conn)? {
            tracing::debug!("Dropping table: {}", self.table_name);
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {t};
                 DROP TABLE IF EXISTS {t}_fts;",
                t = self.table_name
            ))
            .map_err(|e| FathomError::Store(e.to_string()))?;
            self.fts_index_built.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn get_count(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FathomError::Store(e.to_string()))?;
        if !self.table_exists(&conn)? {
            return Ok(0);
        }
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {t}", t = self.table_name),
                [],
                |row| row.get(0),
            )
            .map_err(|e| FathomError::Store(e.to_string()))?;
        Ok(count as usize)
    }

    async fn insert(&self, documents: &[Document]) -> Result<()> {
        tracing::debug!(
            "Inserting {} documents into {}",
            documents.len(),
            self.table_name
        );
        self.write_batches(documents, self.insert_batch_size, false)
            .await
    }

    fn upsert_available(&self) -> bool {
        true
    }

    async fn upsert(&self, documents: &[Document]) -> Result<()> {
        tracing::debug!(
            "Upserting {} documents into {}",
            documents.len(),
            self.table_name
        );
        self.write_batches(documents, self.upsert_batch_size, true)
            .await
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<Document>> {
        let Some(search_type) = SearchType::parse(&self.search_type) else {
            tracing::error!(
                "Invalid search type: {} (supported: vector, keyword, hybrid)",
                self.search_type
            );
            return Ok(Vec::new());
        };
        let mut results = match search_type {
            SearchType::Vector => self.vector_search(query, limit, filters).await?,
            SearchType::Keyword => self.keyword_query(query, limit, filters)?,
            SearchType::Hybrid => {
                let vector = self.vector_search(query, limit, filters).await?;
                let keyword = self.keyword_query(query, limit, filters)?;
                fusion::rrf_fusion(vector, keyword, limit)
            }
        };
        if let Some(reranker) = &self.reranker {
            results = reranker.rerank(query, results);
        }
        results.truncate(limit);
        Ok(results)
    }

    async fn doc_exists(&self, document: &Document) -> Result<bool> {
        self.exists_query("content_hash", &content_hash(&document.content))
    }

    async fn name_exists(&self, name: &str) -> Result<bool> {
        self.exists_query("name", name)
    }

    async fn id_exists(&self, id: &str) -> Result<bool> {
        self.exists_query("id", id)
    }
}

/// Equality predicates for recognized filter columns, appending their
/// values to `args`. Unknown keys are skipped with a warning. `prefix`
/// qualifies column names in joined queries ("m." for the FTS join).
fn filter_clauses(
    filters: Option<&HashMap<String, Value>>,
    args: &mut Vec<Box<dyn ToSql>>,
    prefix: &str,
) -> Vec<String> {
    let mut clauses = Vec::new();
    if let Some(filters) = filters {
        for (key, value) in filters {
            if !FILTER_COLUMNS.contains(&key.as_str()) {
                tracing::warn!("Ignoring unknown filter column: {key}");
                continue;
            }
            args.push(Box::new(filter_value(value)));
            clauses.push(format!("{prefix}{key} = ?{}", args.len()));
        }
    }
    clauses
}

/// Map a JSON filter value onto SQLite text equality.
fn filter_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        name: row.get(1)?,
        meta_data: row.get(2)?,
        content: row.get(3)?,
        embedding: row.get(4)?,
        usage: row.get(5)?,
    })
}

/// Decode raw rows into documents. All-or-nothing: a single corrupt
/// meta_data/usage/embedding blob fails the whole result set, which is
/// logged and surfaced as an empty list — a silently shortened list would
/// hide the loss.
fn build_documents(rows: Vec<RawRow>) -> Vec<Document> {
    let decoded: Result<Vec<Document>> = rows
        .into_iter()
        .map(|row| {
            Ok(Document {
                id: Some(row.id),
                name: row.name.unwrap_or_default(),
                content: row.content,
                meta_data: serde_json::from_str(&row.meta_data)?,
                usage: serde_json::from_str(&row.usage)?,
                embedding: Some(serde_json::from_str(&row.embedding)?),
            })
        })
        .collect();
    match decoded {
        Ok(documents) => documents,
        Err(e) => {
            tracing::error!("Error building search results: {e}");
            Vec::new()
        }
    }
}

/// Register the vector "extension": deterministic scalar functions over
/// JSON-encoded embeddings, one per distance metric.
fn register_vector_functions(conn: &Connection) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function("vec_cosine", 2, flags, |ctx| {
        let (a, b) = vector_args(ctx)?;
        Ok(cosine_similarity(&a, &b) as f64)
    })
    .map_err(|e| FathomError::Store(e.to_string()))?;
    conn.create_scalar_function("vec_l2", 2, flags, |ctx| {
        let (a, b) = vector_args(ctx)?;
        Ok(l2_distance(&a, &b) as f64)
    })
    .map_err(|e| FathomError::Store(e.to_string()))?;
    conn.create_scalar_function("vec_dot", 2, flags, |ctx| {
        let (a, b) = vector_args(ctx)?;
        Ok(dot_product(&a, &b) as f64)
    })
    .map_err(|e| FathomError::Store(e.to_string()))?;
    Ok(())
}

fn vector_args(ctx: &Context<'_>) -> rusqlite::Result<(Vec<f32>, Vec<f32>)> {
    let a: String = ctx.get(0)?;
    let b: String = ctx.get(1)?;
    let a: Vec<f32> = serde_json::from_str(&a)
        .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
    let b: Vec<f32> = serde_json::from_str(&b)
        .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
    Ok((a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StubEmbedder;

    fn open_db(embedder: StubEmbedder) -> SqliteVectorDb {
        let conn = Connection::open_in_memory().unwrap();
        SqliteVectorDb::from_connection(conn, "docs", Arc::new(embedder)).unwrap()
    }

    async fn open_created(embedder: StubEmbedder) -> SqliteVectorDb {
        let db = open_db(embedder);
        db.create().await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_create_exists_delete_count() {
        let db = open_db(StubEmbedder::new(3));
        assert!(!db.exists().await.unwrap());
        assert_eq!(db.get_count().await.unwrap(), 0); // absent table is not an error

        db.create().await.unwrap();
        assert!(db.exists().await.unwrap());
        assert_eq!(db.get_count().await.unwrap(), 0);
        db.create().await.unwrap(); // idempotent

        db.delete().await.unwrap();
        assert!(!db.exists().await.unwrap());
        assert_eq!(db.get_count().await.unwrap(), 0);
        db.delete().await.unwrap(); // no-op when absent
    }

    #[tokio::test]
    async fn test_open_file_backed() {
        let dir = std::env::temp_dir().join("fathom-sqlite-open-test");
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).ok();
        let db = SqliteVectorDb::open(
            &dir.join("store.db"),
            "docs",
            Arc::new(StubEmbedder::new(3)),
        )
        .unwrap();
        db.create().await.unwrap();
        assert!(db.exists().await.unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_insert_doc_exists_and_count() {
        let db = open_created(StubEmbedder::new(3)).await;
        let doc_a = Document::new("a", "alpha content");
        let doc_b = Document::new("b", "beta content");

        assert!(!db.doc_exists(&doc_a).await.unwrap());
        db.insert(&[doc_a.clone(), doc_b]).await.unwrap();
        assert!(db.doc_exists(&doc_a).await.unwrap());
        assert_eq!(db.get_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_duplicate_id_fails() {
        let db = open_created(StubEmbedder::new(3)).await;
        let doc = Document::new("a", "same content");
        db.insert(&[doc.clone()]).await.unwrap();
        // Same content hashes to the same primary key.
        assert!(db.insert(&[doc]).await.is_err());
        assert_eq!(db.get_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let db = open_created(StubEmbedder::new(3)).await;
        assert!(db.upsert_available());

        let v1 = Document::new("note", "first version").with_id("k1");
        db.upsert(&[v1.clone()]).await.unwrap();
        db.upsert(&[v1]).await.unwrap();
        assert_eq!(db.get_count().await.unwrap(), 1);

        // Conflict on id updates every non-key column.
        let v2 = Document::new("note", "second version").with_id("k1");
        db.upsert(&[v2]).await.unwrap();
        assert_eq!(db.get_count().await.unwrap(), 1);
        let results = db.search("second version", 1, None).await.unwrap();
        assert_eq!(results[0].content, "second version");
    }

    #[tokio::test]
    async fn test_nul_cleaning_end_to_end() {
        let db = open_created(StubEmbedder::new(3)).await;
        db.insert(&[Document::new("fox", "The quick brown fox")])
            .await
            .unwrap();
        // Cleaned content differs ("The\u{FFFD} quick...") so this is a
        // different document...
        let with_nul = Document::new("fox", "The\x00 quick brown fox");
        assert!(!db.doc_exists(&with_nul).await.unwrap());
        // ...but NUL and replacement-char variants are the same identity.
        db.insert(&[with_nul.clone()]).await.unwrap();
        let with_replacement = Document::new("fox", "The\u{FFFD} quick brown fox");
        assert!(db.doc_exists(&with_replacement).await.unwrap());
        assert!(db.doc_exists(&with_nul).await.unwrap());
    }

    #[tokio::test]
    async fn test_vector_search_orders_nearest_first() {
        let embedder = StubEmbedder::new(3)
            .with_fixed("query text", vec![1.0, 0.0, 0.0])
            .with_fixed("near", vec![0.95, 0.05, 0.0])
            .with_fixed("mid", vec![0.6, 0.4, 0.0])
            .with_fixed("far", vec![0.0, 1.0, 0.0]);
        let db = open_created(embedder).await;
        db.insert(&[
            Document::new("far", "far"),
            Document::new("near", "near"),
            Document::new("mid", "mid"),
        ])
        .await
        .unwrap();

        let results = db.search("query text", 3, None).await.unwrap();
        let names: Vec<&str> = results.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["near", "mid", "far"]);
    }

    #[tokio::test]
    async fn test_l2_orders_ascending() {
        let embedder = StubEmbedder::new(3)
            .with_fixed("q", vec![0.0, 0.0, 0.0])
            .with_fixed("close", vec![0.1, 0.0, 0.0])
            .with_fixed("distant", vec![5.0, 0.0, 0.0]);
        let db = open_db(embedder).with_distance(Distance::L2);
        db.create().await.unwrap();
        db.insert(&[
            Document::new("distant", "distant"),
            Document::new("close", "close"),
        ])
        .await
        .unwrap();

        let results = db.search("q", 2, None).await.unwrap();
        assert_eq!(results[0].name, "close");
    }

    #[tokio::test]
    async fn test_keyword_search_builds_index_once() {
        let db = open_db(StubEmbedder::new(3)).with_search_type("keyword");
        db.create().await.unwrap();
        db.insert(&[
            Document::new("a", "rust borrow checker"),
            Document::new("b", "python garbage collector"),
        ])
        .await
        .unwrap();

        assert!(!db.fts_index_built());
        let results = db.search("borrow", 5, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "a");
        assert!(db.fts_index_built());

        // Second query reuses the built index; documents written after
        // the build are searchable too.
        db.insert(&[Document::new("c", "rust async runtime")])
            .await
            .unwrap();
        let results = db.search("rust", 5, None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(db.fts_index_built());
    }

    #[tokio::test]
    async fn test_hybrid_search_fuses_both_modes() {
        let embedder = StubEmbedder::new(3)
            .with_fixed("tokio runtime", vec![1.0, 0.0, 0.0])
            .with_fixed("the tokio async runtime", vec![0.9, 0.1, 0.0])
            .with_fixed("a cooking recipe", vec![0.0, 1.0, 0.0]);
        let db = open_db(embedder).with_search_type("hybrid");
        db.create().await.unwrap();
        db.insert(&[
            Document::new("runtime", "the tokio async runtime"),
            Document::new("recipe", "a cooking recipe"),
        ])
        .await
        .unwrap();

        let results = db.search("tokio runtime", 2, None).await.unwrap();
        assert!(!results.is_empty());
        // Near in vector space and a keyword hit: must rank first.
        assert_eq!(results[0].name, "runtime");
    }

    #[tokio::test]
    async fn test_unknown_search_type_returns_empty() {
        let db = open_db(StubEmbedder::new(3)).with_search_type("bm42");
        db.create().await.unwrap();
        db.insert(&[Document::new("a", "something")]).await.unwrap();
        let results = db.search("something", 5, None).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_filter_key_is_ignored() {
        let db = open_created(StubEmbedder::new(3)).await;
        db.insert(&[
            Document::new("a", "first doc"),
            Document::new("b", "second doc"),
        ])
        .await
        .unwrap();

        let mut filters = HashMap::new();
        filters.insert("name".to_string(), Value::String("a".into()));
        filters.insert("no_such_column".to_string(), Value::Bool(true));
        let results = db.search("first doc", 5, Some(&filters)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "a");
    }

    #[tokio::test]
    async fn test_filters_constrain_keyword_and_hybrid_results() {
        let db = open_db(StubEmbedder::new(3)).with_search_type("keyword");
        db.create().await.unwrap();
        db.insert(&[
            Document::new("a", "shared keyword first"),
            Document::new("b", "shared keyword second"),
        ])
        .await
        .unwrap();

        let mut filters = HashMap::new();
        filters.insert("name".to_string(), Value::String("a".into()));
        // Both rows match lexically; the filter keeps only name = "a".
        let results = db.search("shared", 5, Some(&filters)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "a");

        let db = db.with_search_type("hybrid");
        let results = db.search("shared", 5, Some(&filters)).await.unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().all(|d| d.name == "a"));
    }

    #[tokio::test]
    async fn test_fts_write_failure_fails_the_chunk() {
        let dir = std::env::temp_dir().join("fathom-sqlite-fts-write-test");
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("store.db");
        let db = SqliteVectorDb::open(&path, "docs", Arc::new(StubEmbedder::new(3)))
            .unwrap()
            .with_search_type("keyword");
        db.create().await.unwrap();
        db.insert(&[Document::new("a", "rust borrow checker")])
            .await
            .unwrap();
        db.search("borrow", 5, None).await.unwrap();
        assert!(db.fts_index_built());

        // Pull the lexical index out from under the adapter; the next
        // write must fail its whole chunk rather than desync the index.
        let side = Connection::open(&path).unwrap();
        side.execute_batch("DROP TABLE docs_fts;").unwrap();
        drop(side);

        let err = db
            .insert(&[Document::new("b", "python garbage collector")])
            .await;
        assert!(err.is_err());
        assert_eq!(db.get_count().await.unwrap(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_name_and_id_exists() {
        let db = open_created(StubEmbedder::new(3)).await;
        db.insert(&[Document::new("report", "annual report").with_id("r-1")])
            .await
            .unwrap();
        assert!(db.name_exists("report").await.unwrap());
        assert!(!db.name_exists("missing").await.unwrap());
        assert!(db.id_exists("r-1").await.unwrap());
        assert!(!db.id_exists("r-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_embedding_failure_aborts_write() {
        let db = open_created(StubEmbedder::failing(3)).await;
        let err = db.insert(&[Document::new("a", "text")]).await.unwrap_err();
        assert!(matches!(err, FathomError::Embedding(_)));
        assert_eq!(db.get_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_presupplied_embedding_skips_embedder() {
        // A failing embedder is never called when the vector is present.
        let db = open_created(StubEmbedder::failing(3)).await;
        let doc = Document::new("a", "text").with_embedding(vec![1.0, 2.0, 3.0]);
        db.insert(&[doc.clone()]).await.unwrap();
        assert!(db.doc_exists(&doc).await.unwrap());
    }

    #[tokio::test]
    async fn test_search_on_absent_table_is_empty() {
        let db = open_db(StubEmbedder::new(3));
        let results = db.search("anything", 5, None).await.unwrap();
        assert!(results.is_empty());
        assert!(!db.doc_exists(&Document::new("a", "b")).await.unwrap());
    }

    #[tokio::test]
    async fn test_search_roundtrips_metadata() {
        let db = open_created(StubEmbedder::new(3)).await;
        let doc = Document::new("a", "tagged doc")
            .with_meta("source", Value::String("unit-test".into()));
        db.insert(&[doc]).await.unwrap();
        let results = db.search("tagged doc", 1, None).await.unwrap();
        assert_eq!(
            results[0].meta_data.get("source"),
            Some(&Value::String("unit-test".into()))
        );
        assert_eq!(results[0].embedding.as_ref().unwrap().len(), 3);
    }
}
