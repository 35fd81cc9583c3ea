//! LanceDB vector store backend.
//!
//! Embedded columnar adapter. Row layout: a fixed-size float vector, the
//! row id, and a JSON `payload` column carrying name/meta_data/content/
//! usage. Inserts are one bulk add per call; the full-text index over the
//! payload column is built lazily on the first keyword or hybrid query
//! and lives for the adapter instance's lifetime.
//!
//! Known capability gaps, kept explicit rather than papered over:
//! `upsert` delegates to `insert` (no native upsert primitive — duplicate
//! identifiers duplicate rows) and `name_exists` is unsupported because
//! the name lives inside the JSON payload.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow_array::types::Float32Type;
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use fathom_core::config::VectorStoreConfig;
use fathom_core::error::{FathomError, Result};
use fathom_core::{Distance, Document, Embedder, clean_content, content_hash};
use futures::TryStreamExt;
use lancedb::database::CreateTableMode;
use lancedb::index::Index;
use lancedb::index::scalar::{FtsIndexBuilder, FullTextSearchQuery};
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Reranker, SearchType, VectorDb, fusion};

const VECTOR_COL: &str = "vector";
const ID_COL: &str = "id";
const PAYLOAD_COL: &str = "payload";

/// The JSON blob stored per row alongside id and vector.
#[derive(Serialize, Deserialize)]
struct Payload {
    name: String,
    meta_data: HashMap<String, Value>,
    content: String,
    usage: HashMap<String, Value>,
}

pub struct LanceVectorDb {
    conn: Connection,
    table_name: String,
    embedder: Arc<dyn Embedder>,
    distance: Distance,
    nprobes: Option<usize>,
    search_type: String,
    reranker: Option<Box<dyn Reranker>>,
    fts_index_built: AtomicBool,
}

impl LanceVectorDb {
    /// Connect to a LanceDB directory and ensure the table exists.
    /// Connection failure is fatal; everything downstream assumes a
    /// usable engine handle.
    pub async fn connect(
        uri: &str,
        table_name: &str,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let conn = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| FathomError::Store(format!("lancedb connect: {e}")))?;
        let db = Self {
            conn,
            table_name: table_name.to_string(),
            embedder,
            distance: Distance::default(),
            nprobes: None,
            search_type: "vector".into(),
            reranker: None,
            fts_index_built: AtomicBool::new(false),
        };
        db.create().await?;
        Ok(db)
    }

    /// Connect from configuration.
    pub async fn connect_with(
        config: &VectorStoreConfig,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let mut db = Self::connect(&config.uri, &config.table_name, embedder).await?;
        db.distance = config.distance;
        db.nprobes = config.nprobes;
        db.search_type = config.search_type.clone();
        Ok(db)
    }

    pub fn with_distance(mut self, distance: Distance) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_nprobes(mut self, nprobes: usize) -> Self {
        self.nprobes = Some(nprobes);
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

    /// Whether the lazy full-text index has been built
    /// (`NO_INDEX -> INDEX_BUILT` for this adapter instance).
    pub fn fts_index_built(&self) -> bool {
        self.fts_index_built.load(Ordering::SeqCst)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new(
                VECTOR_COL,
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.embedder.dimensions() as i32,
                ),
                true,
            ),
            Field::new(ID_COL, DataType::Utf8, false),
            Field::new(PAYLOAD_COL, DataType::Utf8, false),
        ]))
    }

    async fn open_table(&self) -> Result<Table> {
        self.conn
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| FathomError::Store(e.to_string()))
    }

    fn distance_type(&self) -> DistanceType {
        match self.distance {
            Distance::Cosine => DistanceType::Cosine,
            Distance::L2 => DistanceType::L2,
            Distance::MaxInnerProduct => DistanceType::Dot,
        }
    }

    /// Embed (unless vectors are already present) and encode documents
    /// into one Arrow record batch.
    async fn encode(&self, documents: &[Document]) -> Result<RecordBatch> {
        let dims = self.embedder.dimensions();
        let mut ids = Vec::with_capacity(documents.len());
        let mut payloads = Vec::with_capacity(documents.len());
        let mut vectors: Vec<Option<Vec<Option<f32>>>> = Vec::with_capacity(documents.len());
        for document in documents {
            let embedding = match &document.embedding {
                Some(v) => v.clone(),
                None => self.embedder.get_embedding(&document.content).await?,
            };
            if embedding.len() != dims {
                return Err(FathomError::Embedding(format!(
                    "expected {dims} dimensions, got {}",
                    embedding.len()
                )));
            }
            let cleaned = clean_content(&document.content);
            let hash = content_hash(&document.content);
            ids.push(document.id.clone().unwrap_or(hash));
            payloads.push(serde_json::to_string(&Payload {
                name: document.name.clone(),
                meta_data: document.meta_data.clone(),
                content: cleaned,
                usage: document.usage.clone(),
            })?);
            vectors.push(Some(embedding.into_iter().map(Some).collect()));
            tracing::debug!("Encoded document: {}", document.name);
        }
        RecordBatch::try_new(
            self.schema(),
            vec![
                Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
                    vectors, dims as i32,
                )),
                Arc::new(StringArray::from(ids)),
                Arc::new(StringArray::from(payloads)),
            ],
        )
        .map_err(|e| FathomError::Store(e.to_string()))
    }

    /// Build the FTS index over the payload column, once per instance.
    async fn ensure_fts_index(&self, table: &Table) -> Result<()> {
        if self.fts_index_built.load(Ordering::SeqCst) {
            return Ok(());
        }
        table
            .create_index(&[PAYLOAD_COL], Index::FTS(FtsIndexBuilder::default()))
            .execute()
            .await
            .map_err(|e| FathomError::Store(e.to_string()))?;
        self.fts_index_built.store(true, Ordering::SeqCst);
        tracing::debug!("Built FTS index over column: {PAYLOAD_COL}");
        Ok(())
    }

    async fn vector_search(&self, query: &str, limit: usize) -> Result<Vec<Document>> {
        let query_embedding = match self.embedder.get_embedding(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Error getting embedding for query '{query}': {e}");
                return Ok(Vec::new());
            }
        };
        let table = self.open_table().await?;
        let mut q = table
            .vector_search(query_embedding)
            .map_err(|e| FathomError::Store(e.to_string()))?
            .distance_type(self.distance_type())
            .limit(limit);
        if let Some(nprobes) = self.nprobes {
            q = q.nprobes(nprobes);
        }
        let stream = q
            .execute()
            .await
            .map_err(|e| FathomError::Store(e.to_string()))?;
        let batches = collect_batches(stream).await?;
        Ok(decode_or_empty(&batches))
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Document>> {
        let table = self.open_table().await?;
        self.ensure_fts_index(&table).await?;
        let stream = table
            .query()
            .full_text_search(FullTextSearchQuery::new(query.to_owned()))
            .limit(limit)
            .execute()
            .await
            .map_err(|e| FathomError::Store(e.to_string()))?;
        let batches = collect_batches(stream).await?;
        Ok(decode_or_empty(&batches))
    }

    async fn id_lookup(&self, id: &str) -> Result<bool> {
        if !self.exists().await? {
            return Ok(false);
        }
        let table = self.open_table().await?;
        let safe = id.replace('\'', "''");
        let stream = table
            .query()
            .only_if(format!("{ID_COL} = '{safe}'"))
            .limit(1)
            .execute()
            .await
            .map_err(|e| FathomError::Store(e.to_string()))?;
        let batches = collect_batches(stream).await?;
        Ok(batches.iter().any(|batch| batch.num_rows() > 0))
    }
}

#[async_trait]
impl VectorDb for LanceVectorDb {
    fn name(&self) -> &str {
        "lancedb"
    }

    async fn create(&self) -> Result<()> {
        if self.exists().await? {
            return Ok(());
        }
        tracing::debug!("Creating table: {}", self.table_name);
        self.conn
            .create_empty_table(&self.table_name, self.schema())
            .mode(CreateTableMode::Overwrite)
            .execute()
            .await
            .map_err(|e| FathomError::Store(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        let names = self
            .conn
            .table_names()
            .execute()
            .await
            .map_err(|e| FathomError::Store(e.to_string()))?;
        Ok(names.contains(&self.table_name))
    }

    async fn delete(&self) -> Result<()> {
        if self.exists().await? {
            tracing::debug!("Dropping table: {}", self.table_name);
            self.conn
                .drop_table(&self.table_name)
                .await
                .map_err(|e| FathomError::Store(e.to_string()))?;
            self.fts_index_built.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn get_count(&self) -> Result<usize> {
        if !self.exists().await? {
            return Ok(0);
        }
        let table = self.open_table().await?;
        table
            .count_rows(None)
            .await
            .map_err(|e| FathomError::Store(e.to_string()))
    }

    async fn insert(&self, documents: &[Document]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            "Inserting {} documents into {}",
            documents.len(),
            self.table_name
        );
        let batch = self.encode(documents).await?;
        let schema = batch.schema();
        let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
        let table = self.open_table().await?;
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| FathomError::Store(e.to_string()))?;
        Ok(())
    }

    fn upsert_available(&self) -> bool {
        false
    }

    /// No native upsert primitive: delegates to `insert`, so a duplicate
    /// identifier produces a duplicate row. Callers relying on
    /// upsert-without-duplication must pre-check `doc_exists`/`id_exists`.
    async fn upsert(&self, documents: &[Document]) -> Result<()> {
        tracing::debug!("Redirecting upsert to insert");
        self.insert(documents).await
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<Document>> {
        if filters.is_some_and(|f| !f.is_empty()) {
            tracing::warn!("Filters are not supported by the lancedb backend; ignoring");
        }
        let Some(search_type) = SearchType::parse(&self.search_type) else {
            tracing::error!(
                "Invalid search type: {} (supported: vector, keyword, hybrid)",
                self.search_type
            );
            return Ok(Vec::new());
        };
        let mut results = match search_type {
            SearchType::Vector => self.vector_search(query, limit).await?,
            SearchType::Keyword => self.keyword_search(query, limit).await?,
            SearchType::Hybrid => {
                let vector = self.vector_search(query, limit).await?;
                let keyword = self.keyword_search(query, limit).await?;
                fusion::rrf_fusion(vector, keyword, limit)
            }
        };
        if let Some(reranker) = &self.reranker {
            results = reranker.rerank(query, results);
        }
        results.truncate(limit);
        Ok(results)
    }

    /// Existence by content identity. Rows written without an explicit id
    /// use the content hash as their id, which is what this checks.
    async fn doc_exists(&self, document: &Document) -> Result<bool> {
        self.id_lookup(&content_hash(&document.content)).await
    }

    async fn name_exists(&self, _name: &str) -> Result<bool> {
        Err(FathomError::Unsupported(
            "name_exists is not implemented by the lancedb backend",
        ))
    }

    async fn id_exists(&self, id: &str) -> Result<bool> {
        self.id_lookup(id).await
    }
}

async fn collect_batches<S, E>(mut stream: S) -> Result<Vec<RecordBatch>>
where
    S: futures::Stream<Item = std::result::Result<RecordBatch, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut batches = Vec::new();
    while let Some(batch) = stream
        .try_next()
        .await
        .map_err(|e| FathomError::Store(e.to_string()))?
    {
        batches.push(batch);
    }
    Ok(batches)
}

/// Decode result batches, all-or-nothing: one corrupt payload fails the
/// whole set, which is logged and surfaced as an empty list rather than a
/// silently shortened one.
fn decode_or_empty(batches: &[RecordBatch]) -> Vec<Document> {
    match decode_batches(batches) {
        Ok(documents) => documents,
        Err(e) => {
            tracing::error!("Error building search results: {e}");
            Vec::new()
        }
    }
}

fn decode_batches(batches: &[RecordBatch]) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for batch in batches {
        let ids = batch
            .column_by_name(ID_COL)
            .and_then(|col| col.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| FathomError::Store("missing id column in result".into()))?;
        let payloads = batch
            .column_by_name(PAYLOAD_COL)
            .and_then(|col| col.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| FathomError::Store("missing payload column in result".into()))?;
        let vectors = batch
            .column_by_name(VECTOR_COL)
            .and_then(|col| col.as_any().downcast_ref::<FixedSizeListArray>());
        for i in 0..batch.num_rows() {
            let payload: Payload = serde_json::from_str(payloads.value(i))?;
            let embedding = vectors.map(|col| {
                col.value(i)
                    .as_any()
                    .downcast_ref::<Float32Array>()
                    .map(|floats| floats.values().to_vec())
                    .unwrap_or_default()
            });
            documents.push(Document {
                id: Some(ids.value(i).to_string()),
                name: payload.name,
                content: payload.content,
                meta_data: payload.meta_data,
                usage: payload.usage,
                embedding,
            });
        }
    }
    Ok(documents)
}
