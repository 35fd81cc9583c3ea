//! Caller-facing document model and content identity.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Replace embedded NUL bytes with U+FFFD. Storage engines reject NULs
/// inside text columns, so this runs before hashing and before storage.
pub fn clean_content(content: &str) -> String {
    content.replace('\0', "\u{FFFD}")
}

/// Stable content identifier: md5 hex digest over the cleaned content bytes.
///
/// 128 bits is dedup-grade, not cryptographic — two documents with identical
/// cleaned content always hash to the same identifier, which is the
/// idempotency key for `doc_exists` and the default row id.
pub fn content_hash(content: &str) -> String {
    format!("{:x}", md5::compute(clean_content(content).as_bytes()))
}

/// A unit of retrievable content: text plus metadata and an optional
/// embedding vector.
///
/// Documents are transient — constructed by the caller on the way in, or
/// decoded from a stored row on the way out of a search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    /// Caller-supplied stable identifier. When absent the content hash is
    /// used as the row id.
    #[serde(default)]
    pub id: Option<String>,
    /// Display label, not unique.
    pub name: String,
    /// Raw text content.
    pub content: String,
    /// Arbitrary key-value metadata, opaque to the store.
    #[serde(default)]
    pub meta_data: HashMap<String, Value>,
    /// Embedding-call accounting (token counts etc.), opaque to the store.
    #[serde(default)]
    pub usage: HashMap<String, Value>,
    /// Embedding vector; absent until the write path embeds the document.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl Document {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta_data.insert(key.into(), value);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Effective row identifier: the explicit id when set, the content hash
    /// otherwise.
    pub fn effective_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| content_hash(&self.content))
    }

    /// Content hash of this document's (cleaned) content.
    pub fn content_hash(&self) -> String {
        content_hash(&self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let a = content_hash("The quick brown fox");
        let b = content_hash("The quick brown fox");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32); // md5 hex
    }

    #[test]
    fn test_hash_ignores_nul_bytes() {
        // NULs are replaced before hashing, so a NUL and the replacement
        // character hash identically.
        let with_nul = content_hash("The\x00 quick brown fox");
        let with_replacement = content_hash("The\u{FFFD} quick brown fox");
        assert_eq!(with_nul, with_replacement);
        assert_ne!(with_nul, content_hash("The quick brown fox"));
    }

    #[test]
    fn test_clean_content_replaces_every_nul() {
        assert_eq!(clean_content("a\x00b\x00c"), "a\u{FFFD}b\u{FFFD}c");
        assert_eq!(clean_content("no nulls"), "no nulls");
    }

    #[test]
    fn test_effective_id_prefers_explicit_id() {
        let doc = Document::new("note", "hello").with_id("note-1");
        assert_eq!(doc.effective_id(), "note-1");

        let anon = Document::new("note", "hello");
        assert_eq!(anon.effective_id(), content_hash("hello"));
    }
}
