//! # Fathom Core
//!
//! Shared contracts for the Fathom vector-store layer.
//!
//! The `fathom-vectordb` backends all speak the same small vocabulary:
//! a [`Document`] is the caller-facing unit of retrievable content, an
//! [`Embedder`] turns its text into a fixed-dimension vector, a
//! [`Distance`] metric decides how query vectors are ranked against
//! stored ones, and [`content_hash`] gives every document a stable
//! identity for dedup and idempotent writes.

pub mod config;
pub mod distance;
pub mod document;
pub mod embedder;
pub mod error;

pub use config::VectorStoreConfig;
pub use distance::Distance;
pub use document::{Document, clean_content, content_hash};
pub use embedder::Embedder;
pub use error::{FathomError, Result};
