//! Fathom error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FathomError>;

#[derive(Debug, Error)]
pub enum FathomError {
    /// Bad or missing configuration. Raised at construction time, before
    /// any table operation runs.
    #[error("config error: {0}")]
    Config(String),

    /// The embedding provider failed to produce a vector.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Backend engine or statement failure.
    #[error("store error: {0}")]
    Store(String),

    /// Operation not implemented by this backend.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
