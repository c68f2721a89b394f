//! Hybrid search over the video segment index
//!
//! A query is embedded into the visual and/or audio spaces, matched against
//! the index by vector similarity and, when it carries text, by keyword
//! relevance. Both candidate lists are normalized and fused into a single
//! deterministic ranking.

use thiserror::Error;
use video_search_storage::StorageError;

pub mod encoder;
pub mod engine;
pub mod fusion;
pub mod query;

pub use encoder::{QueryEncoder, QueryInput};
pub use engine::{HybridSearchEngine, SearchResult};
pub use fusion::{fuse, normalize, Fused, FusionConfig, Normalization};
pub use query::SearchQuery;

/// Search errors
///
/// Errors fail only the query that raised them.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Invalid query: {0}")]
    Validation(String),

    #[error("Query encoding failed: {0}")]
    Encoder(String),

    #[error("Index error: {0}")]
    Index(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, SearchError>;
