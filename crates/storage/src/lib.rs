//! Storage layer for the video clip search system
//!
//! Two stores back the system:
//! - **Index store**: segment entries with per-modality vectors and lexical text,
//!   queried by vector kNN and keyword match (in-memory or Qdrant)
//! - **Run store**: video assets and pipeline run records, updated with
//!   compare-and-swap on a per-run version (in-memory or `PostgreSQL`)
//!
//! # Example
//!
//! ```rust,no_run
//! use video_search_storage::{connect, StorageConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stores = connect(&StorageConfig::default()).await?;
//!     let videos = stores.index.list_videos().await?;
//!     println!("{} videos indexed", videos.len());
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use video_search_common::{IndexEntry, PipelineError, SegmentKey};

pub mod index_store;
pub mod lexical;
pub mod postgres_store;
pub mod qdrant_store;
pub mod run_store;

pub use index_store::{IndexStore, InMemoryIndexStore};
pub use postgres_store::{PostgresConfig, PostgresRunStore};
pub use qdrant_store::{QdrantConfig, QdrantIndexStore, VectorDistance};
pub use run_store::{InMemoryRunStore, RunStore};

/// Storage layer errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Qdrant error: {0}")]
    QdrantError(String),

    #[error("PostgreSQL error: {0}")]
    PostgresError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Video {0} already has an active run")]
    ActiveRunExists(String),

    #[error("Version conflict on run {run_id}: expected {expected}, found {actual}")]
    VersionConflict {
        run_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => PipelineError::RunNotFound(id),
            StorageError::ActiveRunExists(video_id) => PipelineError::ActiveRunExists(video_id),
            StorageError::VersionConflict {
                run_id,
                expected,
                actual,
            } => PipelineError::VersionConflict {
                run_id,
                expected,
                actual,
            },
            other => PipelineError::Storage(other.to_string()),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Per-key acknowledgement of an index upsert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteAck {
    pub key: SegmentKey,
    pub error: Option<String>,
}

impl WriteAck {
    #[must_use]
    pub fn ok(key: SegmentKey) -> Self {
        Self { key, error: None }
    }

    #[must_use]
    pub fn failed(key: SegmentKey, error: impl Into<String>) -> Self {
        Self {
            key,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Index entry returned by a query, with its raw relevance score
///
/// Higher is more relevant for every metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: IndexEntry,
    pub score: f32,
}

/// Indexed video with its clip count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub video_id: String,
    pub video_uri: String,
    pub clip_count: usize,
}

/// Which store implementations to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local stores, state is lost on restart
    #[default]
    Memory,
    /// Qdrant for the index, `PostgreSQL` for runs
    Remote,
}

impl StorageBackend {
    fn from_env() -> Self {
        match std::env::var("VIDEO_SEARCH_STORAGE").as_deref() {
            Ok("remote") => StorageBackend::Remote,
            _ => StorageBackend::Memory,
        }
    }
}

/// Complete storage configuration for all backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageBackend::from_env")]
    pub backend: StorageBackend,

    /// Qdrant configuration for the index store
    #[serde(default)]
    pub qdrant: QdrantConfig,

    /// `PostgreSQL` configuration for the run store
    #[serde(default)]
    pub postgres: PostgresConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::from_env(),
            qdrant: QdrantConfig::default(),
            postgres: PostgresConfig::default(),
        }
    }
}

/// Connected index and run stores
#[derive(Clone)]
pub struct Stores {
    pub index: Arc<dyn IndexStore>,
    pub runs: Arc<dyn RunStore>,
}

impl Stores {
    /// Process-local stores
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            index: Arc::new(InMemoryIndexStore::new()),
            runs: Arc::new(InMemoryRunStore::new()),
        }
    }
}

/// Connect the stores selected by `config` and initialize their schemas
pub async fn connect(config: &StorageConfig) -> StorageResult<Stores> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::info!("Using in-memory index and run stores");
            Ok(Stores::in_memory())
        }
        StorageBackend::Remote => {
            let index = QdrantIndexStore::new(config.qdrant.clone()).await?;
            index.init().await?;
            let runs = PostgresRunStore::new(config.postgres.clone()).await?;
            runs.init_schema().await?;
            tracing::info!(
                "Connected to Qdrant collection {} and PostgreSQL database {}",
                config.qdrant.collection,
                config.postgres.database
            );
            Ok(Stores {
                index: Arc::new(index),
                runs: Arc::new(runs),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_into_pipeline_error() {
        let err: PipelineError = StorageError::ActiveRunExists("vid".into()).into();
        assert!(matches!(err, PipelineError::ActiveRunExists(v) if v == "vid"));

        let err: PipelineError = StorageError::VersionConflict {
            run_id: "r".into(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert!(matches!(err, PipelineError::VersionConflict { actual: 2, .. }));

        let err: PipelineError = StorageError::QdrantError("down".into()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_write_ack() {
        let key = SegmentKey::new("v", 1.0);
        assert!(WriteAck::ok(key.clone()).is_ok());
        assert!(!WriteAck::failed(key, "dimension mismatch").is_ok());
    }

    #[test]
    fn test_storage_config_deserialize_defaults() {
        let config: StorageConfig = serde_json::from_str(r#"{"backend":"remote"}"#).unwrap();
        assert_eq!(config.backend, StorageBackend::Remote);
        assert_eq!(config.postgres.port, PostgresConfig::default().port);
    }

    #[tokio::test]
    async fn test_connect_in_memory() {
        let config = StorageConfig {
            backend: StorageBackend::Memory,
            ..StorageConfig::default()
        };
        let stores = connect(&config).await.unwrap();
        assert_eq!(stores.index.list_videos().await.unwrap().len(), 0);
    }
}
