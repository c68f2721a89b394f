//! Retry, timeout and concurrency settings of the pipeline

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use video_search_common::{Modality, Stage};

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Exponential backoff retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per stage, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: env_or("PIPELINE_MAX_ATTEMPTS", 3).max(1),
            initial_backoff: Duration::from_millis(env_or("PIPELINE_INITIAL_BACKOFF_MS", 500)),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(env_or("PIPELINE_MAX_BACKOFF_MS", 30_000)),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Maximum duration of each stage attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    pub segmenting: Duration,
    pub embedding: Duration,
    pub indexing: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            segmenting: Duration::from_secs(env_or("PIPELINE_SEGMENTING_TIMEOUT_SECS", 300)),
            embedding: Duration::from_secs(env_or("PIPELINE_EMBEDDING_TIMEOUT_SECS", 900)),
            indexing: Duration::from_secs(env_or("PIPELINE_INDEXING_TIMEOUT_SECS", 120)),
        }
    }
}

impl StageTimeouts {
    #[must_use]
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Segmenting => self.segmenting,
            Stage::Embedding => self.embedding,
            Stage::Indexing => self.indexing,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub timeouts: StageTimeouts,

    /// Interval between polls of a started embedding job
    pub poll_interval: Duration,

    /// Capacity of each run's event stream
    pub event_buffer: usize,

    /// Modalities every segment must be embedded in
    pub required_modalities: Vec<Modality>,

    /// Embedding jobs in flight per run
    pub embedding_concurrency: usize,

    /// Expected embedding dimension, unchecked when `None`
    pub expected_dim: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let modalities = std::env::var("PIPELINE_MODALITIES")
            .ok()
            .map(|v| v.split(',').filter_map(Modality::parse).collect::<Vec<_>>())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| Modality::ALL.to_vec());

        Self {
            retry: RetryPolicy::default(),
            timeouts: StageTimeouts::default(),
            poll_interval: Duration::from_millis(env_or("PIPELINE_POLL_INTERVAL_MS", 1000)),
            event_buffer: env_or("PIPELINE_EVENT_BUFFER", 32).max(1),
            required_modalities: modalities,
            embedding_concurrency: env_or("PIPELINE_EMBEDDING_CONCURRENCY", 8).max(1),
            expected_dim: Some(env_or("PIPELINE_EXPECTED_DIM", 1024)),
        }
    }
}
