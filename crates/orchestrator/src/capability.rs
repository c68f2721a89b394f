//! Contracts of the external segmentation and embedding capabilities

use serde::{Deserialize, Serialize};
use video_search_common::{Modality, WorkerOutcome};

/// Time bounds of one segment as reported by the segmenter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentBounds {
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Splits a video into time-bounded segments
#[async_trait::async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(&self, video_uri: &str, run_id: &str) -> WorkerOutcome<Vec<SegmentBounds>>;
}

/// One embedding job: a segment in one modality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedRequest {
    pub video_id: String,
    pub segment_index: usize,
    /// Media fragment of the segment, e.g. `s3://bucket/v.mp4#t=0.000,6.000`
    pub media_ref: String,
    pub modality: Modality,
}

/// Opaque reference to a started embedding job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbedHandle(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingOutput {
    pub vector: Vec<f32>,
    pub model_version: String,
}

/// State of a started embedding job
#[derive(Debug, Clone, PartialEq)]
pub enum EmbedPoll {
    Pending,
    Ready(WorkerOutcome<EmbeddingOutput>),
}

/// Long-running embedding capability, started then polled until ready
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn start(&self, request: &EmbedRequest) -> WorkerOutcome<EmbedHandle>;

    async fn poll(&self, handle: &EmbedHandle) -> EmbedPoll;
}
