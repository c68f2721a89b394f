//! API request and response types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use video_search_common::{IngestTrigger, ModalitySelector, RunState};
use video_search_hybrid::SearchResult;
use video_search_storage::VideoSummary;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Upload notification from object storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub object_reference: String,
    pub size: u64,
    /// Upload time, defaults to the time of the request
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<IngestRequest> for IngestTrigger {
    fn from(request: IngestRequest) -> Self {
        IngestTrigger {
            object_reference: request.object_reference,
            size: request.size,
            timestamp: request.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub video_id: String,
    pub run_id: String,
    pub status: RunState,
}

/// Result of a cancellation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub video_id: String,
    pub run_id: String,
    pub status: RunState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoListResponse {
    pub videos: Vec<VideoSummary>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub video_id: String,
    pub deleted: usize,
}

/// New summary text for one indexed segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub video_id: String,
    pub start: f64,
    pub summary: String,
}

/// Search request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub text: Option<String>,
    /// Base64-encoded query image
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub modality: ModalitySelector,
    /// Number of results to return
    #[serde(default = "default_k")]
    pub k: usize,
}

fn default_k() -> usize {
    10
}

/// Search response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total: usize,
    pub query_time_ms: u64,
}
