//! HTTP clients for the segmentation and embedding services
//!
//! Failures are classified the same way for every call: network errors,
//! `429` and `5xx` responses are transient, other `4xx` responses and
//! undecodable bodies are permanent.

use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use video_search_common::{Modality, WorkerOutcome};
use video_search_hybrid::{QueryEncoder, QueryInput, SearchError};
use video_search_orchestrator::{
    EmbedHandle, EmbedPoll, EmbedRequest, Embedder, EmbeddingOutput, SegmentBounds, Segmenter,
};

fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder().timeout(timeout).build()
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Send a request and decode its JSON body into a worker outcome
async fn call<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> WorkerOutcome<T> {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => return WorkerOutcome::TransientFailure(format!("request failed: {e}")),
    };
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let reason = format!("{status}: {body}");
        return if is_transient(status) {
            WorkerOutcome::TransientFailure(reason)
        } else {
            WorkerOutcome::PermanentFailure(reason)
        };
    }
    match response.json::<T>().await {
        Ok(value) => WorkerOutcome::Success(value),
        Err(e) => WorkerOutcome::PermanentFailure(format!("invalid response body: {e}")),
    }
}

#[derive(Debug, Serialize)]
struct SegmentRequest<'a> {
    video_uri: &'a str,
    run_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct SegmentResponse {
    segments: Vec<SegmentBounds>,
}

/// Segmentation service client
#[derive(Clone)]
pub struct HttpSegmenter {
    client: Client,
    url: String,
}

impl HttpSegmenter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl Segmenter for HttpSegmenter {
    async fn segment(&self, video_uri: &str, run_id: &str) -> WorkerOutcome<Vec<SegmentBounds>> {
        debug!("Requesting segmentation of {}", video_uri);
        let request = self
            .client
            .post(&self.url)
            .json(&SegmentRequest { video_uri, run_id });
        call::<SegmentResponse>(request)
            .await
            .map(|response| response.segments)
    }
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    handle: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaskState {
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    status: TaskState,
    vector: Option<Vec<f32>>,
    model_version: Option<String>,
    error: Option<String>,
    #[serde(default)]
    retryable: bool,
}

impl TaskResponse {
    fn into_poll(self) -> EmbedPoll {
        match self.status {
            TaskState::Pending => EmbedPoll::Pending,
            TaskState::Ready => match self.vector {
                Some(vector) => EmbedPoll::Ready(WorkerOutcome::Success(EmbeddingOutput {
                    vector,
                    model_version: self.model_version.unwrap_or_else(|| "unknown".to_string()),
                })),
                None => EmbedPoll::Ready(WorkerOutcome::PermanentFailure(
                    "ready task carries no vector".to_string(),
                )),
            },
            TaskState::Failed => {
                let reason = self.error.unwrap_or_else(|| "embedding task failed".to_string());
                EmbedPoll::Ready(if self.retryable {
                    WorkerOutcome::TransientFailure(reason)
                } else {
                    WorkerOutcome::PermanentFailure(reason)
                })
            }
        }
    }
}

/// Embedding service client: `POST /tasks` then `GET /tasks/{handle}`
#[derive(Clone)]
pub struct HttpEmbedder {
    client: Client,
    base_url: String,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Embedder for HttpEmbedder {
    async fn start(&self, request: &EmbedRequest) -> WorkerOutcome<EmbedHandle> {
        let url = format!("{}/tasks", self.base_url);
        call::<StartResponse>(self.client.post(url).json(request))
            .await
            .map(|response| EmbedHandle(response.handle))
    }

    async fn poll(&self, handle: &EmbedHandle) -> EmbedPoll {
        let url = format!("{}/tasks/{}", self.base_url, handle.0);
        match call::<TaskResponse>(self.client.get(url)).await {
            WorkerOutcome::Success(task) => task.into_poll(),
            WorkerOutcome::TransientFailure(reason) => {
                warn!("Polling embedding task {} failed: {}", handle.0, reason);
                EmbedPoll::Ready(WorkerOutcome::TransientFailure(reason))
            }
            WorkerOutcome::PermanentFailure(reason) => {
                EmbedPoll::Ready(WorkerOutcome::PermanentFailure(reason))
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_base64: Option<String>,
    modality: Modality,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    vector: Vec<f32>,
}

/// Query encoder backed by the embedding service's `POST /query`
#[derive(Clone)]
pub struct HttpQueryEncoder {
    client: Client,
    base_url: String,
}

impl HttpQueryEncoder {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl QueryEncoder for HttpQueryEncoder {
    async fn encode(
        &self,
        input: QueryInput<'_>,
        modality: Modality,
    ) -> video_search_hybrid::Result<Vec<f32>> {
        let body = match input {
            QueryInput::Text(text) => QueryRequest {
                text: Some(text),
                image_base64: None,
                modality,
            },
            QueryInput::Image(bytes) => QueryRequest {
                text: None,
                image_base64: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
                modality,
            },
        };
        let url = format!("{}/query", self.base_url);
        call::<QueryResponse>(self.client.post(url).json(&body))
            .await
            .map(|response| response.vector)
            .into_result()
            .map_err(|e| SearchError::Encoder(e.to_string()))
    }
}
