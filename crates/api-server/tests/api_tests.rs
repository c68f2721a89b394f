//! HTTP surface tests
//!
//! The router is driven in-process with in-memory stores and scripted
//! capabilities.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use video_search_api_server::{build_router, ApiState, ServiceConfig};
use video_search_common::{Modality, WorkerOutcome};
use video_search_hybrid::{Normalization, QueryEncoder, QueryInput};
use video_search_orchestrator::{
    EmbedHandle, EmbedPoll, EmbedRequest, Embedder, EmbeddingOutput, SegmentBounds, Segmenter,
};
use video_search_storage::Stores;

struct TwoSegments;

#[async_trait::async_trait]
impl Segmenter for TwoSegments {
    async fn segment(&self, _: &str, _: &str) -> WorkerOutcome<Vec<SegmentBounds>> {
        WorkerOutcome::Success(vec![
            SegmentBounds {
                start: 0.0,
                end: 6.0,
                summary: Some("a person walking in the park".to_string()),
            },
            SegmentBounds {
                start: 6.0,
                end: 12.0,
                summary: Some("a dog chasing a ball".to_string()),
            },
        ])
    }
}

/// Never finishes, keeping runs active
struct StuckSegmenter;

#[async_trait::async_trait]
impl Segmenter for StuckSegmenter {
    async fn segment(&self, _: &str, _: &str) -> WorkerOutcome<Vec<SegmentBounds>> {
        std::future::pending().await
    }
}

struct ReadyEmbedder;

#[async_trait::async_trait]
impl Embedder for ReadyEmbedder {
    async fn start(&self, request: &EmbedRequest) -> WorkerOutcome<EmbedHandle> {
        WorkerOutcome::Success(EmbedHandle(request.segment_index.to_string()))
    }

    async fn poll(&self, handle: &EmbedHandle) -> EmbedPoll {
        let vector = if handle.0 == "0" {
            vec![1.0, 0.0]
        } else {
            vec![0.6, 0.8]
        };
        EmbedPoll::Ready(WorkerOutcome::Success(EmbeddingOutput {
            vector,
            model_version: "test-v1".to_string(),
        }))
    }
}

struct AxisEncoder;

#[async_trait::async_trait]
impl QueryEncoder for AxisEncoder {
    async fn encode(
        &self,
        _: QueryInput<'_>,
        _: Modality,
    ) -> video_search_hybrid::Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }
}

fn config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.pipeline.poll_interval = Duration::from_millis(1);
    config.pipeline.retry.initial_backoff = Duration::from_millis(1);
    config.pipeline.expected_dim = None;
    config.pipeline.required_modalities = Modality::ALL.to_vec();
    config.fusion.normalization = Normalization::MinMax;
    config.fusion.min_similarity = 0.0;
    config
}

fn app(segmenter: Arc<dyn Segmenter>) -> Router {
    let state = ApiState::new(
        Stores::in_memory(),
        segmenter,
        Arc::new(ReadyEmbedder),
        Arc::new(AxisEncoder),
        &config(),
    );
    build_router(state)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()));
    (status, value)
}

/// Poll the status endpoint until the video's run completes
async fn wait_completed(app: &Router, video_id: &str) -> Value {
    let status_uri = format!("/api/v1/videos/{video_id}/status");
    let mut last = Value::Null;
    for _ in 0..500 {
        let (code, body) = send(app, Method::GET, &status_uri, None).await;
        assert_eq!(code, StatusCode::OK);
        last = body;
        if last["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(last["status"], "completed");
    last
}

fn ingest_body(name: &str) -> Value {
    json!({"object_reference": format!("s3://uploads/{name}.mp4"), "size": 2048})
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = app(Arc::new(TwoSegments));
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_ingest_then_search() {
    let app = app(Arc::new(TwoSegments));
    let (status, body) = send(&app, Method::POST, "/api/v1/ingest", Some(ingest_body("park"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let video_id = body["video_id"].as_str().unwrap().to_string();
    assert!(body["run_id"].as_str().is_some());

    let last = wait_completed(&app, &video_id).await;
    assert_eq!(last["progress_pct"], 100);
    assert_eq!(last["indexed_count"], 2);

    let (status, body) = send(&app, Method::GET, "/api/v1/videos", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["videos"][0]["clip_count"], 2);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/search",
        Some(json!({"text": "person walking in park", "k": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // The dog clip shares no query term and is the weakest vector match, which
    // min-max maps to 0, but it is still a match
    assert_eq!(body["total"], 2);
    assert_eq!(body["results"][0]["video_id"], video_id.as_str());
    assert_eq!(body["results"][0]["start"], 0.0);
    assert_eq!(body["results"][0]["clip_text"], "a person walking in the park");
    assert_eq!(body["results"][0]["rank"], 1);
    assert_eq!(body["results"][1]["start"], 6.0);
    assert_eq!(body["results"][1]["rank"], 2);
}

#[tokio::test]
async fn test_summary_update_is_searchable() {
    let app = app(Arc::new(TwoSegments));
    let (_, body) = send(&app, Method::POST, "/api/v1/ingest", Some(ingest_body("yard"))).await;
    let video_id = body["video_id"].as_str().unwrap().to_string();
    wait_completed(&app, &video_id).await;

    let search = json!({"text": "frisbee", "modality": "visual", "k": 5});
    let (_, body) = send(&app, Method::POST, "/api/v1/search", Some(search.clone())).await;
    assert!(body["results"]
        .as_array()
        .unwrap()
        .iter()
        .all(|r| r["clip_text"] != "dog catching a frisbee"));

    let summary_uri = format!("/api/v1/videos/{video_id}/segments/6/summary");
    let (status, body) = send(
        &app,
        Method::PUT,
        &summary_uri,
        Some(json!({"summary": " dog catching a frisbee "})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"], "dog catching a frisbee");

    let (_, body) = send(&app, Method::POST, "/api/v1/search", Some(search)).await;
    let dog = body["results"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["start"] == 6.0)
        .cloned()
        .unwrap();
    assert_eq!(dog["clip_text"], "dog catching a frisbee");
    assert!(dog["lexical_score"].is_number());

    let (status, _) = send(&app, Method::PUT, &summary_uri, Some(json!({"summary": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing_uri = format!("/api/v1/videos/{video_id}/segments/99/summary");
    let (status, _) = send(
        &app,
        Method::PUT,
        &missing_uri,
        Some(json!({"summary": "nothing here"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ingest_validation() {
    let app = app(Arc::new(TwoSegments));
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/ingest",
        Some(json!({"object_reference": "s3://uploads/empty.mp4", "size": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_video_status() {
    let app = app(Arc::new(TwoSegments));
    let (status, _) = send(&app, Method::GET, "/api/v1/videos/missing/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_active_run_conflicts_and_cancel() {
    let app = app(Arc::new(StuckSegmenter));
    let (status, body) = send(&app, Method::POST, "/api/v1/ingest", Some(ingest_body("busy"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let video_id = body["video_id"].as_str().unwrap().to_string();

    let (status, _) = send(&app, Method::POST, "/api/v1/ingest", Some(ingest_body("busy"))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let video_uri = format!("/api/v1/videos/{video_id}");
    let (status, _) = send(&app, Method::DELETE, &video_uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let cancel_uri = format!("/api/v1/videos/{video_id}/cancel");
    let (status, body) = send(&app, Method::POST, &cancel_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "cancelled");

    let (_, body) = send(&app, Method::GET, &format!("{video_uri}/status"), None).await;
    assert_eq!(body["status"], "failed");

    let (status, _) = send(&app, Method::POST, &cancel_uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&app, Method::DELETE, &video_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 0);
}

#[tokio::test]
async fn test_search_rejects_invalid_queries() {
    let app = app(Arc::new(TwoSegments));

    let (status, _) = send(&app, Method::POST, "/api/v1/search", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/search",
        Some(json!({"image_base64": "not base64!!"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/search",
        Some(json!({"image_base64": "AAECAw==", "modality": "audio"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/search",
        Some(json!({"image_base64": "AAECAw==", "modality": "visual"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
}
