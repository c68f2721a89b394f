//! HTTP capability clients against a mock segmentation/embedding service

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use video_search_api_server::{HttpEmbedder, HttpQueryEncoder, HttpSegmenter};
use video_search_common::{Modality, WorkerOutcome};
use video_search_hybrid::{QueryEncoder, QueryInput, SearchError};
use video_search_orchestrator::{EmbedPoll, EmbedRequest, Embedder, Segmenter};

#[derive(Clone, Default)]
struct Mock {
    polls: Arc<AtomicUsize>,
}

async fn segment(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    match body["video_uri"].as_str() {
        Some("s3://u/ok.mp4") => (
            StatusCode::OK,
            Json(json!({"segments": [
                {"start": 0.0, "end": 4.0, "summary": "opening shot"},
                {"start": 4.0, "end": 9.5}
            ]})),
        ),
        Some("s3://u/codec.mp4") => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "unsupported codec"})),
        ),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "overloaded"})),
        ),
    }
}

async fn start_task(Json(body): Json<Value>) -> Json<Value> {
    let modality = body["modality"].as_str().unwrap_or_default();
    let index = body["segment_index"].as_u64().unwrap_or_default();
    Json(json!({"handle": format!("{modality}-{index}")}))
}

async fn task_status(State(mock): State<Mock>, Path(handle): Path<String>) -> Json<Value> {
    if handle.starts_with("audio") {
        return Json(json!({"status": "failed", "error": "silent track", "retryable": false}));
    }
    // First poll of every task is still running
    if mock.polls.fetch_add(1, Ordering::SeqCst) == 0 {
        return Json(json!({"status": "pending"}));
    }
    Json(json!({"status": "ready", "vector": [0.25, 0.5, 0.25], "model_version": "mm-2"}))
}

async fn encode_query(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body.get("image_base64").is_some() && body["modality"] == "audio" {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "no audio for images"})));
    }
    (StatusCode::OK, Json(json!({"vector": [1.0, 0.0, 0.0], "model_version": "mm-2"})))
}

async fn mock_service() -> (String, Mock) {
    let mock = Mock::default();
    let app = Router::new()
        .route("/segment", post(segment))
        .route("/tasks", post(start_task))
        .route("/tasks/{handle}", get(task_status))
        .route("/query", post(encode_query))
        .with_state(mock.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), mock)
}

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_segmenter_outcomes() {
    let (base, _) = mock_service().await;
    let segmenter = HttpSegmenter::new(format!("{base}/segment"), TIMEOUT).unwrap();

    match segmenter.segment("s3://u/ok.mp4", "run-1").await {
        WorkerOutcome::Success(segments) => {
            assert_eq!(segments.len(), 2);
            assert_eq!(segments[0].summary.as_deref(), Some("opening shot"));
            assert_eq!(segments[1].summary, None);
            assert_eq!(segments[1].end, 9.5);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert!(matches!(
        segmenter.segment("s3://u/codec.mp4", "run-1").await,
        WorkerOutcome::PermanentFailure(reason) if reason.contains("unsupported codec")
    ));
    assert!(matches!(
        segmenter.segment("s3://u/busy.mp4", "run-1").await,
        WorkerOutcome::TransientFailure(_)
    ));
}

#[tokio::test]
async fn test_unreachable_service_is_transient() {
    let segmenter = HttpSegmenter::new("http://127.0.0.1:9/segment", TIMEOUT).unwrap();
    assert!(matches!(
        segmenter.segment("s3://u/ok.mp4", "run-1").await,
        WorkerOutcome::TransientFailure(_)
    ));
}

#[tokio::test]
async fn test_embedder_start_and_poll() {
    let (base, mock) = mock_service().await;
    let embedder = HttpEmbedder::new(format!("{base}/"), TIMEOUT).unwrap();

    let request = EmbedRequest {
        video_id: "v".to_string(),
        segment_index: 3,
        media_ref: "s3://u/ok.mp4#t=0.000,4.000".to_string(),
        modality: Modality::Visual,
    };
    let handle = match embedder.start(&request).await {
        WorkerOutcome::Success(handle) => handle,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(handle.0, "visual-3");

    assert_eq!(embedder.poll(&handle).await, EmbedPoll::Pending);
    match embedder.poll(&handle).await {
        EmbedPoll::Ready(WorkerOutcome::Success(output)) => {
            assert_eq!(output.vector, vec![0.25, 0.5, 0.25]);
            assert_eq!(output.model_version, "mm-2");
        }
        other => panic!("unexpected poll: {other:?}"),
    }
    assert_eq!(mock.polls.load(Ordering::SeqCst), 2);

    let audio = EmbedRequest {
        modality: Modality::Audio,
        ..request
    };
    let WorkerOutcome::Success(handle) = embedder.start(&audio).await else {
        panic!("audio start failed");
    };
    assert!(matches!(
        embedder.poll(&handle).await,
        EmbedPoll::Ready(WorkerOutcome::PermanentFailure(reason)) if reason == "silent track"
    ));
}

#[tokio::test]
async fn test_query_encoder() {
    let (base, _) = mock_service().await;
    let encoder = HttpQueryEncoder::new(base, TIMEOUT).unwrap();

    let vector = encoder
        .encode(QueryInput::Text("person walking"), Modality::Audio)
        .await
        .unwrap();
    assert_eq!(vector, vec![1.0, 0.0, 0.0]);

    let vector = encoder
        .encode(QueryInput::Image(&[1, 2, 3]), Modality::Visual)
        .await
        .unwrap();
    assert_eq!(vector.len(), 3);

    assert!(matches!(
        encoder
            .encode(QueryInput::Image(&[1, 2, 3]), Modality::Audio)
            .await,
        Err(SearchError::Encoder(_))
    ));
}
