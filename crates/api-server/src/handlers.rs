//! API request handlers

use crate::types::{
    CancelResponse, DeleteResponse, HealthResponse, IngestRequest, IngestResponse,
    SearchRequest, SearchResponse, SummaryRequest, SummaryResponse, VideoListResponse,
};
use crate::ApiState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use base64::Engine;
use std::time::Instant;
use tracing::{error, info, warn};
use video_search_common::{PipelineError, SegmentKey};
use video_search_hybrid::{SearchError, SearchQuery};

type ApiError = (StatusCode, String);

fn pipeline_error(e: PipelineError) -> ApiError {
    let status = match &e {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::VideoNotFound(_) | PipelineError::RunNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::ActiveRunExists(_)
        | PipelineError::NoActiveRun(_)
        | PipelineError::VersionConflict { .. } => StatusCode::CONFLICT,
        PipelineError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {}", e);
    }
    (status, e.to_string())
}

fn search_error(e: SearchError) -> ApiError {
    let status = match &e {
        SearchError::Validation(_) => StatusCode::BAD_REQUEST,
        SearchError::Encoder(_) => StatusCode::BAD_GATEWAY,
        SearchError::Index(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    if status.is_server_error() {
        error!("Search failed: {}", e);
    }
    (status, e.to_string())
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Register an uploaded video and start its pipeline run
pub async fn ingest(
    State(state): State<ApiState>,
    Json(request): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    info!("Ingest request for {}", request.object_reference);
    let run = state
        .orchestrator
        .ingest(request.into())
        .await
        .map_err(pipeline_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            video_id: run.video_id,
            run_id: run.id,
            status: run.state,
        }),
    ))
}

/// Processing status of a video's latest run
pub async fn video_status(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state
        .status
        .status(&video_id)
        .await
        .map_err(pipeline_error)?;
    Ok(Json(view))
}

/// Cancel the active run of a video
pub async fn cancel_run(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .orchestrator
        .cancel(&video_id)
        .await
        .map_err(pipeline_error)?;
    Ok(Json(CancelResponse {
        video_id: run.video_id,
        run_id: run.id,
        status: run.state,
        error: run.error,
    }))
}

/// Indexed videos with their clip counts
pub async fn list_videos(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let videos = state
        .index
        .list_videos()
        .await
        .map_err(|e| pipeline_error(e.into()))?;
    Ok(Json(VideoListResponse {
        total: videos.len(),
        videos,
    }))
}

/// Remove a video's clips from the index
pub async fn delete_video(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .orchestrator
        .delete_video(&video_id)
        .await
        .map_err(pipeline_error)?;
    Ok(Json(DeleteResponse { video_id, deleted }))
}

/// Replace the summary text of an indexed segment
///
/// Summaries produced after indexing make the clip findable by keyword; the
/// segment's vectors are left untouched.
pub async fn update_summary(
    State(state): State<ApiState>,
    Path((video_id, start)): Path<(String, f64)>,
    Json(request): Json<SummaryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = request.summary.trim();
    if summary.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "summary must not be empty".to_string()));
    }
    let key = SegmentKey::new(video_id.as_str(), start);
    let updated = state
        .index
        .update_text(&key, summary)
        .await
        .map_err(|e| pipeline_error(e.into()))?;
    if !updated {
        return Err((StatusCode::NOT_FOUND, format!("No indexed segment {key}")));
    }
    info!("Updated summary of segment {}", key);
    Ok(Json(SummaryResponse {
        video_id,
        start,
        summary: summary.to_string(),
    }))
}

/// Hybrid search over indexed clips
pub async fn search(
    State(state): State<ApiState>,
    Json(request): Json<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let started = Instant::now();
    let image = match request.image_base64.as_deref() {
        Some(encoded) => Some(
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| {
                    warn!("Rejecting search image: {}", e);
                    (StatusCode::BAD_REQUEST, format!("Invalid base64 image: {e}"))
                })?,
        ),
        None => None,
    };

    let query = SearchQuery {
        text: request.text,
        image,
        modality: request.modality,
        k: request.k,
    };
    let results = state.search.search(&query).await.map_err(search_error)?;

    Ok(Json(SearchResponse {
        total: results.len(),
        results,
        query_time_ms: started.elapsed().as_millis() as u64,
    }))
}
