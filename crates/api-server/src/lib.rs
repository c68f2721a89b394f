//! REST API server for video ingest and clip search
//!
//! Accepts upload notifications, reports processing status, cancels runs and
//! answers hybrid text/image queries over the indexed clips.

pub mod capabilities;
pub mod config;
mod handlers;
mod types;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use video_search_hybrid::{HybridSearchEngine, QueryEncoder};
use video_search_orchestrator::{Embedder, Orchestrator, Segmenter, StatusService};
use video_search_storage::{IndexStore, Stores};

pub use capabilities::{HttpEmbedder, HttpQueryEncoder, HttpSegmenter};
pub use config::ServiceConfig;
pub use handlers::*;
pub use types::*;

/// API server state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub status: StatusService,
    pub search: Arc<HybridSearchEngine>,
    pub index: Arc<dyn IndexStore>,
}

impl ApiState {
    /// Wire the pipeline and search engine over `stores`
    #[must_use]
    pub fn new(
        stores: Stores,
        segmenter: Arc<dyn Segmenter>,
        embedder: Arc<dyn Embedder>,
        encoder: Arc<dyn QueryEncoder>,
        config: &ServiceConfig,
    ) -> Self {
        let index = Arc::clone(&stores.index);
        let orchestrator = Orchestrator::new(stores, segmenter, embedder, config.pipeline.clone());
        let search = HybridSearchEngine::new(Arc::clone(&index), encoder, config.fusion.clone());
        Self {
            status: orchestrator.status_service(),
            orchestrator: Arc::new(orchestrator),
            search: Arc::new(search),
            index,
        }
    }

    /// Connect storage and the HTTP capability clients described by `config`
    ///
    /// Runs left active by a previous process are resumed before returning.
    pub async fn from_config(config: &ServiceConfig) -> anyhow::Result<Self> {
        let stores = video_search_storage::connect(&config.storage).await?;
        let segmenter = HttpSegmenter::new(&config.segmenter_url, config.request_timeout)?;
        let embedder = HttpEmbedder::new(&config.embedder_url, config.request_timeout)?;
        let encoder = HttpQueryEncoder::new(&config.embedder_url, config.request_timeout)?;
        let state = Self::new(
            stores,
            Arc::new(segmenter),
            Arc::new(embedder),
            Arc::new(encoder),
            config,
        );
        state.orchestrator.recover().await?;
        Ok(state)
    }
}

/// Build the API router with all endpoints
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Pipeline
        .route("/api/v1/ingest", post(ingest))
        .route("/api/v1/videos", get(list_videos))
        .route("/api/v1/videos/{video_id}", delete(handlers::delete_video))
        .route("/api/v1/videos/{video_id}/status", get(video_status))
        .route("/api/v1/videos/{video_id}/cancel", post(cancel_run))
        .route(
            "/api/v1/videos/{video_id}/segments/{start}/summary",
            put(update_summary),
        )
        // Search
        .route("/api/v1/search", post(handlers::search))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the API server
pub async fn start_server(addr: &str, state: ApiState) -> Result<(), std::io::Error> {
    tracing::info!("Starting API server on {}", addr);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await
}
