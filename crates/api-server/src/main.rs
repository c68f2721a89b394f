//! API Server Binary Entry Point

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use video_search_api_server::{start_server, ApiState, ServiceConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "video_search_api_server=info,video_search_orchestrator=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::default();
    tracing::info!(
        "Using segmenter {} and embedder {}",
        config.segmenter_url,
        config.embedder_url
    );

    let state = ApiState::from_config(&config).await?;

    tracing::info!("Starting Video Clip Search API Server");
    start_server(&config.bind_addr, state).await?;

    Ok(())
}
