//! Service configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use video_search_hybrid::FusionConfig;
use video_search_orchestrator::PipelineConfig;
use video_search_storage::StorageConfig;

/// Everything the API server binary needs to start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Listen address
    pub bind_addr: String,
    /// Segmentation service endpoint
    pub segmenter_url: String,
    /// Base URL of the embedding service
    pub embedder_url: String,
    /// Timeout of a single capability HTTP request
    pub request_timeout: Duration,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: std::env::var("API_SERVER_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            segmenter_url: std::env::var("SEGMENTER_URL")
                .unwrap_or_else(|_| "http://localhost:8081/segment".to_string()),
            embedder_url: std::env::var("EMBEDDER_URL")
                .unwrap_or_else(|_| "http://localhost:8082".to_string()),
            request_timeout: Duration::from_secs(
                std::env::var("CAPABILITY_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            fusion: FusionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoints() {
        let config = ServiceConfig::default();
        assert!(!config.bind_addr.is_empty());
        assert!(config.segmenter_url.starts_with("http"));
        assert!(config.embedder_url.starts_with("http"));
        assert!(config.request_timeout > Duration::ZERO);
    }
}
