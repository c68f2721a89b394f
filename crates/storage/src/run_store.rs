//! Run store trait and the process-local implementation

use crate::{StorageError, StorageResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use video_search_common::{PipelineRun, VideoAsset};

/// Authoritative store of video assets and their pipeline runs
///
/// Every run update is a compare-and-swap on the run's `version`. The asset
/// status follows the latest run.
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Register (or refresh) the asset and insert a new run for it
    ///
    /// Fails with `ActiveRunExists` while the asset has a non-terminal run.
    async fn create_run(&self, asset: VideoAsset, run: PipelineRun) -> StorageResult<PipelineRun>;

    async fn get_run(&self, run_id: &str) -> StorageResult<PipelineRun>;

    /// Most recently created run of a video
    async fn latest_run_for_video(&self, video_id: &str) -> StorageResult<Option<PipelineRun>>;

    /// Persist `run` if the stored version still equals `run.version`
    ///
    /// Returns the stored record with its version incremented, or
    /// `VersionConflict` when another writer got there first.
    async fn compare_and_swap(&self, run: PipelineRun) -> StorageResult<PipelineRun>;

    async fn get_asset(&self, video_id: &str) -> StorageResult<VideoAsset>;

    async fn list_assets(&self) -> StorageResult<Vec<VideoAsset>>;

    /// Every run not yet `Completed` or `Failed`, ordered by run id
    async fn active_runs(&self) -> StorageResult<Vec<PipelineRun>>;
}

struct VideoRecord {
    asset: VideoAsset,
    runs: HashMap<String, PipelineRun>,
    active_run: Option<String>,
}

/// In-memory run store
///
/// Each video has its own lock, so updates to runs of different videos never
/// contend.
#[derive(Default)]
pub struct InMemoryRunStore {
    videos: RwLock<HashMap<String, Arc<Mutex<VideoRecord>>>>,
    run_index: RwLock<HashMap<String, String>>,
}

impl InMemoryRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn record(&self, video_id: &str) -> StorageResult<Arc<Mutex<VideoRecord>>> {
        self.videos
            .read()
            .await
            .get(video_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(video_id.to_string()))
    }
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, asset: VideoAsset, run: PipelineRun) -> StorageResult<PipelineRun> {
        let record = {
            let mut videos = self.videos.write().await;
            videos
                .entry(asset.id.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(VideoRecord {
                        asset: asset.clone(),
                        runs: HashMap::new(),
                        active_run: None,
                    }))
                })
                .clone()
        };

        let mut record = record.lock().await;
        if record.active_run.is_some() {
            return Err(StorageError::ActiveRunExists(asset.id));
        }
        record.asset = VideoAsset {
            status: run.state,
            latest_run_id: Some(run.id.clone()),
            ..asset
        };
        record.active_run = run.is_active().then(|| run.id.clone());
        record.runs.insert(run.id.clone(), run.clone());
        drop(record);

        self.run_index
            .write()
            .await
            .insert(run.id.clone(), run.video_id.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> StorageResult<PipelineRun> {
        let video_id = self
            .run_index
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(run_id.to_string()))?;
        let record = self.record(&video_id).await?;
        let record = record.lock().await;
        record
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(run_id.to_string()))
    }

    async fn latest_run_for_video(&self, video_id: &str) -> StorageResult<Option<PipelineRun>> {
        let Ok(record) = self.record(video_id).await else {
            return Ok(None);
        };
        let record = record.lock().await;
        Ok(record
            .asset
            .latest_run_id
            .as_ref()
            .and_then(|id| record.runs.get(id))
            .cloned())
    }

    async fn compare_and_swap(&self, mut run: PipelineRun) -> StorageResult<PipelineRun> {
        let record = self.record(&run.video_id).await?;
        let mut record = record.lock().await;
        let stored = record
            .runs
            .get(&run.id)
            .ok_or_else(|| StorageError::NotFound(run.id.clone()))?;
        if stored.version != run.version {
            return Err(StorageError::VersionConflict {
                run_id: run.id,
                expected: run.version,
                actual: stored.version,
            });
        }

        run.version += 1;
        if record.asset.latest_run_id.as_deref() == Some(run.id.as_str()) {
            record.asset.status = run.state;
        }
        if !run.is_active() && record.active_run.as_deref() == Some(run.id.as_str()) {
            record.active_run = None;
        }
        record.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get_asset(&self, video_id: &str) -> StorageResult<VideoAsset> {
        let record = self.record(video_id).await?;
        let record = record.lock().await;
        Ok(record.asset.clone())
    }

    async fn list_assets(&self) -> StorageResult<Vec<VideoAsset>> {
        let records: Vec<_> = self.videos.read().await.values().cloned().collect();
        let mut assets = Vec::with_capacity(records.len());
        for record in records {
            assets.push(record.lock().await.asset.clone());
        }
        assets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(assets)
    }

    async fn active_runs(&self) -> StorageResult<Vec<PipelineRun>> {
        let records: Vec<_> = self.videos.read().await.values().cloned().collect();
        let mut runs = Vec::new();
        for record in records {
            let record = record.lock().await;
            if let Some(run) = record.active_run.as_ref().and_then(|id| record.runs.get(id)) {
                runs.push(run.clone());
            }
        }
        runs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(runs)
    }
}
