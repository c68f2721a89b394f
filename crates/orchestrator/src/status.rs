//! Read-only status projection of pipeline runs

use crate::coordinator::StageCoordinator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use video_search_common::{PipelineError, PipelineRun, Result, RunState, Stage};
use video_search_storage::{RunStore, StorageError};

/// Status of a video as reported to pollers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub video_id: String,
    pub run_id: String,
    pub status: RunState,
    pub current_stage: Option<Stage>,
    pub retrying: bool,
    pub attempt: u32,
    pub progress_pct: u8,
    pub error: Option<String>,
    pub segment_count: usize,
    pub indexed_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Start of each stage's share of the progress bar
fn stage_floor(stage: Stage) -> u8 {
    match stage {
        Stage::Segmenting => 5,
        Stage::Embedding => 20,
        Stage::Indexing => 85,
    }
}

/// Progress of a run, using embedding progress while embedding
#[must_use]
pub fn progress_pct(run: &PipelineRun, embedding: Option<(usize, usize)>) -> u8 {
    match run.state {
        RunState::Created => 0,
        RunState::Completed => 100,
        RunState::Embedding => match embedding {
            Some((done, total)) if total > 0 => {
                let share = (done.min(total) * 65 / total) as u8;
                stage_floor(Stage::Embedding) + share
            }
            _ => stage_floor(Stage::Embedding),
        },
        RunState::Segmenting | RunState::Indexing => {
            run.current_stage().map_or(0, stage_floor)
        }
        RunState::Failed => run
            .history
            .last()
            .map_or(0, |execution| stage_floor(execution.stage)),
    }
}

/// Status service
#[derive(Clone)]
pub struct StatusService {
    runs: Arc<dyn RunStore>,
    coordinator: Option<Arc<StageCoordinator>>,
}

impl StatusService {
    #[must_use]
    pub fn new(runs: Arc<dyn RunStore>) -> Self {
        Self {
            runs,
            coordinator: None,
        }
    }

    /// Report embedding progress from the live coordinator
    #[must_use]
    pub fn with_coordinator(mut self, coordinator: Arc<StageCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Status of the latest run of `video_id`
    pub async fn status(&self, video_id: &str) -> Result<StatusView> {
        let run = match self.runs.latest_run_for_video(video_id).await {
            Ok(Some(run)) => run,
            Ok(None) | Err(StorageError::NotFound(_)) => {
                return Err(PipelineError::VideoNotFound(video_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let embedding = match (&self.coordinator, run.state) {
            (Some(coordinator), RunState::Embedding) => {
                coordinator.embedding_progress(&run.id).await
            }
            _ => None,
        };

        Ok(StatusView {
            progress_pct: progress_pct(&run, embedding),
            video_id: run.video_id.clone(),
            run_id: run.id.clone(),
            status: run.state,
            current_stage: run.current_stage(),
            retrying: run.retrying,
            attempt: run.attempt,
            error: run.error.clone(),
            segment_count: run.segments.len(),
            indexed_count: run.indexed_count,
            updated_at: run.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_search_common::{AttemptOutcome, IngestTrigger, VideoAsset};
    use video_search_storage::InMemoryRunStore;

    fn run() -> PipelineRun {
        let asset = VideoAsset::from_trigger(&IngestTrigger {
            object_reference: "s3://u/v.mp4".to_string(),
            size: 1,
            timestamp: Utc::now(),
        });
        PipelineRun::new("run-1", &asset)
    }

    #[test]
    fn test_progress_by_state() {
        let mut run = run();
        assert_eq!(progress_pct(&run, None), 0);

        run.enter_stage(Stage::Segmenting).unwrap();
        assert_eq!(progress_pct(&run, None), 5);

        run.enter_stage(Stage::Embedding).unwrap();
        assert_eq!(progress_pct(&run, None), 20);
        assert_eq!(progress_pct(&run, Some((3, 6))), 52);
        assert_eq!(progress_pct(&run, Some((6, 6))), 85);

        run.fail("cancelled", AttemptOutcome::Cancelled).unwrap();
        assert_eq!(progress_pct(&run, None), 20);
    }

    #[tokio::test]
    async fn test_status_of_unknown_video() {
        let service = StatusService::new(Arc::new(InMemoryRunStore::new()));
        assert!(matches!(
            service.status("nope").await,
            Err(PipelineError::VideoNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_reports_failure_detail() {
        let store = Arc::new(InMemoryRunStore::new());
        let run = run();
        let asset = VideoAsset::from_trigger(&IngestTrigger {
            object_reference: run.video_uri.clone(),
            size: 1,
            timestamp: Utc::now(),
        });
        store.create_run(asset, run).await.unwrap();

        let mut stored = store.get_run("run-1").await.unwrap();
        stored.enter_stage(Stage::Segmenting).unwrap();
        stored
            .fail(
                "unsupported codec",
                AttemptOutcome::PermanentFailure("unsupported codec".into()),
            )
            .unwrap();
        store.compare_and_swap(stored.clone()).await.unwrap();

        let service = StatusService::new(store);
        let view = service.status(&stored.video_id).await.unwrap();
        assert_eq!(view.status, RunState::Failed);
        assert_eq!(view.current_stage, None);
        assert_eq!(view.error.as_deref(), Some("unsupported codec"));
        assert_eq!(view.progress_pct, 5);
    }
}
