//! Pipeline orchestrator for video ingest
//!
//! Drives one run per video asset through
//! `Created → Segmenting → Embedding → Indexing → Completed`, with `Failed`
//! reachable from any non-terminal state. Each run gets its own driver task
//! and bounded event stream; every state change is a compare-and-swap on the
//! run record, so stale, duplicate and late events are discarded instead of
//! applied.

pub mod capability;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod index_writer;
pub mod status;

pub use capability::{
    EmbedHandle, EmbedPoll, EmbedRequest, Embedder, EmbeddingOutput, SegmentBounds, Segmenter,
};
pub use config::{PipelineConfig, RetryPolicy, StageTimeouts};
pub use coordinator::{StageCoordinator, StageTask};
pub use events::{
    EmbeddingSet, IdempotencyKey, StageEvent, StageOutcome, StagePayload, Transition,
};
pub use index_writer::{IndexReport, IndexWriter};
pub use status::{StatusService, StatusView};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use video_search_common::{
    AttemptOutcome, IngestTrigger, PipelineError, PipelineRun, Result, RunState, Stage,
    VideoAsset,
};
use video_search_storage::{IndexStore, RunStore, StorageError, Stores};

/// Concurrent writers a single update retries against before giving up
const MAX_CAS_RETRIES: usize = 8;

/// Handles of a run whose driver is alive
struct ActiveRun {
    cancel: watch::Sender<bool>,
    state: watch::Sender<RunState>,
}

enum Decision {
    Discard,
    Advance(Stage),
    Retry(Duration),
    Complete,
    Fail,
}

/// Pipeline orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    runs: Arc<dyn RunStore>,
    index: Arc<dyn IndexStore>,
    coordinator: Arc<StageCoordinator>,
    config: PipelineConfig,
    active: Arc<RwLock<HashMap<String, ActiveRun>>>,
}

impl Orchestrator {
    /// Create an orchestrator over the given stores and capabilities
    #[must_use]
    pub fn new(
        stores: Stores,
        segmenter: Arc<dyn Segmenter>,
        embedder: Arc<dyn Embedder>,
        config: PipelineConfig,
    ) -> Self {
        let writer = IndexWriter::new(Arc::clone(&stores.index));
        let coordinator = Arc::new(StageCoordinator::new(
            segmenter,
            embedder,
            writer,
            config.clone(),
        ));
        Self {
            runs: stores.runs,
            index: stores.index,
            coordinator,
            config,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn coordinator(&self) -> Arc<StageCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Status projection backed by this orchestrator's run store
    #[must_use]
    pub fn status_service(&self) -> StatusService {
        StatusService::new(Arc::clone(&self.runs)).with_coordinator(Arc::clone(&self.coordinator))
    }

    /// Register an uploaded video and start processing it
    ///
    /// A trigger for an asset that already has an active run is rejected with
    /// `ActiveRunExists`; once the previous run is terminal a new run
    /// re-processes the video.
    pub async fn ingest(&self, trigger: IngestTrigger) -> Result<PipelineRun> {
        trigger.validate()?;
        let asset = VideoAsset::from_trigger(&trigger);
        let run = PipelineRun::new(Uuid::new_v4().to_string(), &asset);
        let run = self.runs.create_run(asset, run).await?;
        info!(
            "Created run {} for video {} ({})",
            run.id, run.video_id, run.video_uri
        );

        self.spawn_driver(&run).await;
        Ok(run)
    }

    /// Restart drivers for runs a previous process left active
    ///
    /// Each run picks up at its recorded stage and attempt; a pending retry is
    /// started right away. Embeddings live only in the process that produced
    /// them, so a run interrupted while indexing is failed and the video can
    /// be ingested again. Returns the ids of the runs taken over.
    pub async fn recover(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for run in self.runs.active_runs().await? {
            if self.spawn_driver(&run).await {
                info!(
                    "Recovering run {} of video {} in {} (attempt {})",
                    run.id, run.video_id, run.state, run.attempt
                );
                recovered.push(run.id);
            }
        }
        if !recovered.is_empty() {
            info!("Recovered {} active runs", recovered.len());
        }
        Ok(recovered)
    }

    /// Start the driver task of `run` unless one is already running
    async fn spawn_driver(&self, run: &PipelineRun) -> bool {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut active = self.active.write().await;
            if active.contains_key(&run.id) {
                return false;
            }
            let (state_tx, _) = watch::channel(run.state);
            active.insert(
                run.id.clone(),
                ActiveRun {
                    cancel: cancel_tx,
                    state: state_tx,
                },
            );
        }

        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let driver = self.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            driver.drive(run_id, events_tx, events_rx, cancel_rx).await;
        });
        true
    }

    /// Fail the active run of `video_id` immediately and stop its work
    pub async fn cancel(&self, video_id: &str) -> Result<PipelineRun> {
        let run = self
            .runs
            .latest_run_for_video(video_id)
            .await?
            .ok_or_else(|| PipelineError::VideoNotFound(video_id.to_string()))?;
        if !run.is_active() {
            return Err(PipelineError::NoActiveRun(video_id.to_string()));
        }

        let cancelled = self
            .update(&run.id, |run| {
                if !run.is_active() {
                    return Ok(false);
                }
                run.fail("cancelled", AttemptOutcome::Cancelled)?;
                Ok(true)
            })
            .await?
            .ok_or_else(|| PipelineError::NoActiveRun(video_id.to_string()))?;

        if let Some(active) = self.active.read().await.get(&cancelled.id) {
            active.cancel.send_replace(true);
        }
        warn!("Cancelled run {} of video {}", cancelled.id, video_id);
        Ok(cancelled)
    }

    pub async fn run(&self, run_id: &str) -> Result<PipelineRun> {
        Ok(self.runs.get_run(run_id).await?)
    }

    pub async fn latest_run(&self, video_id: &str) -> Result<PipelineRun> {
        self.runs
            .latest_run_for_video(video_id)
            .await?
            .ok_or_else(|| PipelineError::VideoNotFound(video_id.to_string()))
    }

    /// Wait until the run reaches `Completed` or `Failed`
    pub async fn wait_for_terminal(&self, run_id: &str, timeout: Duration) -> Result<PipelineRun> {
        let receiver = self
            .active
            .read()
            .await
            .get(run_id)
            .map(|active| active.state.subscribe());
        if let Some(mut receiver) = receiver {
            let waited = tokio::time::timeout(timeout, async move {
                receiver.wait_for(RunState::is_terminal).await.is_ok()
            })
            .await;
            if waited.is_err() {
                return Err(PipelineError::Other(format!(
                    "run {run_id} still active after {timeout:?}"
                )));
            }
        }
        self.run(run_id).await
    }

    /// Remove the index entries of a video that is not being processed
    pub async fn delete_video(&self, video_id: &str) -> Result<usize> {
        if let Some(run) = self.runs.latest_run_for_video(video_id).await? {
            if run.is_active() {
                return Err(PipelineError::ActiveRunExists(video_id.to_string()));
            }
        }
        let removed = self.index.delete_video(video_id).await?;
        info!("Deleted {} index entries of video {}", removed, video_id);
        Ok(removed)
    }

    /// Apply a stage event to its run
    ///
    /// The event only takes effect if the run is still in the event's stage
    /// and attempt; anything else is reported as `Discarded`.
    pub async fn apply_event(&self, event: &StageEvent) -> Result<Transition> {
        let stage = event.key.stage;
        let mut decision = Decision::Discard;

        let updated = self
            .update(&event.key.run_id, |run| {
                decision = Decision::Discard;
                if run.state != stage.state() || run.attempt != event.attempt || run.retrying {
                    return Ok(false);
                }

                let failure = match &event.outcome {
                    StageOutcome::Completed(payload) => match self.accept_payload(run, payload) {
                        Ok(()) => None,
                        Err(e) => {
                            let reason = e.to_string();
                            let retryable = e.is_retryable();
                            let outcome = if retryable {
                                AttemptOutcome::TransientFailure(reason.clone())
                            } else {
                                AttemptOutcome::PermanentFailure(reason.clone())
                            };
                            Some((outcome, reason, retryable))
                        }
                    },
                    StageOutcome::TransientFailure(reason) => Some((
                        AttemptOutcome::TransientFailure(reason.clone()),
                        reason.clone(),
                        true,
                    )),
                    StageOutcome::PermanentFailure(reason) => Some((
                        AttemptOutcome::PermanentFailure(reason.clone()),
                        reason.clone(),
                        false,
                    )),
                    StageOutcome::TimedOut => {
                        let limit = self.config.timeouts.for_stage(stage).as_millis() as u64;
                        Some((
                            AttemptOutcome::TimedOut,
                            PipelineError::Timeout(stage, limit).to_string(),
                            true,
                        ))
                    }
                };

                match failure {
                    None => {
                        run.finish_attempt(AttemptOutcome::Succeeded);
                        match stage.next() {
                            Some(next) => {
                                run.enter_stage(next)?;
                                decision = Decision::Advance(next);
                            }
                            None => {
                                run.complete()?;
                                decision = Decision::Complete;
                            }
                        }
                    }
                    Some((outcome, reason, true)) if run.attempt < self.config.retry.max_attempts => {
                        let failed_attempt = run.attempt;
                        run.finish_attempt(outcome);
                        run.schedule_retry(&reason);
                        decision = Decision::Retry(self.config.retry.backoff(failed_attempt));
                    }
                    Some((outcome, reason, retryable)) => {
                        let reason = if retryable {
                            format!("{stage} failed after {} attempts: {reason}", run.attempt)
                        } else {
                            reason
                        };
                        run.fail(&reason, outcome)?;
                        decision = Decision::Fail;
                    }
                }
                Ok(true)
            })
            .await?;

        let Some(run) = updated else {
            debug!(
                "Discarding stale event for {} attempt {}",
                event.key, event.attempt
            );
            return Ok(Transition::Discarded);
        };

        Ok(match decision {
            Decision::Advance(next) => {
                info!("Run {} advanced to {}", run.id, next);
                Transition::Advanced { run, next }
            }
            Decision::Retry(delay) => {
                warn!(
                    "Run {} will retry {} (attempt {}) in {:?}: {}",
                    run.id,
                    stage,
                    run.attempt,
                    delay,
                    run.error.as_deref().unwrap_or_default()
                );
                Transition::Retry { run, delay }
            }
            Decision::Complete => {
                info!(
                    "Run {} completed with {} indexed segments",
                    run.id, run.indexed_count
                );
                Transition::Completed(run)
            }
            Decision::Fail => {
                error!(
                    "Run {} failed in {}: {}",
                    run.id,
                    stage,
                    run.error.as_deref().unwrap_or_default()
                );
                Transition::Failed(run)
            }
            Decision::Discard => Transition::Discarded,
        })
    }

    /// Record a stage's result on the run, reconciling segment counts
    fn accept_payload(&self, run: &mut PipelineRun, payload: &StagePayload) -> Result<()> {
        match (run.state, payload) {
            (RunState::Segmenting, StagePayload::Segmented(segments)) => {
                if segments.is_empty() {
                    return Err(PipelineError::Permanent(
                        "segmentation produced no segments".to_string(),
                    ));
                }
                run.segments = segments.clone();
                Ok(())
            }
            (RunState::Embedding, StagePayload::Embedded(embeddings)) => {
                let missing = embeddings.missing(&run.segments, &self.config.required_modalities);
                if missing > 0 {
                    return Err(PipelineError::Transient(format!(
                        "{missing} segment modalities have no embedding"
                    )));
                }
                Ok(())
            }
            (RunState::Indexing, StagePayload::Indexed { count }) => {
                run.indexed_count = *count;
                if *count < run.segments.len() {
                    return Err(PipelineError::Transient(format!(
                        "indexed {count} of {} segments",
                        run.segments.len()
                    )));
                }
                Ok(())
            }
            (state, _) => Err(PipelineError::Validation(format!(
                "stage result does not match run state {state}"
            ))),
        }
    }

    /// Load, mutate and compare-and-swap a run, retrying on version conflicts
    ///
    /// `mutate` returns `Ok(false)` when its precondition no longer holds, in
    /// which case nothing is written and `None` is returned.
    async fn update<F>(&self, run_id: &str, mut mutate: F) -> Result<Option<PipelineRun>>
    where
        F: FnMut(&mut PipelineRun) -> Result<bool> + Send,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let mut run = self.runs.get_run(run_id).await?;
            if !mutate(&mut run)? {
                return Ok(None);
            }
            match self.runs.compare_and_swap(run).await {
                Ok(stored) => {
                    if let Some(active) = self.active.read().await.get(&stored.id) {
                        active.state.send_replace(stored.state);
                    }
                    return Ok(Some(stored));
                }
                Err(StorageError::VersionConflict { .. }) => {
                    debug!("Version conflict on run {}, reloading", run_id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(PipelineError::Other(format!(
            "run {run_id} kept changing during update"
        )))
    }

    /// Run state to dispatch from when a driver starts
    ///
    /// A new run enters Segmenting. A recovered run re-dispatches its current
    /// stage and attempt, or begins its pending retry.
    async fn starting_point(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        let run = self.runs.get_run(run_id).await?;
        match run.state {
            RunState::Created => self.enter_first_stage(run_id).await,
            _ if !run.is_active() => Ok(None),
            RunState::Indexing => {
                let reason = "interrupted while indexing; embeddings were lost";
                let failed = self
                    .update(run_id, |run| {
                        if run.state != RunState::Indexing {
                            return Ok(false);
                        }
                        run.fail(reason, AttemptOutcome::PermanentFailure(reason.to_string()))?;
                        Ok(true)
                    })
                    .await?;
                if failed.is_some() {
                    warn!("Run {} {}", run_id, reason);
                }
                Ok(None)
            }
            _ if run.retrying => self.begin_retry(run_id, run.attempt).await,
            _ => Ok(Some(run)),
        }
    }

    async fn enter_first_stage(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        self.update(run_id, |run| {
            if run.state != RunState::Created {
                return Ok(false);
            }
            run.enter_stage(Stage::Segmenting)?;
            Ok(true)
        })
        .await
    }

    async fn begin_retry(&self, run_id: &str, attempt: u32) -> Result<Option<PipelineRun>> {
        self.update(run_id, |run| {
            if !run.retrying || run.attempt != attempt || !run.is_active() {
                return Ok(false);
            }
            run.begin_retry()?;
            Ok(true)
        })
        .await
    }

    fn dispatch(
        &self,
        run: &PipelineRun,
        embeddings: Option<EmbeddingSet>,
        events: &mpsc::Sender<StageEvent>,
        cancel: &watch::Receiver<bool>,
    ) {
        let Some(stage) = run.current_stage() else {
            return;
        };
        let task = StageTask {
            key: IdempotencyKey::new(run.id.clone(), stage),
            attempt: run.attempt,
            video_id: run.video_id.clone(),
            video_uri: run.video_uri.clone(),
            segments: run.segments.clone(),
            embeddings,
        };
        self.coordinator
            .dispatch(task, events.clone(), cancel.clone());
    }

    /// Per-run driver: dispatch stages and apply their events until terminal
    async fn drive(
        self,
        run_id: String,
        events_tx: mpsc::Sender<StageEvent>,
        mut events_rx: mpsc::Receiver<StageEvent>,
        cancel: watch::Receiver<bool>,
    ) {
        if let Err(e) = self
            .drive_stages(&run_id, &events_tx, &mut events_rx, &cancel)
            .await
        {
            error!("Driver of run {} stopped: {}", run_id, e);
            let reason = e.to_string();
            let failed = self
                .update(&run_id, |run| {
                    if !run.is_active() {
                        return Ok(false);
                    }
                    run.fail(&reason, AttemptOutcome::PermanentFailure(reason.clone()))?;
                    Ok(true)
                })
                .await;
            if let Err(e) = failed {
                error!("Could not mark run {} failed: {}", run_id, e);
            }
        }

        self.coordinator.release(&run_id).await;
        self.active.write().await.remove(&run_id);
        debug!("Driver of run {} finished", run_id);
    }

    async fn drive_stages(
        &self,
        run_id: &str,
        events_tx: &mpsc::Sender<StageEvent>,
        events_rx: &mut mpsc::Receiver<StageEvent>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        let Some(run) = self.starting_point(run_id).await? else {
            return Ok(());
        };
        self.dispatch(&run, None, events_tx, cancel);

        let mut embeddings: Option<EmbeddingSet> = None;
        loop {
            let event = tokio::select! {
                () = coordinator::cancelled(cancel.clone()) => return Ok(()),
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };

            match self.apply_event(&event).await? {
                Transition::Advanced { run, next } => {
                    if next == Stage::Indexing {
                        if let StageOutcome::Completed(StagePayload::Embedded(set)) = event.outcome {
                            embeddings = Some(set);
                        }
                    }
                    self.dispatch(&run, embeddings.clone(), events_tx, cancel);
                }
                Transition::Retry { run, delay } => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = coordinator::cancelled(cancel.clone()) => return Ok(()),
                    }
                    match self.begin_retry(&run.id, run.attempt).await? {
                        Some(run) => self.dispatch(&run, embeddings.clone(), events_tx, cancel),
                        None => return Ok(()),
                    }
                }
                Transition::Completed(_) | Transition::Failed(_) => return Ok(()),
                Transition::Discarded => {}
            }
        }
    }
}
