//! Stage coordinator
//!
//! Runs one stage attempt against the external capabilities and reports the
//! result as exactly one [`StageEvent`]. Embedding is fanned out per segment
//! and modality; a failed modality is retried on its own and successful
//! results are kept for later attempts of the same run.

use crate::capability::{
    EmbedPoll, EmbedRequest, Embedder, EmbeddingOutput, SegmentBounds, Segmenter,
};
use crate::config::PipelineConfig;
use crate::events::{EmbeddingSet, IdempotencyKey, StageEvent, StageOutcome, StagePayload};
use crate::index_writer::IndexWriter;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use video_search_common::{
    validate_vector, Embedding, Modality, PipelineError, Result, Segment, Stage, WorkerOutcome,
};

/// Everything needed to run one attempt of one stage
#[derive(Debug, Clone)]
pub struct StageTask {
    pub key: IdempotencyKey,
    pub attempt: u32,
    pub video_id: String,
    pub video_uri: String,
    /// Segments of the run, empty while segmenting
    pub segments: Vec<Segment>,
    /// Embeddings of the run, set for indexing
    pub embeddings: Option<EmbeddingSet>,
}

/// Delivery identity of a notification: idempotency key plus attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DeliveryKey {
    key: IdempotencyKey,
    attempt: u32,
}

impl DeliveryKey {
    fn of(event: &StageEvent) -> Self {
        Self {
            key: event.key.clone(),
            attempt: event.attempt,
        }
    }
}

#[derive(Default)]
struct EmbeddingWorkspace {
    embeddings: EmbeddingSet,
    expected: usize,
}

enum ModalityFailure {
    Transient(String),
    Permanent(String),
    Cancelled,
}

/// Resolves once the run is cancelled or its driver is gone
pub(crate) async fn cancelled(mut cancel: watch::Receiver<bool>) {
    let _ = cancel.wait_for(|c| *c).await;
}

/// Turn segmenter output into ordered, validated segments
///
/// Segments are sorted by start and segments sharing an index key are
/// collapsed, first one wins.
pub fn build_segments(video_id: &str, bounds: Vec<SegmentBounds>) -> Result<Vec<Segment>> {
    if bounds.is_empty() {
        return Err(PipelineError::Permanent(
            "segmenter returned no segments".to_string(),
        ));
    }
    let mut bounds = bounds;
    bounds.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.end.total_cmp(&b.end)));

    let mut seen = HashSet::with_capacity(bounds.len());
    let mut segments = Vec::with_capacity(bounds.len());
    for b in bounds {
        let segment = Segment::new(video_id, segments.len(), b.start, b.end, b.summary)
            .map_err(|e| PipelineError::Permanent(e.to_string()))?;
        if seen.insert(segment.key()) {
            segments.push(segment);
        }
    }
    Ok(segments)
}

/// Stage coordinator
pub struct StageCoordinator {
    segmenter: Arc<dyn Segmenter>,
    embedder: Arc<dyn Embedder>,
    writer: IndexWriter,
    config: PipelineConfig,
    delivered: Mutex<HashSet<DeliveryKey>>,
    workspaces: Mutex<HashMap<String, Arc<Mutex<EmbeddingWorkspace>>>>,
}

impl StageCoordinator {
    #[must_use]
    pub fn new(
        segmenter: Arc<dyn Segmenter>,
        embedder: Arc<dyn Embedder>,
        writer: IndexWriter,
        config: PipelineConfig,
    ) -> Self {
        Self {
            segmenter,
            embedder,
            writer,
            config,
            delivered: Mutex::new(HashSet::new()),
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    /// Run `task` in the background and deliver its event to `sink`
    pub fn dispatch(
        self: &Arc<Self>,
        task: StageTask,
        sink: mpsc::Sender<StageEvent>,
        cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let stage = task.key.stage;
            let limit = coordinator.config.timeouts.for_stage(stage);
            debug!("Starting {} attempt {}", task.key, task.attempt);

            let stage_cancel = cancel.clone();
            let outcome = tokio::select! {
                result = tokio::time::timeout(limit, coordinator.run_stage(&task, stage_cancel)) => {
                    match result {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!("{} attempt {} timed out after {:?}", task.key, task.attempt, limit);
                            StageOutcome::TimedOut
                        }
                    }
                }
                () = cancelled(cancel) => {
                    debug!("{} attempt {} abandoned, run cancelled", task.key, task.attempt);
                    return;
                }
            };

            let event = StageEvent {
                key: task.key,
                attempt: task.attempt,
                outcome,
            };
            coordinator.deliver(event, &sink).await;
        })
    }

    /// Forward `event` unless an identical notification was already forwarded
    ///
    /// Returns whether the event was forwarded.
    pub async fn deliver(&self, event: StageEvent, sink: &mpsc::Sender<StageEvent>) -> bool {
        let id = DeliveryKey::of(&event);
        if !self.delivered.lock().await.insert(id) {
            debug!(
                "Dropping duplicate notification for {} attempt {}",
                event.key, event.attempt
            );
            return false;
        }
        let key = event.key.clone();
        if sink.send(event).await.is_err() {
            debug!("Run of {} is no longer listening, result discarded", key);
            return false;
        }
        true
    }

    /// Forget delivery history and retained embeddings of a finished run
    pub async fn release(&self, run_id: &str) {
        self.delivered
            .lock()
            .await
            .retain(|d| d.key.run_id != run_id);
        self.workspaces.lock().await.remove(run_id);
    }

    /// Embeddings produced and expected so far for a run in the embedding stage
    pub async fn embedding_progress(&self, run_id: &str) -> Option<(usize, usize)> {
        let workspace = self.workspaces.lock().await.get(run_id).cloned()?;
        let workspace = workspace.lock().await;
        Some((workspace.embeddings.len(), workspace.expected))
    }

    async fn run_stage(&self, task: &StageTask, cancel: watch::Receiver<bool>) -> StageOutcome {
        match task.key.stage {
            Stage::Segmenting => self.segment(task).await,
            Stage::Embedding => self.embed(task, cancel).await,
            Stage::Indexing => self.index(task).await,
        }
    }

    async fn segment(&self, task: &StageTask) -> StageOutcome {
        match self
            .segmenter
            .segment(&task.video_uri, &task.key.run_id)
            .await
        {
            WorkerOutcome::Success(bounds) => match build_segments(&task.video_id, bounds) {
                Ok(segments) => {
                    info!("Segmented {} into {} segments", task.video_id, segments.len());
                    StageOutcome::Completed(StagePayload::Segmented(segments))
                }
                Err(e) => StageOutcome::PermanentFailure(e.to_string()),
            },
            WorkerOutcome::TransientFailure(reason) => StageOutcome::TransientFailure(reason),
            WorkerOutcome::PermanentFailure(reason) => StageOutcome::PermanentFailure(reason),
        }
    }

    async fn workspace(&self, run_id: &str, expected: usize) -> Arc<Mutex<EmbeddingWorkspace>> {
        let workspace = self
            .workspaces
            .lock()
            .await
            .entry(run_id.to_string())
            .or_default()
            .clone();
        workspace.lock().await.expected = expected;
        workspace
    }

    async fn embed(&self, task: &StageTask, cancel: watch::Receiver<bool>) -> StageOutcome {
        let modalities = self.config.required_modalities.clone();
        let workspace = self
            .workspace(&task.key.run_id, task.segments.len() * modalities.len())
            .await;
        let semaphore = Arc::new(Semaphore::new(self.config.embedding_concurrency.max(1)));
        let mut jobs = JoinSet::new();

        for segment in &task.segments {
            for modality in &modalities {
                if workspace.lock().await.embeddings.contains(segment.index, *modality) {
                    continue;
                }
                let request = EmbedRequest {
                    video_id: task.video_id.clone(),
                    segment_index: segment.index,
                    media_ref: segment.media_ref(&task.video_uri),
                    modality: *modality,
                };
                let embedder = Arc::clone(&self.embedder);
                let config = self.config.clone();
                let semaphore = Arc::clone(&semaphore);
                let workspace = Arc::clone(&workspace);
                let cancel = cancel.clone();
                jobs.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return (request, Err(ModalityFailure::Cancelled));
                    };
                    let result = embed_with_retry(embedder.as_ref(), &request, &config, cancel).await;
                    if let Ok(embedding) = &result {
                        workspace.lock().await.embeddings.insert(embedding.clone());
                    }
                    (request, result.map(|_| ()))
                });
            }
        }

        let mut permanent: Option<String> = None;
        let mut transient: Vec<String> = Vec::new();
        let mut was_cancelled = false;
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((request, Err(ModalityFailure::Permanent(reason)))) => {
                    warn!(
                        "{} of segment {} failed permanently: {}",
                        request.modality, request.segment_index, reason
                    );
                    permanent.get_or_insert(format!(
                        "{} embedding of segment {}: {}",
                        request.modality, request.segment_index, reason
                    ));
                    jobs.abort_all();
                }
                Ok((request, Err(ModalityFailure::Transient(reason)))) => {
                    transient.push(
                        PipelineError::PartialModality {
                            segment_index: request.segment_index,
                            modality: request.modality,
                            reason,
                        }
                        .to_string(),
                    );
                }
                Ok((_, Err(ModalityFailure::Cancelled))) => was_cancelled = true,
                Err(e) if e.is_cancelled() => {}
                Err(e) => transient.push(format!("embedding task failed: {e}")),
            }
        }

        if let Some(reason) = permanent {
            return StageOutcome::PermanentFailure(reason);
        }
        if was_cancelled {
            return StageOutcome::TransientFailure("run cancelled".to_string());
        }
        if let Some(first) = transient.first() {
            return StageOutcome::TransientFailure(format!(
                "{} modality jobs failed, first: {}",
                transient.len(),
                first
            ));
        }

        let embeddings = workspace.lock().await.embeddings.clone();
        let missing = embeddings.missing(&task.segments, &modalities);
        if missing > 0 {
            return StageOutcome::TransientFailure(format!(
                "{missing} segment modalities still missing"
            ));
        }
        info!(
            "Embedded {} segments of {} in {} modalities",
            task.segments.len(),
            task.video_id,
            modalities.len()
        );
        StageOutcome::Completed(StagePayload::Embedded(embeddings))
    }

    async fn index(&self, task: &StageTask) -> StageOutcome {
        let Some(embeddings) = &task.embeddings else {
            return StageOutcome::TransientFailure("no embeddings to index".to_string());
        };
        match self
            .writer
            .write(
                &task.video_uri,
                &task.segments,
                embeddings,
                &self.config.required_modalities,
            )
            .await
        {
            Ok(report) if report.is_complete() => StageOutcome::Completed(StagePayload::Indexed {
                count: report.written(),
            }),
            Ok(report) => {
                let failures = report.failures();
                let first = failures
                    .first()
                    .and_then(|a| a.error.clone())
                    .unwrap_or_default();
                StageOutcome::TransientFailure(format!(
                    "{} of {} index writes failed, first: {}",
                    failures.len(),
                    report.acks.len(),
                    first
                ))
            }
            Err(e) if e.is_retryable() => StageOutcome::TransientFailure(e.to_string()),
            Err(e) => StageOutcome::PermanentFailure(e.to_string()),
        }
    }
}

/// Embed one segment in one modality, retrying transient failures
async fn embed_with_retry(
    embedder: &dyn Embedder,
    request: &EmbedRequest,
    config: &PipelineConfig,
    cancel: watch::Receiver<bool>,
) -> std::result::Result<Embedding, ModalityFailure> {
    let mut last_error = String::new();
    for attempt in 1..=config.retry.max_attempts {
        if attempt > 1 {
            let delay = config.retry.backoff(attempt - 1);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancelled(cancel.clone()) => return Err(ModalityFailure::Cancelled),
            }
        }
        match embed_once(embedder, request, config, cancel.clone()).await {
            Ok(WorkerOutcome::Success(output)) => {
                validate_vector(&output.vector, config.expected_dim)
                    .map_err(|e| ModalityFailure::Permanent(e.to_string()))?;
                return Ok(Embedding {
                    segment_index: request.segment_index,
                    modality: request.modality,
                    vector: output.vector,
                    model_version: output.model_version,
                });
            }
            Ok(WorkerOutcome::TransientFailure(reason)) => {
                warn!(
                    "{} of segment {} attempt {} failed: {}",
                    request.modality, request.segment_index, attempt, reason
                );
                last_error = reason;
            }
            Ok(WorkerOutcome::PermanentFailure(reason)) => {
                return Err(ModalityFailure::Permanent(reason));
            }
            Err(failure) => return Err(failure),
        }
    }
    Err(ModalityFailure::Transient(last_error))
}

/// Start an embedding job and poll it until it is ready
async fn embed_once(
    embedder: &dyn Embedder,
    request: &EmbedRequest,
    config: &PipelineConfig,
    cancel: watch::Receiver<bool>,
) -> std::result::Result<WorkerOutcome<EmbeddingOutput>, ModalityFailure> {
    let handle = match embedder.start(request).await {
        WorkerOutcome::Success(handle) => handle,
        WorkerOutcome::TransientFailure(reason) => {
            return Ok(WorkerOutcome::TransientFailure(reason))
        }
        WorkerOutcome::PermanentFailure(reason) => {
            return Ok(WorkerOutcome::PermanentFailure(reason))
        }
    };
    loop {
        if let EmbedPoll::Ready(outcome) = embedder.poll(&handle).await {
            return Ok(outcome);
        }
        tokio::select! {
            () = tokio::time::sleep(config.poll_interval) => {}
            () = cancelled(cancel.clone()) => return Err(ModalityFailure::Cancelled),
        }
    }
}
