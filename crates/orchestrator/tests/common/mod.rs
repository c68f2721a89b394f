//! Scripted capabilities for pipeline tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use video_search_common::{Modality, WorkerOutcome};
use video_search_orchestrator::{
    EmbedHandle, EmbedPoll, EmbedRequest, Embedder, EmbeddingOutput, Orchestrator,
    PipelineConfig, SegmentBounds, Segmenter,
};
use video_search_storage::Stores;

/// Returns a fixed outcome after an optional delay
pub struct ScriptedSegmenter {
    outcome: WorkerOutcome<Vec<SegmentBounds>>,
    delay: Duration,
    transient_failures: usize,
    pub calls: AtomicUsize,
}

impl ScriptedSegmenter {
    pub fn segments(count: usize) -> Self {
        let bounds = (0..count)
            .map(|i| SegmentBounds {
                start: i as f64 * 6.0,
                end: (i + 1) as f64 * 6.0,
                summary: Some(format!("segment {i} of a walk in the park")),
            })
            .collect();
        Self::outcome(WorkerOutcome::Success(bounds))
    }

    pub fn outcome(outcome: WorkerOutcome<Vec<SegmentBounds>>) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
            transient_failures: 0,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `times` calls transiently before the scripted outcome
    pub fn failing_first(mut self, times: usize) -> Self {
        self.transient_failures = times;
        self
    }
}

#[async_trait::async_trait]
impl Segmenter for ScriptedSegmenter {
    async fn segment(&self, _: &str, _: &str) -> WorkerOutcome<Vec<SegmentBounds>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if call < self.transient_failures {
            return WorkerOutcome::TransientFailure("segmenter throttled".to_string());
        }
        self.outcome.clone()
    }
}

/// Embedder that counts starts per (segment, modality)
///
/// Jobs can be made to fail transiently a number of times, and polls stay
/// pending while the gate is closed.
pub struct ScriptedEmbedder {
    failures: HashMap<(usize, Modality), usize>,
    starts: Mutex<HashMap<(usize, Modality), usize>>,
    open: AtomicBool,
    pub ready_polls: AtomicUsize,
}

impl ScriptedEmbedder {
    pub fn new() -> Self {
        Self {
            failures: HashMap::new(),
            starts: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
            ready_polls: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, segment_index: usize, modality: Modality, times: usize) -> Self {
        self.failures.insert((segment_index, modality), times);
        self
    }

    pub fn gated(self) -> Self {
        self.open.store(false, Ordering::SeqCst);
        self
    }

    pub fn open_gate(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn starts(&self, segment_index: usize, modality: Modality) -> usize {
        self.starts
            .lock()
            .unwrap()
            .get(&(segment_index, modality))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_starts(&self) -> usize {
        self.starts.lock().unwrap().values().sum()
    }
}

#[async_trait::async_trait]
impl Embedder for ScriptedEmbedder {
    async fn start(&self, request: &EmbedRequest) -> WorkerOutcome<EmbedHandle> {
        let id = (request.segment_index, request.modality);
        let count = {
            let mut starts = self.starts.lock().unwrap();
            let count = starts.entry(id).or_insert(0);
            *count += 1;
            *count
        };
        if count <= self.failures.get(&id).copied().unwrap_or(0) {
            return WorkerOutcome::TransientFailure("embedding service throttled".to_string());
        }
        WorkerOutcome::Success(EmbedHandle(format!(
            "{}:{}",
            request.segment_index, request.modality
        )))
    }

    async fn poll(&self, handle: &EmbedHandle) -> EmbedPoll {
        if !self.open.load(Ordering::SeqCst) {
            return EmbedPoll::Pending;
        }
        self.ready_polls.fetch_add(1, Ordering::SeqCst);
        let segment: f32 = handle
            .0
            .split(':')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        EmbedPoll::Ready(WorkerOutcome::Success(EmbeddingOutput {
            vector: vec![1.0, segment, 0.5, 0.25],
            model_version: "test-model-v1".to_string(),
        }))
    }
}

pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.max_attempts = 3;
    config.retry.initial_backoff = Duration::from_millis(1);
    config.retry.max_backoff = Duration::from_millis(10);
    config.poll_interval = Duration::from_millis(1);
    config.required_modalities = Modality::ALL.to_vec();
    config.expected_dim = None;
    config
}

pub fn orchestrator(
    stores: Stores,
    segmenter: Arc<ScriptedSegmenter>,
    embedder: Arc<ScriptedEmbedder>,
    config: PipelineConfig,
) -> Orchestrator {
    Orchestrator::new(stores, segmenter, embedder, config)
}
