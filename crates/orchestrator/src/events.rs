//! Messages exchanged between the coordinator and the orchestrator

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use video_search_common::{Embedding, Modality, PipelineRun, Segment, Stage};

/// Identity of one stage of one run
///
/// Completion notifications are deduplicated on this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub run_id: String,
    pub stage: Stage,
}

impl IdempotencyKey {
    #[must_use]
    pub fn new(run_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_id, self.stage)
    }
}

/// Embeddings of a run, keyed by segment index and modality
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingSet {
    embeddings: BTreeMap<(usize, Modality), Embedding>,
}

impl EmbeddingSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, embedding: Embedding) {
        self.embeddings
            .insert((embedding.segment_index, embedding.modality), embedding);
    }

    #[must_use]
    pub fn contains(&self, segment_index: usize, modality: Modality) -> bool {
        self.embeddings.contains_key(&(segment_index, modality))
    }

    #[must_use]
    pub fn get(&self, segment_index: usize, modality: Modality) -> Option<&Embedding> {
        self.embeddings.get(&(segment_index, modality))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// (segment, modality) pairs still missing
    #[must_use]
    pub fn missing(&self, segments: &[Segment], modalities: &[Modality]) -> usize {
        segments
            .iter()
            .flat_map(|s| modalities.iter().map(move |m| (s.index, *m)))
            .filter(|(index, modality)| !self.contains(*index, *modality))
            .count()
    }

    /// Every segment has every required modality
    #[must_use]
    pub fn covers(&self, segments: &[Segment], modalities: &[Modality]) -> bool {
        self.missing(segments, modalities) == 0
    }
}

/// Result carried by a successful stage
#[derive(Debug, Clone, PartialEq)]
pub enum StagePayload {
    Segmented(Vec<Segment>),
    Embedded(EmbeddingSet),
    Indexed { count: usize },
}

/// How one stage attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed(StagePayload),
    TransientFailure(String),
    PermanentFailure(String),
    TimedOut,
}

impl StageOutcome {
    #[must_use]
    pub fn is_completion(&self) -> bool {
        matches!(self, StageOutcome::Completed(_))
    }
}

/// Stage result delivered to a run's event stream
#[derive(Debug, Clone, PartialEq)]
pub struct StageEvent {
    pub key: IdempotencyKey,
    pub attempt: u32,
    pub outcome: StageOutcome,
}

/// Effect of applying a stage event to a run
#[derive(Debug, Clone)]
pub enum Transition {
    /// The run entered `next`
    Advanced { run: PipelineRun, next: Stage },
    /// The current stage will be attempted again after `delay`
    Retry { run: PipelineRun, delay: Duration },
    Completed(PipelineRun),
    Failed(PipelineRun),
    /// Stale or duplicate event, nothing changed
    Discarded,
}
