//! Data model shared by the pipeline, the index and the search engine

use crate::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Embedding space a vector belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Visual,
    Audio,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Visual, Modality::Audio];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Modality::Visual => "visual",
            Modality::Audio => "audio",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "visual" => Some(Modality::Visual),
            "audio" => Some(Modality::Audio),
            _ => None,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which embedding space(s) a search query targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModalitySelector {
    Visual,
    Audio,
    #[default]
    Combined,
}

impl ModalitySelector {
    #[must_use]
    pub fn modalities(&self) -> &'static [Modality] {
        match self {
            ModalitySelector::Visual => &[Modality::Visual],
            ModalitySelector::Audio => &[Modality::Audio],
            ModalitySelector::Combined => &Modality::ALL,
        }
    }
}

/// Upload notification that starts processing of a video
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestTrigger {
    /// Object storage reference of the uploaded video (e.g. `s3://bucket/key.mp4`)
    pub object_reference: String,
    /// Object size in bytes
    pub size: u64,
    /// Upload time reported by object storage
    pub timestamp: DateTime<Utc>,
}

impl IngestTrigger {
    pub fn validate(&self) -> Result<()> {
        if self.object_reference.trim().is_empty() {
            return Err(PipelineError::Validation(
                "object_reference must not be empty".to_string(),
            ));
        }
        if self.size == 0 {
            return Err(PipelineError::Validation(format!(
                "object {} is empty",
                self.object_reference
            )));
        }
        Ok(())
    }
}

/// Deterministic video id for an object reference
///
/// A re-delivered notification for the same object maps to the same asset.
#[must_use]
pub fn video_id_for(object_reference: &str) -> String {
    let digest = Sha256::digest(object_reference.as_bytes());
    hex_prefix(&digest, 32)
}

/// Stable clip identifier derived from the segment bounds
#[must_use]
pub fn clip_id(video_id: &str, start: f64, end: f64) -> String {
    let digest = Sha256::digest(format!("{video_id}_{start:.2}_{end:.2}").as_bytes());
    format!("clip_{}", hex_prefix(&digest, 16))
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for b in bytes {
        if out.len() >= len {
            break;
        }
        out.push_str(&format!("{b:02x}"));
    }
    out.truncate(len);
    out
}

/// Uploaded video registered with the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoAsset {
    pub id: String,
    pub source_reference: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    /// Mirrors the state of the latest run
    pub status: RunState,
    pub latest_run_id: Option<String>,
}

impl VideoAsset {
    #[must_use]
    pub fn from_trigger(trigger: &IngestTrigger) -> Self {
        Self {
            id: video_id_for(&trigger.object_reference),
            source_reference: trigger.object_reference.clone(),
            size: trigger.size,
            uploaded_at: trigger.timestamp,
            status: RunState::Created,
            latest_run_id: None,
        }
    }

    /// Last path component of the source reference
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.source_reference
            .rsplit('/')
            .next()
            .unwrap_or(&self.source_reference)
    }
}

/// Processing stage of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Segmenting,
    Embedding,
    Indexing,
}

impl Stage {
    pub const ORDER: [Stage; 3] = [Stage::Segmenting, Stage::Embedding, Stage::Indexing];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Segmenting => "segmenting",
            Stage::Embedding => "embedding",
            Stage::Indexing => "indexing",
        }
    }

    /// Run state while this stage executes
    #[must_use]
    pub fn state(&self) -> RunState {
        match self {
            Stage::Segmenting => RunState::Segmenting,
            Stage::Embedding => RunState::Embedding,
            Stage::Indexing => RunState::Indexing,
        }
    }

    /// Stage that follows this one, `None` after indexing
    #[must_use]
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Segmenting => Some(Stage::Embedding),
            Stage::Embedding => Some(Stage::Indexing),
            Stage::Indexing => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle state of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Created,
    Segmenting,
    Embedding,
    Indexing,
    Completed,
    Failed,
}

impl RunState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Created => "created",
            RunState::Segmenting => "segmenting",
            RunState::Embedding => "embedding",
            RunState::Indexing => "indexing",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(RunState::Created),
            "segmenting" => Some(RunState::Segmenting),
            "embedding" => Some(RunState::Embedding),
            "indexing" => Some(RunState::Indexing),
            "completed" => Some(RunState::Completed),
            "failed" => Some(RunState::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    /// Stage executing in this state
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RunState::Segmenting => Some(Stage::Segmenting),
            RunState::Embedding => Some(Stage::Embedding),
            RunState::Indexing => Some(Stage::Indexing),
            _ => None,
        }
    }

    /// Successor on the happy path
    #[must_use]
    pub fn next(&self) -> Option<RunState> {
        match self {
            RunState::Created => Some(RunState::Segmenting),
            RunState::Segmenting => Some(RunState::Embedding),
            RunState::Embedding => Some(RunState::Indexing),
            RunState::Indexing => Some(RunState::Completed),
            RunState::Completed | RunState::Failed => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How one stage attempt ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    TransientFailure(String),
    PermanentFailure(String),
    TimedOut,
    Cancelled,
}

/// One attempt of one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub stage: Stage,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<AttemptOutcome>,
}

/// One end-to-end processing attempt of a video asset
///
/// Only the orchestrator mutates a run, and every mutation is persisted with
/// a compare-and-swap on `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub video_id: String,
    pub video_uri: String,
    pub state: RunState,
    /// Attempt number of the current stage, starting at 1
    pub attempt: u32,
    /// Set between a failed attempt and the start of its retry
    pub retrying: bool,
    pub history: Vec<StageExecution>,
    pub segments: Vec<Segment>,
    pub indexed_count: usize,
    pub error: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    #[must_use]
    pub fn new(id: impl Into<String>, asset: &VideoAsset) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            video_id: asset.id.clone(),
            video_uri: asset.source_reference.clone(),
            state: RunState::Created,
            attempt: 0,
            retrying: false,
            history: Vec::new(),
            segments: Vec::new(),
            indexed_count: 0,
            error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    #[must_use]
    pub fn current_stage(&self) -> Option<Stage> {
        self.state.stage()
    }

    /// Stages whose latest attempt succeeded, in execution order
    #[must_use]
    pub fn completed_stages(&self) -> Vec<Stage> {
        self.history
            .iter()
            .filter(|e| e.outcome == Some(AttemptOutcome::Succeeded))
            .map(|e| e.stage)
            .collect()
    }

    /// Enter the next stage with a fresh attempt counter
    ///
    /// Stages may only be entered in order and never re-entered.
    pub fn enter_stage(&mut self, stage: Stage) -> Result<()> {
        let target = stage.state();
        if self.state.next() != Some(target) {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        self.attempt = 1;
        self.retrying = false;
        self.push_execution(stage);
        Ok(())
    }

    /// Close the open execution record of the current attempt
    pub fn finish_attempt(&mut self, outcome: AttemptOutcome) {
        let (stage, attempt) = (self.current_stage(), self.attempt);
        if let Some(exec) = self.history.iter_mut().rev().find(|e| {
            Some(e.stage) == stage && e.attempt == attempt && e.outcome.is_none()
        }) {
            exec.finished_at = Some(Utc::now());
            exec.outcome = Some(outcome);
        }
        self.touch();
    }

    /// Mark the current stage as waiting for its next attempt
    pub fn schedule_retry(&mut self, reason: &str) {
        self.retrying = true;
        self.attempt += 1;
        self.error = Some(reason.to_string());
        self.touch();
    }

    /// Start the attempt scheduled by `schedule_retry`
    pub fn begin_retry(&mut self) -> Result<()> {
        let stage = self.current_stage().ok_or(PipelineError::InvalidTransition {
            from: self.state,
            to: self.state,
        })?;
        if !self.retrying {
            return Err(PipelineError::Other(format!(
                "run {} has no pending retry",
                self.id
            )));
        }
        self.retrying = false;
        self.push_execution(stage);
        Ok(())
    }

    /// Finish the run after indexing
    ///
    /// Refuses to complete while fewer entries were indexed than segments
    /// were produced.
    pub fn complete(&mut self) -> Result<()> {
        if self.state != RunState::Indexing {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to: RunState::Completed,
            });
        }
        if self.indexed_count < self.segments.len() {
            return Err(PipelineError::Transient(format!(
                "indexed {} of {} segments",
                self.indexed_count,
                self.segments.len()
            )));
        }
        self.state = RunState::Completed;
        self.retrying = false;
        self.error = None;
        self.touch();
        Ok(())
    }

    /// Move to `Failed` from any non-terminal state
    pub fn fail(&mut self, reason: &str, outcome: AttemptOutcome) -> Result<()> {
        if self.state.is_terminal() {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to: RunState::Failed,
            });
        }
        if !self.retrying {
            self.finish_attempt(outcome);
        }
        self.state = RunState::Failed;
        self.retrying = false;
        self.error = Some(reason.to_string());
        self.touch();
        Ok(())
    }

    fn push_execution(&mut self, stage: Stage) {
        self.history.push(StageExecution {
            stage,
            attempt: self.attempt,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
        });
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Index key of a segment: video id and segment start in whole milliseconds
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentKey {
    pub video_id: String,
    pub start_ms: u64,
}

impl SegmentKey {
    #[must_use]
    pub fn new(video_id: impl Into<String>, start_secs: f64) -> Self {
        Self {
            video_id: video_id.into(),
            start_ms: (start_secs.max(0.0) * 1000.0).round() as u64,
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}ms", self.video_id, self.start_ms)
    }
}

/// Time-bounded slice of a video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub video_id: String,
    pub index: usize,
    /// Start in seconds
    pub start: f64,
    /// End in seconds
    pub end: f64,
    pub summary: Option<String>,
}

impl Segment {
    pub fn new(
        video_id: impl Into<String>,
        index: usize,
        start: f64,
        end: f64,
        summary: Option<String>,
    ) -> Result<Self> {
        if !start.is_finite() || !end.is_finite() || start < 0.0 || start >= end {
            return Err(PipelineError::Validation(format!(
                "invalid segment bounds [{start}, {end})"
            )));
        }
        Ok(Self {
            video_id: video_id.into(),
            index,
            start,
            end,
            summary,
        })
    }

    #[must_use]
    pub fn key(&self) -> SegmentKey {
        SegmentKey::new(self.video_id.clone(), self.start)
    }

    #[must_use]
    pub fn clip_id(&self) -> String {
        clip_id(&self.video_id, self.start, self.end)
    }

    /// Media fragment reference handed to the embedding capability
    #[must_use]
    pub fn media_ref(&self, video_uri: &str) -> String {
        format!("{video_uri}#t={:.3},{:.3}", self.start, self.end)
    }
}

/// Vector for one segment in one modality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub segment_index: usize,
    pub modality: Modality,
    pub vector: Vec<f32>,
    pub model_version: String,
}

/// Stored vector with the model version that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub vector: Vec<f32>,
    pub model_version: String,
}

/// Searchable record for one segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: SegmentKey,
    pub clip_id: String,
    pub start: f64,
    pub end: f64,
    pub video_uri: String,
    /// Text matched by lexical queries
    pub text: String,
    pub vectors: BTreeMap<Modality, VectorRecord>,
    pub indexed_at: DateTime<Utc>,
}

impl IndexEntry {
    /// Carry over vectors of modalities this write does not include
    ///
    /// Modalities present in this write replace the stored ones whatever
    /// their `model_version`: versions are opaque labels with no order, and the
    /// latest run embeds with the currently deployed model, so the last write
    /// is the newest model's vector.
    pub fn retain_missing_from(&mut self, previous: &IndexEntry) {
        for (modality, record) in &previous.vectors {
            self.vectors
                .entry(*modality)
                .or_insert_with(|| record.clone());
        }
    }
}
