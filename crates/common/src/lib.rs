/// Common types and utilities for the video clip search pipeline
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod model;

pub use model::*;

/// Pipeline errors
///
/// The variants follow the failure classes the orchestrator distinguishes:
/// validation failures are rejected outright, transient failures are retried,
/// permanent failures end the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transient worker error: {0}")]
    Transient(String),

    #[error("Permanent stage error: {0}")]
    Permanent(String),

    #[error("Modality {modality} failed for segment {segment_index}: {reason}")]
    PartialModality {
        segment_index: usize,
        modality: Modality,
        reason: String,
    },

    #[error("Stage {0} timed out after {1}ms")]
    Timeout(Stage, u64),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Video not found: {0}")]
    VideoNotFound(String),

    #[error("Video {0} already has an active run")]
    ActiveRunExists(String),

    #[error("No active run for video {0}")]
    NoActiveRun(String),

    #[error("Version conflict on run {run_id}: expected {expected}, found {actual}")]
    VersionConflict {
        run_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl PipelineError {
    /// Whether the failure may succeed on a later attempt
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Transient(_)
                | PipelineError::PartialModality { .. }
                | PipelineError::Timeout(..)
                | PipelineError::Storage(_)
        )
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Outcome reported by an external capability
///
/// Every capability result is one of these three variants and callers
/// consume them uniformly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum WorkerOutcome<T> {
    Success(T),
    TransientFailure(String),
    PermanentFailure(String),
}

impl<T> WorkerOutcome<T> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerOutcome::Success(_))
    }

    /// Map the success value, leaving failures untouched
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> WorkerOutcome<U> {
        match self {
            WorkerOutcome::Success(value) => WorkerOutcome::Success(f(value)),
            WorkerOutcome::TransientFailure(reason) => WorkerOutcome::TransientFailure(reason),
            WorkerOutcome::PermanentFailure(reason) => WorkerOutcome::PermanentFailure(reason),
        }
    }

    /// Convert into a `Result`, classifying failures into the error taxonomy
    pub fn into_result(self) -> Result<T> {
        match self {
            WorkerOutcome::Success(value) => Ok(value),
            WorkerOutcome::TransientFailure(reason) => Err(PipelineError::Transient(reason)),
            WorkerOutcome::PermanentFailure(reason) => Err(PipelineError::Permanent(reason)),
        }
    }
}

/// Validate an embedding vector returned by a capability
///
/// Rejects empty vectors, non-finite components and, when `expected_dim`
/// is set, vectors of the wrong dimension.
pub fn validate_vector(vector: &[f32], expected_dim: Option<usize>) -> Result<()> {
    if vector.is_empty() {
        return Err(PipelineError::Validation("embedding vector is empty".to_string()));
    }
    if let Some(dim) = expected_dim {
        if vector.len() != dim {
            return Err(PipelineError::Validation(format!(
                "embedding dimension mismatch: expected {dim}, got {}",
                vector.len()
            )));
        }
    }
    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(PipelineError::Validation(format!(
            "embedding contains non-finite value at position {pos}"
        )));
    }
    Ok(())
}
