//! Error taxonomy for the pipeline stages and their collaborators.

use crate::domain::jobs::{InvalidTransition, JobState, Segment};
use crate::ports::tools::Tool;
use serde::Serialize;
use std::io;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("invalid object key {0:?}")]
    InvalidKey(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        Self::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

/// Failure of an external tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: Tool,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: Tool,
        status: String,
        stderr: String,
    },

    #[error("{tool} was cancelled")]
    Cancelled { tool: Tool },

    #[error("{tool} exited successfully without output")]
    NoOutput { tool: Tool },

    #[error("{tool} I/O error: {source}")]
    Io {
        tool: Tool,
        #[source]
        source: io::Error,
    },
}

impl ToolError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ToolError::Cancelled { .. })
    }
}

/// The source could not be read or understood. Never retried.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to read source: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("could not parse probe output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("probe output has no duration")]
    MissingDuration,

    #[error("probe output has an invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("probe output has no container format")]
    MissingFormat,

    #[error("source {key} has zero duration")]
    EmptySource { key: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SegmentationError {
    #[error("segment size must be a positive number of seconds, got {0}")]
    InvalidSegmentSize(f64),

    #[error("duration must be a non-negative number of seconds, got {0}")]
    InvalidDuration(f64),
}

#[derive(Debug, Error)]
pub enum TranscodeCause {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tool(ToolError),

    #[error("cancelled")]
    Cancelled,
}

impl From<ToolError> for TranscodeCause {
    fn from(err: ToolError) -> Self {
        if err.is_cancelled() {
            TranscodeCause::Cancelled
        } else {
            TranscodeCause::Tool(err)
        }
    }
}

/// A single transcode attempt of one segment failed.
#[derive(Debug, Error)]
#[error("segment {} [{}, {}) failed: {cause}", .segment.index, .segment.start, .segment.end)]
pub struct TranscodeError {
    pub segment: Segment,
    #[source]
    pub cause: TranscodeCause,
}

impl TranscodeError {
    pub fn new(segment: Segment, cause: impl Into<TranscodeCause>) -> Self {
        Self {
            segment,
            cause: cause.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, TranscodeCause::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("segment {} failed after {attempts} attempts: {error}", .error.segment.index)]
    SegmentFailed {
        attempts: u32,
        #[source]
        error: TranscodeError,
    },

    #[error("dispatch cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("no segments to assemble")]
    NoSegments,

    #[error("segment results have a gap: expected index {expected}, found {found}")]
    Gap { expected: usize, found: usize },

    #[error("segment results out of order at index {0}")]
    OutOfOrder(usize),

    #[error("segment {0} did not transcode successfully")]
    SegmentFailed(usize),

    #[error("artifact {key} for segment {index} is not available")]
    ArtifactUnavailable { index: usize, key: String },

    #[error("final artifact {0} is not visible after upload")]
    FinalArtifactMissing(String),

    #[error("concatenation produced an empty artifact at {0}")]
    EmptyOutput(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl AssemblyError {
    pub fn segment_index(&self) -> Option<usize> {
        match self {
            AssemblyError::Gap { expected, .. } => Some(*expected),
            AssemblyError::OutOfOrder(index)
            | AssemblyError::SegmentFailed(index)
            | AssemblyError::ArtifactUnavailable { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Non-fatal: an intermediate artifact could not be deleted.
#[derive(Debug, Error)]
#[error("failed to delete {key}: {source}")]
pub struct CleanupError {
    pub key: String,
    #[source]
    pub source: StorageError,
}

/// Terminal failure of a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Segmentation(#[from] SegmentationError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error("job exceeded its deadline of {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl JobError {
    /// Index of the segment involved, when the failure is tied to one.
    pub fn segment_index(&self) -> Option<usize> {
        match self {
            JobError::Dispatch(DispatchError::SegmentFailed { error, .. }) => {
                Some(error.segment.index)
            }
            JobError::Assembly(err) => err.segment_index(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, JobError::Timeout(_))
    }
}

/// Externally visible outcome of a failed job.
#[derive(Debug, Error, Serialize)]
#[error("job failed while {stage}: {message}")]
pub struct JobFailure {
    /// `None` when the input was rejected before a job was created.
    pub job_id: Option<Uuid>,
    pub stage: JobState,
    pub segment_index: Option<usize>,
    pub message: String,
    #[serde(skip)]
    #[source]
    pub error: JobError,
}

impl JobFailure {
    pub fn new(job_id: Option<Uuid>, stage: JobState, error: JobError) -> Self {
        Self {
            job_id,
            stage,
            segment_index: error.segment_index(),
            message: error.to_string(),
            error,
        }
    }
}
