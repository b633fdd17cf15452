use crate::error::SegmentationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Where a source asset lives in storage, before it has been probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetLocation {
    pub bucket: String,
    pub key: String,
}

impl AssetLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

/// A probed source asset. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub location: AssetLocation,
    /// Total duration in seconds
    pub duration: f64,
    /// Demuxer name usable as an input hint, e.g. "mov"
    pub container_format: String,
}

impl MediaAsset {
    pub fn bucket(&self) -> &str {
        &self.location.bucket
    }

    pub fn key(&self) -> &str {
        &self.location.key
    }
}

/// A contiguous time window `[start, end)` of the source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub start: f64,
    pub end: f64,
}

impl Segment {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentResult {
    pub segment: Segment,
    /// Storage key of the artifact. Only eligible for assembly on success.
    pub artifact_location: String,
    pub status: SegmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Worker invocations spent on this segment
    pub attempts: u32,
}

impl SegmentResult {
    pub fn success(segment: Segment, artifact_location: String, attempts: u32) -> Self {
        Self {
            segment,
            artifact_location,
            status: SegmentStatus::Success,
            error: None,
            attempts,
        }
    }

    pub fn failed(
        segment: Segment,
        artifact_location: String,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            segment,
            artifact_location,
            status: SegmentStatus::Failed,
            error: Some(ErrorDetail {
                message: message.into(),
            }),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SegmentStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Probing,
    Segmenting,
    Transcoding,
    Assembling,
    CleaningUp,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Created, Probing)
                | (Probing, Segmenting)
                | (Segmenting, Transcoding)
                | (Transcoding, Assembling)
                | (Assembling, CleaningUp)
                | (CleaningUp, Done)
                | (Probing, Failed)
                | (Transcoding, Failed)
                | (Assembling, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Created => "created",
            JobState::Probing => "probing",
            JobState::Segmenting => "segmenting",
            JobState::Transcoding => "transcoding",
            JobState::Assembling => "assembling",
            JobState::CleaningUp => "cleaning up",
            JobState::Done => "done",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// What an external dispatcher submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    pub bucket: String,
    pub key: String,
    pub segment_size_seconds: f64,
}

impl JobInput {
    pub fn validate(&self) -> Result<(), SegmentationError> {
        if self.segment_size_seconds.is_finite() && self.segment_size_seconds > 0.0 {
            Ok(())
        } else {
            Err(SegmentationError::InvalidSegmentSize(
                self.segment_size_seconds,
            ))
        }
    }
}

/// Outcome of the best-effort cleanup stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub failed: Vec<FailedDeletion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDeletion {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub job_id: Uuid,
    pub final_artifact_location: String,
    pub segment_count: usize,
    pub cleanup: CleanupReport,
}

/// The unit of work and isolation for one source asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source: AssetLocation,
    pub segment_size: f64,
    pub asset: Option<MediaAsset>,
    pub segments: Vec<Segment>,
    pub results: Vec<SegmentResult>,
    pub final_artifact_location: Option<String>,
    state: JobState,
    history: Vec<JobState>,
}

impl Job {
    pub fn new(input: &JobInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: AssetLocation::new(&input.bucket, &input.key),
            segment_size: input.segment_size_seconds,
            asset: None,
            segments: Vec::new(),
            results: Vec::new(),
            final_artifact_location: None,
            state: JobState::Created,
            history: vec![JobState::Created],
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Every state the job has entered, in order.
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Storage keys of artifacts that were successfully written.
    pub fn intermediate_artifacts(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|result| result.is_success())
            .map(|result| result.artifact_location.clone())
            .collect()
    }
}
