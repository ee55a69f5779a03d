//! Error types shared across the pipeline and job layers.

use std::time::Duration;

use thiserror::Error;

use crate::integration::HomographyError;
use crate::jobs::{JobId, JobStatus};

/// Failure reported by an external per-frame collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("detector failed: {0}")]
    Detector(String),
    #[error("segmenter failed: {0}")]
    Segmenter(String),
    #[error("identifier failed: {0}")]
    Identifier(String),
    #[error("text reader failed: {0}")]
    TextReader(String),
    #[error("projector failed: {0}")]
    Projector(String),
    #[error("frame source failed: {0}")]
    Source(String),
}

/// Unrecoverable error that terminates a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("frame {frame}: {source}")]
    Stage {
        frame: u64,
        #[source]
        source: StageError,
    },
    #[error("telemetry write failed: {0}")]
    Telemetry(#[from] std::io::Error),
    #[error("telemetry encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("calibration rejected: {0}")]
    Calibration(#[from] HomographyError),
}

impl PipelineError {
    pub(crate) fn stage(frame: u64, source: StageError) -> Self {
        PipelineError::Stage { frame, source }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("job {0} already exists")]
    Duplicate(JobId),
    #[error("job {0} not found")]
    Missing(JobId),
}

/// Errors surfaced to callers of the job orchestrator.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job parameters: {0}")]
    Validation(String),
    #[error("rate limit of {limit} requests exceeded for '{caller_id}', retry in {retry_after:?}")]
    RateLimitExceeded {
        caller_id: String,
        limit: u32,
        retry_after: Duration,
    },
    #[error("cannot {action} job {job_id} while it is {status}")]
    InvalidTransition {
        job_id: JobId,
        status: JobStatus,
        action: &'static str,
    },
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error(transparent)]
    Persistence(#[from] StoreError),
    #[error("worker pool is shut down")]
    Shutdown,
}

impl JobError {
    /// Whether the caller may reasonably try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::RateLimitExceeded { .. } | JobError::Persistence(_)
        )
    }
}

pub type JobResult<T> = std::result::Result<T, JobError>;
