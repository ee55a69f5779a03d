//! Job record, parameters and the status state machine.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::enrichment::EnrichmentIntervals;
use crate::error::JobError;
use crate::events::{EventConfig, Zone, validate_zones};
use crate::integration::{Calibration, PipelineConfig, Progress, RunSummary};
use crate::tracker::TrackerConfig;

/// Time-ordered job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_cancel(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn can_retry(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Caller-supplied run parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobParams {
    pub max_frames: u32,
    pub fps: u32,
    pub ocr_interval: u32,
    pub clustering_interval: u32,
    pub mock_mode: bool,
    pub input_path: Option<PathBuf>,
    pub zones: Vec<Zone>,
    pub dwell_seconds: f64,
    pub event_cooldown_frames: u32,
    pub zone_entry_frames: u32,
    pub proximity_distance: Option<f64>,
    /// Maps track positions to world coordinates when set
    pub calibration: Option<Calibration>,
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            max_frames: 240,
            fps: 30,
            ocr_interval: 30,
            clustering_interval: 5,
            mock_mode: true,
            input_path: None,
            zones: Vec::new(),
            dwell_seconds: 3.0,
            event_cooldown_frames: 60,
            zone_entry_frames: 1,
            proximity_distance: None,
            calibration: None,
        }
    }
}

fn check_range(name: &str, value: u32, min: u32, max: u32) -> Result<(), JobError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(JobError::Validation(format!(
            "{name} must be within [{min}, {max}], got {value}"
        )))
    }
}

impl JobParams {
    /// Check every field and normalise the zones. Nothing is created when
    /// this fails.
    pub fn validate(mut self) -> Result<Self, JobError> {
        check_range("max_frames", self.max_frames, 10, 4000)?;
        check_range("fps", self.fps, 1, 120)?;
        check_range("ocr_interval", self.ocr_interval, 1, 300)?;
        check_range("clustering_interval", self.clustering_interval, 1, 120)?;
        check_range("event_cooldown_frames", self.event_cooldown_frames, 1, u32::MAX)?;
        check_range("zone_entry_frames", self.zone_entry_frames, 1, u32::MAX)?;

        if !(self.dwell_seconds.is_finite() && self.dwell_seconds > 0.0) {
            return Err(JobError::Validation(
                "dwell_seconds must be a positive number".into(),
            ));
        }
        if let Some(distance) = self.proximity_distance {
            if !(distance.is_finite() && distance > 0.0) {
                return Err(JobError::Validation(
                    "proximity_distance must be a positive number".into(),
                ));
            }
        }
        if let Some(path) = &self.input_path {
            if path.as_os_str().is_empty() {
                return Err(JobError::Validation("input_path must not be empty".into()));
            }
        }

        if let Some(calibration) = &self.calibration {
            calibration
                .projector()
                .map_err(|e| JobError::Validation(format!("calibration: {e}")))?;
        }

        self.zones = validate_zones(std::mem::take(&mut self.zones))
            .map_err(|e| JobError::Validation(e.to_string()))?;
        Ok(self)
    }

    pub fn pipeline_config(&self, tracker: TrackerConfig) -> PipelineConfig {
        PipelineConfig {
            max_frames: self.max_frames as u64,
            tracker,
            enrichment: EnrichmentIntervals {
                clustering: self.clustering_interval as u64,
                text_reading: self.ocr_interval as u64,
            },
            events: EventConfig {
                fps: self.fps,
                dwell_seconds: self.dwell_seconds,
                cooldown_frames: self.event_cooldown_frames as u64,
                zone_entry_frames: self.zone_entry_frames,
                proximity_distance: self.proximity_distance,
            },
            zones: self.zones.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRefs {
    pub analytics_path: Option<PathBuf>,
    pub video_path: Option<PathBuf>,
}

/// Durable state of one submitted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub params: JobParams,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: Progress,
    pub error: Option<String>,
    pub artifacts: ArtifactRefs,
    pub summary: Option<RunSummary>,
    pub requested_by: String,
    pub idempotency_key: Option<String>,
    /// Job this one was retried from
    pub retry_of: Option<JobId>,
    pub cancel_requested: bool,
}

impl JobRecord {
    pub fn new(
        params: JobParams,
        requested_by: impl Into<String>,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let total_frames = params.max_frames as u64;
        Self {
            id: JobId::new(),
            status: JobStatus::Queued,
            params,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            progress: Progress {
                frames_processed: 0,
                total_frames,
            },
            error: None,
            artifacts: ArtifactRefs::default(),
            summary: None,
            requested_by: requested_by.into(),
            idempotency_key,
            retry_of: None,
            cancel_requested: false,
        }
    }

    /// Wall time between start and finish.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Mutation applied to a record by the orchestrator or the runner.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// `queued -> running`
    Start { artifacts: ArtifactRefs },
    /// Only while `running`
    Progress(Progress),
    /// Flag a `queued` or `running` job for cooperative cancellation
    RequestCancel,
    /// `running -> completed`, or `cancelled` once a cancel was accepted
    Complete { summary: RunSummary },
    /// `queued | running -> failed`
    Fail {
        error: String,
        summary: Option<RunSummary>,
    },
    /// `queued | running -> cancelled`
    Cancel { summary: Option<RunSummary> },
    /// `queued -> cancelled`, for jobs no worker has picked up
    Withdraw,
}

impl JobUpdate {
    pub fn allowed_from(&self, status: JobStatus) -> bool {
        match self {
            JobUpdate::Start { .. } | JobUpdate::Withdraw => status == JobStatus::Queued,
            JobUpdate::Progress(_) | JobUpdate::Complete { .. } => status == JobStatus::Running,
            JobUpdate::RequestCancel | JobUpdate::Fail { .. } | JobUpdate::Cancel { .. } => {
                status.can_cancel()
            }
        }
    }

    /// Apply to `record` if its current status allows it. Returns whether
    /// anything changed.
    pub fn apply_to(self, record: &mut JobRecord, at: DateTime<Utc>) -> bool {
        if !self.allowed_from(record.status) {
            return false;
        }
        match self {
            JobUpdate::Start { artifacts } => {
                record.status = JobStatus::Running;
                record.started_at = Some(at);
                record.artifacts = artifacts;
            }
            JobUpdate::Progress(progress) => record.progress = progress,
            JobUpdate::RequestCancel => record.cancel_requested = true,
            JobUpdate::Complete { summary } => {
                // An accepted cancellation wins over a late completion.
                record.status = if record.cancel_requested {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Completed
                };
                record.progress.frames_processed = summary.frames_processed;
                record.summary = Some(summary);
                record.finished_at = Some(at);
            }
            JobUpdate::Fail { error, summary } => {
                record.status = JobStatus::Failed;
                record.error = Some(error);
                record.summary = summary;
                record.finished_at = Some(at);
            }
            JobUpdate::Cancel { summary } => {
                record.status = JobStatus::Cancelled;
                record.cancel_requested = true;
                record.summary = summary;
                record.finished_at = Some(at);
            }
            JobUpdate::Withdraw => {
                record.status = JobStatus::Cancelled;
                record.cancel_requested = true;
                record.finished_at = Some(at);
            }
        }
        record.updated_at = at;
        true
    }
}
