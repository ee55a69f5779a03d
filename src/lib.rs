//! Video analytics job engine.
//!
//! Frames flow through an identity tracker, interval-gated enrichment, a
//! spatial projection and a temporal event state machine. Runs are wrapped
//! in rate-limited, idempotent, cancellable jobs.

pub mod clock;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod events;
pub mod integration;
pub mod jobs;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, Settings};
pub use enrichment::{EnrichmentCache, EnrichmentIntervals, EnrichmentStage, EnrichmentValue};
pub use error::{JobError, JobResult, PipelineError, StageError, StoreError};
pub use events::{Event, EventConfig, EventKind, EventStateMachine, Severity, Zone};
pub use integration::{
    DetectionBuilder, DetectionSource, Frame, FrameSource, Identifier, PipelineConfig,
    PipelineRunner, Progress, Projector, RunSummary, Segmenter, Stages, TelemetrySink, TextReader,
};
pub use jobs::{
    JobFilter, JobId, JobOrchestrator, JobParams, JobRecord, JobStatus, JobStore, Submission,
};
pub use tracker::{Detection, IouTracker, Rect, Track, TrackId, TrackerConfig};
