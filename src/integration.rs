//! Frame pipeline runtime and its external collaborators.
//!
//! The runner only depends on the stage contracts in this module, so the
//! deterministic mocks and real inference backends are interchangeable.

mod builder;
mod detector;
mod frame;
mod homography;
mod mock;
mod pipeline;
mod telemetry;

pub use builder::DetectionBuilder;
pub use detector::{
    DetectionSource, FrameSource, Identifier, IdentityProjector, Projector, Segmenter, TextReader,
};
pub use frame::Frame;
pub use homography::{Calibration, HomographyError, HomographyProjector};
pub use mock::{
    BoxSegmenter, IntensityTextReader, MockDetector, MockIdentifier, SyntheticFrameSource,
};
pub use pipeline::{PipelineConfig, PipelineRunner, Progress, RunSummary, Stages};
pub use telemetry::{
    EventFilter, FrameRecord, JsonlSink, MemorySink, TelemetryRecord, TelemetrySink, TrackRecord,
    read_events,
};
