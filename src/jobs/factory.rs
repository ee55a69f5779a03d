//! Builds the runner, frame source and telemetry sink for a job.

use std::path::PathBuf;

use dashmap::DashMap;
use tracing::warn;

use crate::error::PipelineError;
use crate::integration::{
    FrameSource, JsonlSink, MemorySink, PipelineRunner, Stages, SyntheticFrameSource,
    TelemetrySink,
};
use crate::jobs::record::{ArtifactRefs, JobId, JobRecord};
use crate::tracker::TrackerConfig;

/// Everything needed to execute one job.
pub struct PreparedRun {
    pub runner: PipelineRunner,
    pub source: Box<dyn FrameSource>,
    pub sink: Box<dyn TelemetrySink>,
    pub artifacts: ArtifactRefs,
}

pub trait RunnerFactory: Send + Sync + 'static {
    fn prepare(&self, job: &JobRecord) -> Result<PreparedRun, PipelineError>;
}

/// Wires the deterministic mock stages to a synthetic source.
///
/// With an output directory, telemetry goes to `<dir>/<job_id>.jsonl`;
/// without one each job gets its own [`MemorySink`].
#[derive(Debug)]
pub struct MockRunnerFactory {
    outputs_dir: Option<PathBuf>,
    tracker: TrackerConfig,
    frame_size: (u32, u32),
    memory: DashMap<JobId, MemorySink>,
}

impl MockRunnerFactory {
    pub fn new(outputs_dir: Option<PathBuf>, tracker: TrackerConfig) -> Self {
        Self {
            outputs_dir,
            tracker,
            frame_size: (640, 360),
            memory: DashMap::new(),
        }
    }

    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.frame_size = (width, height);
        self
    }

    /// Telemetry buffer of `job` when no output directory is set.
    pub fn memory_sink(&self, job: JobId) -> Option<MemorySink> {
        self.memory.get(&job).map(|sink| sink.clone())
    }

    /// Hand over and forget the buffer of a finished job.
    pub fn take_memory_sink(&self, job: JobId) -> Option<MemorySink> {
        self.memory.remove(&job).map(|(_, sink)| sink)
    }
}

impl RunnerFactory for MockRunnerFactory {
    fn prepare(&self, job: &JobRecord) -> Result<PreparedRun, PipelineError> {
        if !job.params.mock_mode {
            warn!(job_id = %job.id, "real inference backends are not bundled, falling back to mock mode");
        }

        let config = job.params.pipeline_config(self.tracker.clone());
        let (width, height) = self.frame_size;
        let source = SyntheticFrameSource::new(width, height, config.max_frames);

        let (sink, artifacts): (Box<dyn TelemetrySink>, ArtifactRefs) = match &self.outputs_dir {
            Some(dir) => {
                let path = dir.join(format!("{}.jsonl", job.id));
                let sink = JsonlSink::create(&path)?;
                (
                    Box::new(sink),
                    ArtifactRefs {
                        analytics_path: Some(path),
                        video_path: None,
                    },
                )
            }
            None => {
                let sink = MemorySink::new();
                self.memory.insert(job.id, sink.clone());
                (Box::new(sink), ArtifactRefs::default())
            }
        };

        let mut stages = Stages::mock();
        if let Some(calibration) = &job.params.calibration {
            stages = stages.with_projector(calibration.projector()?);
        }

        Ok(PreparedRun {
            runner: PipelineRunner::new(config, stages),
            source: Box::new(source),
            sink,
            artifacts,
        })
    }
}
