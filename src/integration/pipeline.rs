//! PipelineRunner: drives one job's frames through every stage in order.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::enrichment::{EnrichmentCache, EnrichmentIntervals, EnrichmentStage, EnrichmentValue};
use crate::error::{PipelineError, StageError};
use crate::events::{Event, EventConfig, EventStateMachine, Severity, Zone};
use crate::integration::detector::{
    DetectionSource, FrameSource, Identifier, IdentityProjector, Projector, Segmenter, TextReader,
};
use crate::integration::frame::Frame;
use crate::integration::mock::{BoxSegmenter, IntensityTextReader, MockDetector, MockIdentifier};
use crate::integration::telemetry::{FrameRecord, TelemetryRecord, TelemetrySink, TrackRecord};
use crate::tracker::{IouTracker, Track, TrackerConfig};

/// Everything a run needs besides its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_frames: u64,
    pub tracker: TrackerConfig,
    pub enrichment: EnrichmentIntervals,
    pub events: EventConfig,
    pub zones: Vec<Zone>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_frames: 240,
            tracker: TrackerConfig::default(),
            enrichment: EnrichmentIntervals::default(),
            events: EventConfig::default(),
            zones: Vec::new(),
        }
    }
}

/// The per-frame collaborators of one run.
pub struct Stages {
    pub detector: Box<dyn DetectionSource>,
    pub segmenter: Box<dyn Segmenter>,
    pub identifier: Box<dyn Identifier>,
    pub reader: Box<dyn TextReader>,
    pub projector: Box<dyn Projector>,
}

impl Stages {
    /// Deterministic mock collaborators with an identity projection.
    pub fn mock() -> Self {
        Self {
            detector: Box::new(MockDetector::default()),
            segmenter: Box::new(BoxSegmenter),
            identifier: Box::new(MockIdentifier::default()),
            reader: Box::new(IntensityTextReader),
            projector: Box::new(IdentityProjector),
        }
    }

    pub fn with_projector(mut self, projector: impl Projector + 'static) -> Self {
        self.projector = Box::new(projector);
        self
    }
}

/// Frames processed so far out of the expected total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub frames_processed: u64,
    pub total_frames: u64,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total_frames == 0 {
            0.0
        } else {
            self.frames_processed as f64 / self.total_frames as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub frames_processed: u64,
    pub events_detected: u64,
    pub average_processing_fps: f64,
    /// Set when the run ended on a cancellation signal
    pub stopped_early: bool,
}

/// Sequential, frame-ordered pipeline. One instance per job.
pub struct PipelineRunner {
    config: PipelineConfig,
    stages: Stages,
    tracker: IouTracker,
    cache: EnrichmentCache,
    events: EventStateMachine,
}

impl PipelineRunner {
    pub fn new(config: PipelineConfig, stages: Stages) -> Self {
        Self {
            tracker: IouTracker::new(config.tracker.clone()),
            cache: EnrichmentCache::new(config.enrichment),
            events: EventStateMachine::new(config.events.clone()),
            config,
            stages,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run until the frame cap, the end of `source`, or `cancel` fires.
    ///
    /// Cancellation is checked once per frame boundary. Frame N's telemetry is
    /// fully handed to `sink` before frame N+1 is read.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        sink: &mut dyn TelemetrySink,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<RunSummary, PipelineError> {
        let total_frames = source
            .len_hint()
            .map_or(self.config.max_frames, |n| n.min(self.config.max_frames));
        let mut summary = RunSummary::default();
        let mut busy = Duration::ZERO;

        while summary.frames_processed < self.config.max_frames {
            if cancel.is_cancelled() {
                info!(frames = summary.frames_processed, "run cancelled at frame boundary");
                summary.stopped_early = true;
                break;
            }

            let Some(frame) = source
                .next_frame()
                .map_err(|e| PipelineError::stage(summary.frames_processed, e))?
            else {
                debug!(frames = summary.frames_processed, "frame source exhausted");
                break;
            };

            let started = Instant::now();
            let events = self.process_frame(&frame, sink, started)?;
            busy += started.elapsed();

            summary.frames_processed += 1;
            summary.events_detected += events as u64;
            progress(Progress {
                frames_processed: summary.frames_processed,
                total_frames,
            });
        }

        sink.flush()?;
        let secs = busy.as_secs_f64();
        if secs > 0.0 {
            summary.average_processing_fps = summary.frames_processed as f64 / secs;
        }
        Ok(summary)
    }

    /// Run every stage for one frame and emit its telemetry. Returns the
    /// number of events emitted.
    fn process_frame(
        &mut self,
        frame: &Frame,
        sink: &mut dyn TelemetrySink,
        started: Instant,
    ) -> Result<usize, PipelineError> {
        let index = frame.index;
        let stage_err = |e: StageError| PipelineError::stage(index, e);
        let Stages {
            detector,
            segmenter,
            identifier,
            reader,
            projector,
        } = &mut self.stages;

        let mut detections = detector.detect(frame).map_err(stage_err)?;
        for det in &mut detections {
            det.bbox = det.bbox.clamp_to(frame.width(), frame.height());
            det.mask = Some(segmenter.segment(frame, &det.bbox).map_err(stage_err)?);
        }

        let mut tracks = self.tracker.update_frame(index, detections);

        let mut events: Vec<Event> = Vec::new();
        for removed in self.tracker.drain_removed() {
            self.cache.evict(removed.id);
            events.extend(self.events.retire(removed.id, index));
        }

        for track in &mut tracks {
            enrich(&mut self.cache, identifier.as_mut(), reader.as_mut(), frame, track)
                .map_err(stage_err)?;
            track.world_position = Some(projector.project(track.bbox.center()).map_err(stage_err)?);
        }

        events.extend(self.events.step(&tracks, &self.config.zones, index));
        for event in &events {
            if event.severity >= Severity::Warning {
                warn!(frame = index, kind = %event.kind, object_id = event.object_id, "event");
            } else {
                debug!(frame = index, kind = %event.kind, object_id = event.object_id, "event");
            }
        }

        let emitted = events.len();
        sink.record(TelemetryRecord::Frame(FrameRecord {
            frame: index,
            active_tracks: tracks.len(),
            events_in_frame: emitted,
            processing_ms: started.elapsed().as_secs_f64() * 1000.0,
            tracks: tracks.iter().map(TrackRecord::from).collect(),
        }))?;
        for event in events {
            sink.record(TelemetryRecord::Event(event))?;
        }
        Ok(emitted)
    }
}

fn enrich(
    cache: &mut EnrichmentCache,
    identifier: &mut dyn Identifier,
    reader: &mut dyn TextReader,
    frame: &Frame,
    track: &mut Track,
) -> Result<(), StageError> {
    let cluster = cache.maybe_refresh(track.id, frame.index, EnrichmentStage::Clustering, || {
        let embedding = identifier.embed(frame, track)?;
        identifier
            .assign_cluster(&embedding)
            .map(EnrichmentValue::Cluster)
    })?;
    track.cluster_id = cluster.as_cluster();

    let text = cache.maybe_refresh(track.id, frame.index, EnrichmentStage::TextReading, || {
        reader
            .read_text(frame, track)
            .map(|t| EnrichmentValue::Text(t.unwrap_or_default()))
    })?;
    track.text = text.as_text().filter(|t| !t.is_empty()).map(str::to_string);
    Ok(())
}
