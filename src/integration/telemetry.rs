//! Append-only telemetry stream of frame and event records.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::events::{Event, EventKind, Severity};
use crate::tracker::{Point, Rect, Track, TrackId};

/// Per-track snapshot inside a frame record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: TrackId,
    pub label: String,
    pub bbox: Rect,
    pub cluster_id: Option<u32>,
    pub text: Option<String>,
    pub world_position: Option<Point>,
}

impl From<&Track> for TrackRecord {
    fn from(track: &Track) -> Self {
        Self {
            id: track.id,
            label: track.label.clone(),
            bbox: track.bbox,
            cluster_id: track.cluster_id,
            text: track.text.clone(),
            world_position: track.world_position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame: u64,
    pub active_tracks: usize,
    pub events_in_frame: usize,
    pub processing_ms: f64,
    pub tracks: Vec<TrackRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Frame(FrameRecord),
    Event(Event),
}

/// Destination for the runner's telemetry. Implementations must preserve
/// the order records are handed to them.
pub trait TelemetrySink: Send {
    fn record(&mut self, record: TelemetryRecord) -> Result<(), PipelineError>;

    fn flush(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Writes one JSON object per line.
#[derive(Debug)]
pub struct JsonlSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonlSink<BufWriter<File>> {
    /// Create (or truncate) `path`, creating parent directories.
    pub fn create(path: &Path) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> TelemetrySink for JsonlSink<W> {
    fn record(&mut self, record: TelemetryRecord) -> Result<(), PipelineError> {
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PipelineError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps records in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TelemetryRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                TelemetryRecord::Event(event) => Some(event),
                TelemetryRecord::Frame(_) => None,
            })
            .collect()
    }

    pub fn frames(&self) -> Vec<FrameRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                TelemetryRecord::Frame(frame) => Some(frame),
                TelemetryRecord::Event(_) => None,
            })
            .collect()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&mut self, record: TelemetryRecord) -> Result<(), PipelineError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}

/// Query over a persisted event stream.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<EventKind>,
    pub severity: Option<Severity>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        self.kind.is_none_or(|k| k == event.kind)
            && self.severity.is_none_or(|s| s == event.severity)
    }
}

/// Reload events from a JSON-lines telemetry file.
pub fn read_events(path: &Path, filter: &EventFilter) -> Result<Vec<Event>, PipelineError> {
    let reader = BufReader::new(File::open(path)?);
    let limit = filter.limit.unwrap_or(usize::MAX);
    let mut events = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let TelemetryRecord::Event(event) = serde_json::from_str(&line)? {
            if filter.matches(&event) {
                events.push(event);
                if events.len() >= limit {
                    break;
                }
            }
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::collections::BTreeMap;

    fn event(frame: u64, kind: EventKind, severity: Severity) -> Event {
        Event {
            frame,
            kind,
            object_id: 1,
            details: BTreeMap::new(),
            severity,
        }
    }

    #[test]
    fn test_records_are_tagged() {
        let mut sink = JsonlSink::new(Vec::new());
        sink.record(TelemetryRecord::Event(event(3, EventKind::ZoneEntry, Severity::Info)))
            .unwrap();
        let line = String::from_utf8(sink.into_inner()).unwrap();
        let json: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(json["record"], "event");
        assert_eq!(json["type"], "zone_entry");
        assert_eq!(json["frame"], 3);
    }

    #[test]
    fn test_read_events_filters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("run.jsonl");
        let mut sink = JsonlSink::create(&path).unwrap();
        sink.record(TelemetryRecord::Frame(FrameRecord {
            frame: 0,
            active_tracks: 0,
            events_in_frame: 0,
            processing_ms: 0.5,
            tracks: vec![],
        }))
        .unwrap();
        for e in [
            event(1, EventKind::Dwell, Severity::Warning),
            event(2, EventKind::Dwell, Severity::Critical),
            event(3, EventKind::ZoneExit, Severity::Info),
        ] {
            sink.record(TelemetryRecord::Event(e)).unwrap();
        }
        sink.flush().unwrap();

        let all = read_events(&path, &EventFilter::default()).unwrap();
        assert_eq!(all.len(), 3);

        let dwell = read_events(
            &path,
            &EventFilter {
                kind: Some(EventKind::Dwell),
                limit: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(dwell.len(), 1);
        assert_eq!(dwell[0].frame, 1);

        let critical = read_events(
            &path,
            &EventFilter {
                severity: Some(Severity::Critical),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(critical[0].frame, 2);
    }

    #[test]
    fn test_memory_sink_clones_share_buffer() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer
            .record(TelemetryRecord::Event(event(0, EventKind::Proximity, Severity::Warning)))
            .unwrap();
        assert_eq!(sink.events().len(), 1);
        assert!(sink.frames().is_empty());
    }
}
