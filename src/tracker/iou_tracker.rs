//! Greedy IoU identity tracker.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::tracker::matching::{self, AssignmentResult, Detection};
use crate::tracker::rect::{Rect, iou_batch};
use crate::tracker::track::{Track, TrackId};

/// Configuration for the IouTracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection to continue an existing track
    pub iou_threshold: f32,
    /// Frames a track may go unmatched before it is destroyed
    pub max_missing_frames: u32,
    /// Only match detections to tracks of the same class
    pub class_aware: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.35,
            max_missing_frames: 10,
            class_aware: true,
        }
    }
}

/// Assigns stable identities to per-frame detections.
///
/// The identity counter belongs to the instance, so two trackers never
/// interfere and ids are never reused within one tracker's lifetime.
#[derive(Debug)]
pub struct IouTracker {
    /// Live tracks, kept in ascending id order
    tracks: Vec<Track>,
    /// Destroyed since the last `drain_removed`
    removed: Vec<Track>,
    next_id: TrackId,
    frame_id: Option<u64>,
    config: TrackerConfig,
}

impl IouTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            tracks: Vec::new(),
            removed: Vec::new(),
            next_id: 1,
            frame_id: None,
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Advance one frame past the previous update.
    pub fn update(&mut self, detections: Vec<Detection>) -> Vec<Track> {
        let frame = self.frame_id.map_or(0, |f| f + 1);
        self.update_frame(frame, detections)
    }

    /// Match `detections` for frame `frame` and return the tracks visible on
    /// it, in ascending id order.
    pub fn update_frame(&mut self, frame: u64, detections: Vec<Detection>) -> Vec<Track> {
        self.frame_id = Some(frame);

        let track_rects: Vec<Rect> = self.tracks.iter().map(|t| t.bbox).collect();
        let det_rects: Vec<Rect> = detections.iter().map(|d| d.bbox).collect();
        let mut ious = iou_batch(&track_rects, &det_rects);

        if self.config.class_aware {
            let track_classes: Vec<i32> = self.tracks.iter().map(|t| t.class_id).collect();
            let det_classes: Vec<i32> = detections.iter().map(|d| d.class_id).collect();
            matching::gate_by_class(&mut ious, &track_classes, &det_classes);
        }

        let AssignmentResult {
            matches,
            unmatched_tracks,
            unmatched_detections,
        } = matching::greedy_assignment(&ious, self.config.iou_threshold);

        let mut detections: Vec<Option<Detection>> = detections.into_iter().map(Some).collect();

        for (row, col) in matches {
            if let Some(det) = detections[col].take() {
                self.tracks[row].update(det, frame);
            }
        }

        for row in unmatched_tracks {
            self.tracks[row].mark_missed();
        }

        // Step: destroy tracks past the miss tolerance
        let max_missing = self.config.max_missing_frames;
        let (keep, expired): (Vec<Track>, Vec<Track>) = self
            .tracks
            .drain(..)
            .partition(|t| t.miss_count <= max_missing);
        self.tracks = keep;
        for mut track in expired {
            trace!(track_id = track.id, frame, "track expired");
            track.mark_removed();
            self.removed.push(track);
        }

        // Step: spawn new tracks, in detection order
        for col in unmatched_detections {
            if let Some(det) = detections[col].take() {
                let id = self.next_id;
                self.next_id += 1;
                trace!(track_id = id, frame, "track spawned");
                self.tracks.push(Track::spawn(id, det, frame));
            }
        }

        self.tracks
            .iter()
            .filter(|t| t.is_visible())
            .cloned()
            .collect()
    }

    /// All live tracks, including ones currently unmatched.
    pub fn live_tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Tracks destroyed since the previous call.
    pub fn drain_removed(&mut self) -> Vec<Track> {
        std::mem::take(&mut self.removed)
    }

    /// Forget all tracks. The id counter keeps counting.
    pub fn clear(&mut self) {
        self.removed.append(&mut self.tracks);
        for track in &mut self.removed {
            track.mark_removed();
        }
    }
}
