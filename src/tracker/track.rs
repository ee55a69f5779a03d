//! Single identity-stable object track.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::tracker::matching::Detection;
use crate::tracker::rect::{Point, Rect};
use crate::tracker::track_state::TrackState;

/// Identity assigned by the tracker. Monotonic within one tracker instance.
pub type TrackId = u64;

/// Binary segmentation mask, one byte per pixel.
pub type Mask = Array2<u8>;

/// Single object track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    /// Stable identifier for the lifetime of the object's visibility
    pub id: TrackId,
    pub state: TrackState,
    /// Latest matched bounding box
    pub bbox: Rect,
    /// Latest mask from the segmenter, if one was produced
    #[serde(skip)]
    pub mask: Option<Mask>,
    pub class_id: i32,
    pub label: String,
    /// Confidence of the latest matched detection
    pub score: f32,
    pub first_seen_frame: u64,
    pub last_seen_frame: u64,
    /// Consecutive frames without a match; reset on every match
    pub miss_count: u32,
    /// Written by the clustering enrichment stage
    pub cluster_id: Option<u32>,
    /// Written by the text-reading enrichment stage
    pub text: Option<String>,
    /// Written by the spatial projector
    pub world_position: Option<Point>,
}

impl Track {
    /// Start a new track from an unmatched detection.
    pub fn spawn(id: TrackId, detection: Detection, frame: u64) -> Self {
        Self {
            id,
            state: TrackState::Tracked,
            bbox: detection.bbox,
            mask: detection.mask,
            class_id: detection.class_id,
            label: detection.label,
            score: detection.score,
            first_seen_frame: frame,
            last_seen_frame: frame,
            miss_count: 0,
            cluster_id: None,
            text: None,
            world_position: None,
        }
    }

    /// Absorb a matched detection.
    pub fn update(&mut self, detection: Detection, frame: u64) {
        self.bbox = detection.bbox;
        self.mask = detection.mask;
        self.class_id = detection.class_id;
        self.label = detection.label;
        self.score = detection.score;
        self.last_seen_frame = frame;
        self.miss_count = 0;
        self.state = TrackState::Tracked;
    }

    pub fn mark_missed(&mut self) {
        self.miss_count = self.miss_count.saturating_add(1);
        self.state = TrackState::Lost;
    }

    pub fn mark_removed(&mut self) {
        self.state = TrackState::Removed;
    }

    pub fn is_visible(&self) -> bool {
        self.miss_count == 0 && self.state == TrackState::Tracked
    }

    /// Reference point for spatial reasoning: the world position when known,
    /// else the bbox centre in frame coordinates.
    pub fn anchor(&self) -> Point {
        self.world_position.unwrap_or_else(|| self.bbox.center())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_then_match_resets() {
        let mut track = Track::spawn(1, Detection::new(0.0, 0.0, 10.0, 10.0, 0.9), 1);
        track.mark_missed();
        track.mark_missed();
        assert_eq!(track.miss_count, 2);
        assert_eq!(track.state, TrackState::Lost);
        assert!(!track.is_visible());

        track.update(Detection::new(1.0, 1.0, 11.0, 11.0, 0.8), 4);
        assert_eq!(track.miss_count, 0);
        assert_eq!(track.last_seen_frame, 4);
        assert!(track.is_visible());
    }

    #[test]
    fn test_anchor_prefers_world_position() {
        let mut track = Track::spawn(1, Detection::new(0.0, 0.0, 10.0, 20.0, 0.9), 1);
        assert_eq!(track.anchor(), Point::new(5.0, 10.0));

        track.world_position = Some(Point::new(42.0, 7.0));
        assert_eq!(track.anchor(), Point::new(42.0, 7.0));
    }
}
