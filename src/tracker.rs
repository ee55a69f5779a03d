mod iou_tracker;
mod matching;
mod rect;
mod track;
mod track_state;

pub use iou_tracker::{IouTracker, TrackerConfig};
pub use matching::{AssignmentResult, Detection, gate_by_class, greedy_assignment};
pub use rect::{Point, Rect, iou_batch};
pub use track::{Mask, Track, TrackId};
pub use track_state::TrackState;
