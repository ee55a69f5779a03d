/// Track state enumeration for object tracking lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Matched to a detection on its most recent frame
    #[default]
    Tracked,
    /// Missed on one or more frames but still within the miss tolerance
    Lost,
    /// Destroyed after exceeding the miss tolerance; its id is never reused
    Removed,
}
