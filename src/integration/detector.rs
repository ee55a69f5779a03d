//! Contracts for the external per-frame collaborators.
//!
//! The runner depends only on these traits, so real inference backends and
//! the deterministic mocks are interchangeable. Every call receives a single
//! frame or track and returns either a result or a [`StageError`], which the
//! runner treats as fatal for the frame.

use crate::error::StageError;
use crate::integration::frame::Frame;
use crate::tracker::{Detection, Mask, Point, Rect, Track};

/// Object detector.
///
/// # Example
///
/// ```ignore
/// use vidpipe_rs::{Detection, DetectionSource, Frame, StageError};
///
/// struct MyDetector;
///
/// impl DetectionSource for MyDetector {
///     fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, StageError> {
///         // Run inference and return detections
///         Ok(vec![])
///     }
/// }
/// ```
pub trait DetectionSource: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, StageError>;
}

/// Produces a binary mask for one detection.
pub trait Segmenter: Send {
    fn segment(&mut self, frame: &Frame, bbox: &Rect) -> Result<Mask, StageError>;
}

/// Visual identity: embeds a track's crop and assigns it to a cluster.
pub trait Identifier: Send {
    fn embed(&mut self, frame: &Frame, track: &Track) -> Result<Vec<f32>, StageError>;

    fn assign_cluster(&mut self, embedding: &[f32]) -> Result<u32, StageError>;
}

/// Scene text reader. `Ok(None)` means nothing legible.
pub trait TextReader: Send {
    fn read_text(&mut self, frame: &Frame, track: &Track) -> Result<Option<String>, StageError>;
}

/// Maps frame coordinates into world coordinates.
pub trait Projector: Send {
    fn project(&self, point: Point) -> Result<Point, StageError>;
}

/// Video source. `Ok(None)` once exhausted.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>, StageError>;

    /// Total frames, when known up front.
    fn len_hint(&self) -> Option<u64> {
        None
    }
}

/// Pass-through projector used when no calibration is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityProjector;

impl Projector for IdentityProjector {
    fn project(&self, point: Point) -> Result<Point, StageError> {
        Ok(point)
    }
}
