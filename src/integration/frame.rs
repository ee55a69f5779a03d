//! Decoded video frame handed to every stage.

use ndarray::{Array3, ArrayView3, s};

use crate::tracker::Rect;

/// One RGB frame, stored as `(height, width, 3)`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub pixels: Array3<u8>,
}

impl Frame {
    pub fn new(index: u64, pixels: Array3<u8>) -> Self {
        Self { index, pixels }
    }

    /// Black frame of the given size.
    pub fn blank(index: u64, width: u32, height: u32) -> Self {
        Self::new(index, Array3::zeros((height as usize, width as usize, 3)))
    }

    pub fn width(&self) -> u32 {
        self.pixels.dim().1 as u32
    }

    pub fn height(&self) -> u32 {
        self.pixels.dim().0 as u32
    }

    /// Pixels under `bbox`, clipped to the frame. Empty when the box lies
    /// outside the frame.
    pub fn crop(&self, bbox: &Rect) -> ArrayView3<'_, u8> {
        let (h, w, _) = self.pixels.dim();
        let [x1, y1, x2, y2] = bbox.to_tlbr();
        let clip = |v: f32, max: usize| (v.max(0.0) as usize).min(max);
        let (x1, x2) = (clip(x1, w), clip(x2, w));
        let (y1, y2) = (clip(y1, h), clip(y2, h));
        self.pixels
            .slice(s![y1..y2.max(y1), x1..x2.max(x1), ..])
    }
}
