use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Bounding box in pixel coordinates.
///
/// Stored as top-left corner plus size (TLWH). On the wire it is written as
/// `[x1, y1, x2, y2]` (TLBR), the shape detectors report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct Rect {
    /// Top-left x coordinate
    pub x: f32,
    /// Top-left y coordinate
    pub y: f32,
    /// Width of the bounding box
    pub width: f32,
    /// Height of the bounding box
    pub height: f32,
}

impl Rect {
    /// Create a new Rect from top-left coordinates and dimensions (TLWH format).
    #[inline]
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Create a Rect from TLBR format (top-left x, top-left y, bottom-right x, bottom-right y).
    #[inline]
    pub fn from_tlbr(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    /// Convert to TLBR format: (x1, y1, x2, y2).
    #[inline]
    pub fn to_tlbr(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }

    /// Convert to TLWH format: (x, y, width, height).
    #[inline]
    pub fn to_tlwh(&self) -> [f32; 4] {
        [self.x, self.y, self.width, self.height]
    }

    /// Centre of the box.
    #[inline]
    pub fn center(&self) -> Point {
        Point::new(
            (self.x + self.width / 2.0) as f64,
            (self.y + self.height / 2.0) as f64,
        )
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Clamp the box into a `width` x `height` frame, keeping at least one
    /// pixel of extent on each axis.
    pub fn clamp_to(&self, width: u32, height: u32) -> Rect {
        let max_x = (width.max(2) - 1) as f32;
        let max_y = (height.max(2) - 1) as f32;
        let [x1, y1, x2, y2] = self.to_tlbr();

        let x1 = x1.clamp(0.0, max_x - 1.0);
        let y1 = y1.clamp(0.0, max_y - 1.0);
        let x2 = x2.min(max_x).max(x1 + 1.0);
        let y2 = y2.min(max_y).max(y1 + 1.0);
        Rect::from_tlbr(x1, y1, x2, y2)
    }

    /// Calculate Intersection over Union (IoU) with another bounding box.
    pub fn iou(&self, other: &Rect) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_width = (x2 - x1).max(0.0);
        let inter_height = (y2 - y1).max(0.0);
        let inter_area = inter_width * inter_height;

        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

impl From<[f32; 4]> for Rect {
    fn from(tlbr: [f32; 4]) -> Self {
        Rect::from_tlbr(tlbr[0], tlbr[1], tlbr[2], tlbr[3])
    }
}

impl From<Rect> for [f32; 4] {
    fn from(rect: Rect) -> Self {
        rect.to_tlbr()
    }
}

/// A point in frame or world coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[inline]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    #[inline]
    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Calculate IoU matrix between two sets of bounding boxes.
///
/// Returns a matrix of shape (M, N) where M is the length of `boxes_a`
/// and N is the length of `boxes_b`.
pub fn iou_batch(boxes_a: &[Rect], boxes_b: &[Rect]) -> Array2<f32> {
    let mut ious = Array2::zeros((boxes_a.len(), boxes_b.len()));
    for (i, a) in boxes_a.iter().enumerate() {
        for (j, b) in boxes_b.iter().enumerate() {
            ious[[i, j]] = a.iou(b);
        }
    }
    ious
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_conversions() {
        let rect = Rect::new(10.0, 20.0, 30.0, 40.0);

        assert_eq!(rect.to_tlwh(), [10.0, 20.0, 30.0, 40.0]);
        assert_eq!(rect.to_tlbr(), [10.0, 20.0, 40.0, 60.0]);
        assert_eq!(rect.center(), Point::new(25.0, 40.0));
    }

    #[test]
    fn test_from_tlbr() {
        let rect = Rect::from_tlbr(10.0, 20.0, 40.0, 60.0);
        assert_eq!(rect.to_tlwh(), [10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_iou() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(5.0, 5.0, 10.0, 10.0);

        // Intersection: 5x5 = 25
        // Union: 100 + 100 - 25 = 175
        let iou = a.iou(&b);
        assert!((iou - 25.0 / 175.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(20.0, 20.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_same_box() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_clamp_to_frame() {
        let rect = Rect::from_tlbr(-20.0, -5.0, 900.0, 50.0).clamp_to(640, 480);
        assert_eq!(rect.to_tlbr(), [0.0, 0.0, 639.0, 50.0]);

        // Degenerate boxes keep one pixel of extent.
        let rect = Rect::from_tlbr(700.0, 10.0, 700.0, 10.0).clamp_to(640, 480);
        assert_eq!(rect.to_tlbr(), [638.0, 10.0, 639.0, 11.0]);
    }

    #[test]
    fn test_serializes_as_tlbr() {
        let rect = Rect::from_tlbr(1.0, 2.0, 3.0, 4.0);
        let json = serde_json::to_string(&rect).unwrap();
        assert_eq!(json, "[1.0,2.0,3.0,4.0]");
        let back: Rect = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rect);
    }
}
