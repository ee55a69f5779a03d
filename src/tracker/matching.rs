//! Matching utilities for IoU-based identity tracking.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::tracker::rect::Rect;
use crate::tracker::track::Mask;

/// Detection input for the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// Bounding box, written as TLBR (x1, y1, x2, y2)
    pub bbox: Rect,
    /// Human readable class label
    pub label: String,
    /// Detection confidence score
    pub score: f32,
    /// Detector class index, `-1` when unknown
    pub class_id: i32,
    /// Segmentation mask attached by the segmenter, if any
    #[serde(skip)]
    pub mask: Option<Mask>,
}

impl Detection {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Self {
        Self::from_rect(Rect::from_tlbr(x1, y1, x2, y2), score)
    }

    pub fn from_rect(bbox: Rect, score: f32) -> Self {
        Self {
            bbox,
            label: "object".to_string(),
            score,
            class_id: -1,
            mask: None,
        }
    }

    pub fn with_class(mut self, class_id: i32, label: impl Into<String>) -> Self {
        self.class_id = class_id;
        self.label = label.into();
        self
    }
}

/// Outcome of associating live tracks (rows) with detections (columns).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentResult {
    /// `(row, col)` pairs, in the order they were accepted
    pub matches: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

/// Exclude pairs whose classes differ by pushing their IoU below any valid
/// threshold.
pub fn gate_by_class(ious: &mut Array2<f32>, track_classes: &[i32], det_classes: &[i32]) {
    let (rows, cols) = ious.dim();
    for i in 0..rows {
        for j in 0..cols {
            if track_classes[i] != det_classes[j] {
                ious[[i, j]] = -1.0;
            }
        }
    }
}

/// Greedy highest-IoU-first assignment.
///
/// Rows must be ordered by ascending track id and columns by detection input
/// order. Candidate pairs need a positive IoU of at least `min_iou`; they are
/// accepted from the highest IoU down, with ties broken by detection order
/// and then by row (track id), so the result depends only on the inputs.
pub fn greedy_assignment(ious: &Array2<f32>, min_iou: f32) -> AssignmentResult {
    let (num_rows, num_cols) = ious.dim();

    let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
    for i in 0..num_rows {
        for j in 0..num_cols {
            let iou = ious[[i, j]];
            if iou > 0.0 && iou >= min_iou {
                candidates.push((iou, j, i));
            }
        }
    }
    candidates.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then_with(|| a.1.cmp(&b.1))
            .then_with(|| a.2.cmp(&b.2))
    });

    let mut row_taken = vec![false; num_rows];
    let mut col_taken = vec![false; num_cols];
    let mut matches = Vec::new();

    for (_, col, row) in candidates {
        if row_taken[row] || col_taken[col] {
            continue;
        }
        row_taken[row] = true;
        col_taken[col] = true;
        matches.push((row, col));
    }

    AssignmentResult {
        matches,
        unmatched_tracks: (0..num_rows).filter(|&i| !row_taken[i]).collect(),
        unmatched_detections: (0..num_cols).filter(|&j| !col_taken[j]).collect(),
    }
}
