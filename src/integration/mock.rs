//! Deterministic stand-ins for the perception stages.
//!
//! Outputs depend only on the frame index and pixel content, so runs are
//! reproducible end to end.

use ndarray::{Array2, Array3, ArrayView3, Axis};

use crate::error::StageError;
use crate::integration::builder::DetectionBuilder;
use crate::integration::detector::{
    DetectionSource, FrameSource, Identifier, Segmenter, TextReader,
};
use crate::integration::frame::Frame;
use crate::tracker::{Detection, Mask, Rect, Track};

/// Walking "person" plus an orbiting "sports ball".
#[derive(Debug, Clone)]
pub struct MockDetector {
    pub confidence_threshold: f32,
}

impl Default for MockDetector {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
        }
    }
}

impl DetectionSource for MockDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, StageError> {
        let (w, h) = (frame.width(), frame.height());
        if w < 4 || h < 4 {
            return Err(StageError::Detector(format!("frame {w}x{h} is too small")));
        }
        let (wf, hf) = (w as f32, h as f32);
        let t = frame.index as f32;

        let person_w = (0.18 * wf).max(20.0);
        let person_h = (0.5 * hf).max(40.0);
        let person_x = 0.15 * wf + (frame.index % 60) as f32 * 1.8;
        let person_y = 0.25 * hf;
        let person = DetectionBuilder::new()
            .tlbr(person_x, person_y, person_x + person_w, person_y + person_h)
            .score(0.96)
            .class(0, "person")
            .build_within(w, h);

        let angle = t / 7.0;
        let cx = 0.62 * wf + angle.sin() * 0.05 * wf;
        let cy = 0.58 * hf + (angle * 1.4).cos() * 0.06 * hf;
        let radius = (wf.min(hf) * 0.02).max(8.0);
        let ball = DetectionBuilder::new()
            .xywh(cx, cy, radius * 2.0, radius * 2.0)
            .score(0.89)
            .class(32, "sports ball")
            .build_within(w, h);

        Ok([person, ball]
            .into_iter()
            .filter(|d| d.score >= self.confidence_threshold)
            .collect())
    }
}

/// Fills the detection box.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoxSegmenter;

impl Segmenter for BoxSegmenter {
    fn segment(&mut self, frame: &Frame, bbox: &Rect) -> Result<Mask, StageError> {
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        let [x1, y1, x2, y2] = bbox.to_tlbr();
        let mut mask = Array2::zeros((h, w));
        let (x1, x2) = (x1.max(0.0) as usize, (x2.max(0.0) as usize).min(w));
        let (y1, y2) = (y1.max(0.0) as usize, (y2.max(0.0) as usize).min(h));
        for y in y1..y2 {
            for x in x1..x2 {
                mask[[y, x]] = 1;
            }
        }
        Ok(mask)
    }
}

const EMBEDDING_GRID: usize = 4;

/// Online nearest-centroid clustering over downsampled colour embeddings.
#[derive(Debug, Clone)]
pub struct MockIdentifier {
    max_clusters: usize,
    /// Distance beyond which a new cluster is opened, while capacity remains
    spawn_distance: f32,
    centroids: Vec<(Vec<f32>, u32)>,
}

impl Default for MockIdentifier {
    fn default() -> Self {
        Self {
            max_clusters: 3,
            spawn_distance: 0.25,
            centroids: Vec::new(),
        }
    }
}

impl MockIdentifier {
    pub fn cluster_count(&self) -> usize {
        self.centroids.len()
    }
}

impl Identifier for MockIdentifier {
    fn embed(&mut self, frame: &Frame, track: &Track) -> Result<Vec<f32>, StageError> {
        Ok(grid_embedding(frame.crop(&track.bbox)))
    }

    fn assign_cluster(&mut self, embedding: &[f32]) -> Result<u32, StageError> {
        let nearest = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, (c, _))| (i, euclidean(c, embedding)))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        let index = match nearest {
            Some((i, d)) if d <= self.spawn_distance || self.centroids.len() >= self.max_clusters => i,
            _ => {
                self.centroids.push((embedding.to_vec(), 0));
                self.centroids.len() - 1
            }
        };

        let (centroid, members) = &mut self.centroids[index];
        *members += 1;
        let n = *members as f32;
        for (c, v) in centroid.iter_mut().zip(embedding) {
            *c += (v - *c) / n;
        }
        Ok(index as u32)
    }
}

/// Two-digit "jersey number" derived from crop brightness and edges.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntensityTextReader;

impl TextReader for IntensityTextReader {
    fn read_text(&mut self, frame: &Frame, track: &Track) -> Result<Option<String>, StageError> {
        let crop = frame.crop(&track.bbox);
        if crop.is_empty() {
            return Ok(None);
        }
        let gray = crop.map_axis(Axis(2), |px| {
            px.iter().map(|&v| v as f32).sum::<f32>() / px.len() as f32
        });
        let mean = gray.mean().unwrap_or(0.0);
        if mean < 15.0 {
            return Ok(None);
        }

        let (rows, cols) = gray.dim();
        let mut edge = 0.0f32;
        let mut count = 0usize;
        for y in 0..rows {
            for x in 1..cols {
                edge += (gray[[y, x]] - gray[[y, x - 1]]).abs();
                count += 1;
            }
        }
        let edge = if count > 0 { edge / count as f32 } else { 0.0 };

        let value = ((mean * 0.37 + edge * 11.0) as u32 % 99).max(1);
        Ok(Some(format!("{value:02}")))
    }
}

/// Deterministic gradient frames.
#[derive(Debug, Clone)]
pub struct SyntheticFrameSource {
    width: u32,
    height: u32,
    total: u64,
    next: u64,
}

impl SyntheticFrameSource {
    pub fn new(width: u32, height: u32, total: u64) -> Self {
        Self {
            width,
            height,
            total,
            next: 0,
        }
    }
}

impl FrameSource for SyntheticFrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, StageError> {
        if self.next >= self.total {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;

        let shift = (index * 3 % 256) as usize;
        let pixels = Array3::from_shape_fn(
            (self.height as usize, self.width as usize, 3),
            |(y, x, c)| match c {
                0 => ((x + shift) % 256) as u8,
                1 => ((y * 2) % 256) as u8,
                _ => ((x + y) % 256) as u8,
            },
        );
        Ok(Some(Frame::new(index, pixels)))
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.total)
    }
}

fn grid_embedding(crop: ArrayView3<'_, u8>) -> Vec<f32> {
    let (h, w, channels) = crop.dim();
    let mut out = vec![0.0f32; EMBEDDING_GRID * EMBEDDING_GRID * channels];
    if h == 0 || w == 0 {
        return out;
    }
    let mut counts = vec![0u32; EMBEDDING_GRID * EMBEDDING_GRID];
    for ((y, x, c), &v) in crop.indexed_iter() {
        let cell = (y * EMBEDDING_GRID / h) * EMBEDDING_GRID + x * EMBEDDING_GRID / w;
        out[cell * channels + c] += v as f32 / 255.0;
        if c == 0 {
            counts[cell] += 1;
        }
    }
    for (cell, &n) in counts.iter().enumerate() {
        if n > 0 {
            for c in 0..channels {
                out[cell * channels + c] /= n as f32;
            }
        }
    }
    out
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
