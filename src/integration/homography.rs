//! Planar homography from frame to world coordinates.

use nalgebra::{DMatrix, Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::StageError;
use crate::integration::detector::Projector;
use crate::tracker::Point;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HomographyError {
    #[error("need at least 4 point correspondences, got {0}")]
    TooFewPoints(usize),
    #[error("point correspondences are degenerate")]
    Degenerate,
    #[error("{image} image points but {world} world points")]
    Mismatched { image: usize, world: usize },
}

/// Frame-to-world calibration given as matching point lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub image_points: Vec<Point>,
    pub world_points: Vec<Point>,
}

impl Calibration {
    pub fn projector(&self) -> Result<HomographyProjector, HomographyError> {
        if self.image_points.len() != self.world_points.len() {
            return Err(HomographyError::Mismatched {
                image: self.image_points.len(),
                world: self.world_points.len(),
            });
        }
        let pairs: Vec<(Point, Point)> = self
            .image_points
            .iter()
            .copied()
            .zip(self.world_points.iter().copied())
            .collect();
        HomographyProjector::from_correspondences(&pairs)
    }
}

/// Projector backed by a 3x3 homography.
#[derive(Debug, Clone, PartialEq)]
pub struct HomographyProjector {
    matrix: Matrix3<f64>,
}

impl HomographyProjector {
    pub fn from_matrix(matrix: Matrix3<f64>) -> Self {
        Self { matrix }
    }

    /// Estimate the homography mapping each `(frame, world)` pair with the
    /// direct linear transform.
    pub fn from_correspondences(pairs: &[(Point, Point)]) -> Result<Self, HomographyError> {
        if pairs.len() < 4 {
            return Err(HomographyError::TooFewPoints(pairs.len()));
        }

        // At least 9 rows so the thin SVD still yields the full right basis.
        let mut a = DMatrix::<f64>::zeros((pairs.len() * 2).max(9), 9);
        for (i, (src, dst)) in pairs.iter().enumerate() {
            let (x, y, u, v) = (src.x, src.y, dst.x, dst.y);
            let r = i * 2;
            a.row_mut(r)
                .copy_from_slice(&[-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u]);
            a.row_mut(r + 1)
                .copy_from_slice(&[0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v]);
        }

        let svd = a.svd(false, true);
        let v_t = svd.v_t.ok_or(HomographyError::Degenerate)?;
        let (smallest, _) = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .ok_or(HomographyError::Degenerate)?;

        let h = v_t.row(smallest);
        if h[8].abs() < 1e-12 {
            return Err(HomographyError::Degenerate);
        }
        let matrix = Matrix3::from_row_slice(&[
            h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8],
        ]) / h[8];

        if matrix.determinant().abs() < 1e-12 {
            return Err(HomographyError::Degenerate);
        }
        Ok(Self { matrix })
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }
}

impl Projector for HomographyProjector {
    fn project(&self, point: Point) -> Result<Point, StageError> {
        let p = self.matrix * Vector3::new(point.x, point.y, 1.0);
        if p.z.abs() < 1e-12 {
            return Err(StageError::Projector(format!(
                "({}, {}) maps to infinity",
                point.x, point.y
            )));
        }
        Ok(Point::new(p.x / p.z, p.y / p.z))
    }
}
