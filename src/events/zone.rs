use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tracker::Point;

/// Largest coordinate accepted for rectangle zones.
pub const MAX_ZONE_COORD: f64 = 10_000.0;
pub const MAX_ZONE_NAME_LEN: usize = 80;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ZoneError {
    #[error("zone name must not be empty")]
    EmptyName,
    #[error("zone name '{0}' exceeds 80 characters")]
    NameTooLong(String),
    #[error("zone '{0}' has coordinates outside [0, 10000]")]
    OutOfRange(String),
    #[error("zone '{0}' must have a non-zero area")]
    ZeroArea(String),
    #[error("zone '{0}' polygon needs at least 3 vertices")]
    TooFewVertices(String),
    #[error("zone name '{0}' is used more than once")]
    Duplicate(String),
}

/// Geometry of a zone. Rectangles deserialize from `{x1, y1, x2, y2}`,
/// polygons from `{points: [{x, y}, ...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ZoneShape {
    Rect { x1: f64, y1: f64, x2: f64, y2: f64 },
    Polygon { points: Vec<Point> },
}

/// Named monitoring region, fixed for the duration of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    #[serde(flatten)]
    pub shape: ZoneShape,
}

impl Zone {
    pub fn rect(name: impl Into<String>, x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            name: name.into(),
            shape: ZoneShape::Rect { x1, y1, x2, y2 },
        }
    }

    pub fn polygon(name: impl Into<String>, points: Vec<Point>) -> Self {
        Self {
            name: name.into(),
            shape: ZoneShape::Polygon { points },
        }
    }

    /// Inclusive point-in-zone test. Polygons use even-odd ray casting.
    pub fn contains(&self, point: &Point) -> bool {
        match &self.shape {
            ZoneShape::Rect { x1, y1, x2, y2 } => {
                *x1 <= point.x && point.x <= *x2 && *y1 <= point.y && point.y <= *y2
            }
            ZoneShape::Polygon { points } => polygon_contains(points, point),
        }
    }

    pub fn area(&self) -> f64 {
        match &self.shape {
            ZoneShape::Rect { x1, y1, x2, y2 } => ((x2 - x1) * (y2 - y1)).abs(),
            ZoneShape::Polygon { points } => shoelace_area(points),
        }
    }

    /// Check the zone and return it with rectangle bounds ordered so that
    /// `x1 < x2` and `y1 < y2`.
    pub fn validated(self) -> Result<Zone, ZoneError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ZoneError::EmptyName);
        }
        if name.chars().count() > MAX_ZONE_NAME_LEN {
            return Err(ZoneError::NameTooLong(name));
        }

        let shape = match self.shape {
            ZoneShape::Rect { x1, y1, x2, y2 } => {
                let in_range = |v: f64| (0.0..=MAX_ZONE_COORD).contains(&v);
                if ![x1, y1, x2, y2].into_iter().all(in_range) {
                    return Err(ZoneError::OutOfRange(name));
                }
                if x1 == x2 || y1 == y2 {
                    return Err(ZoneError::ZeroArea(name));
                }
                ZoneShape::Rect {
                    x1: x1.min(x2),
                    y1: y1.min(y2),
                    x2: x1.max(x2),
                    y2: y1.max(y2),
                }
            }
            ZoneShape::Polygon { points } => {
                if points.len() < 3 {
                    return Err(ZoneError::TooFewVertices(name));
                }
                if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
                    return Err(ZoneError::OutOfRange(name));
                }
                if shoelace_area(&points) <= f64::EPSILON {
                    return Err(ZoneError::ZeroArea(name));
                }
                ZoneShape::Polygon { points }
            }
        };

        Ok(Zone { name, shape })
    }
}

/// Validate every zone and reject duplicate names.
pub fn validate_zones(zones: Vec<Zone>) -> Result<Vec<Zone>, ZoneError> {
    let mut validated: Vec<Zone> = Vec::with_capacity(zones.len());
    for zone in zones {
        let zone = zone.validated()?;
        if validated.iter().any(|z| z.name == zone.name) {
            return Err(ZoneError::Duplicate(zone.name));
        }
        validated.push(zone);
    }
    Ok(validated)
}

fn polygon_contains(points: &[Point], p: &Point) -> bool {
    let mut inside = false;
    let mut j = points.len().wrapping_sub(1);
    for i in 0..points.len() {
        let (a, b) = (&points[i], &points[j]);
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
            if p.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn shoelace_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..points.len() {
        let a = &points[i];
        let b = &points[(i + 1) % points.len()];
        sum += a.x * b.y - b.x * a.y;
    }
    sum.abs() / 2.0
}
