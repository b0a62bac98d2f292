//! Facial geometry shared by the detectors, the frame synthesizer and the
//! eyelid compositor.
//!
//! Landmarks follow the 68-point iBUG annotation order used by dlib's
//! `shape_predictor_68_face_landmarks` model:
//!
//! | range   | region    |
//! |---------|-----------|
//! | 0..17   | jaw line  |
//! | 17..27  | eyebrows  |
//! | 27..36  | nose      |
//! | 36..42  | left eye  |
//! | 42..48  | right eye |
//! | 48..68  | mouth     |

use std::ops::Range;

use serde::Serialize;
use thiserror::Error;

/// Number of points in a [`LandmarkSet`].
pub const NUM_LANDMARKS: usize = 68;

pub const JAW: Range<usize> = 0..17;
pub const EYEBROWS: Range<usize> = 17..27;
pub const NOSE: Range<usize> = 27..36;
pub const LEFT_EYE: Range<usize> = 36..42;
pub const RIGHT_EYE: Range<usize> = 42..48;
pub const MOUTH: Range<usize> = 48..68;

/// A 2D point in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Round both coordinates to the nearest integer pixel.
    pub fn rounded(self) -> Self {
        Self {
            x: self.x.round(),
            y: self.y.round(),
        }
    }
}

impl std::ops::Add for Point {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::AddAssign for Point {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl std::ops::Sub for Point {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Axis-aligned face region reported by a face detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FaceRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector-specific confidence (SCRFD probability, cascade neighbour count).
    pub score: f32,
}

impl FaceRect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32, score: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            score,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union with another region.
    pub fn iou(&self, other: &FaceRect) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("expected {NUM_LANDMARKS} landmarks, got {0}")]
pub struct LandmarkCountError(pub usize);

/// Exactly 68 facial landmarks for one face. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSet {
    points: Vec<Point>,
}

impl LandmarkSet {
    pub fn new(points: Vec<Point>) -> Result<Self, LandmarkCountError> {
        if points.len() != NUM_LANDMARKS {
            return Err(LandmarkCountError(points.len()));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn region(&self, range: Range<usize>) -> &[Point] {
        &self.points[range]
    }

    pub fn left_eye(&self) -> &[Point] {
        self.region(LEFT_EYE)
    }

    pub fn right_eye(&self) -> &[Point] {
        self.region(RIGHT_EYE)
    }

    /// Arithmetic mean of all 68 points.
    pub fn centroid(&self) -> Point {
        let n = self.points.len() as f64;
        let (sx, sy) = self
            .points
            .iter()
            .fold((0.0f64, 0.0f64), |(sx, sy), p| (sx + p.x as f64, sy + p.y as f64));
        Point::new((sx / n) as f32, (sy / n) as f32)
    }

    /// Rotation/scale pivot: the centroid rounded to the nearest pixel.
    pub fn pivot(&self) -> Point {
        self.centroid().rounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Vec<Point> {
        (0..NUM_LANDMARKS)
            .map(|i| Point::new((i % 10) as f32, (i / 10) as f32))
            .collect()
    }

    #[test]
    fn rejects_wrong_point_count() {
        let err = LandmarkSet::new(vec![Point::default(); 5]).unwrap_err();
        assert_eq!(err, LandmarkCountError(5));
        assert!(LandmarkSet::new(grid()).is_ok());
    }

    #[test]
    fn eye_contours_are_six_points_at_fixed_indices() {
        let set = LandmarkSet::new(grid()).unwrap();
        assert_eq!(set.left_eye().len(), 6);
        assert_eq!(set.right_eye().len(), 6);
        assert_eq!(set.left_eye()[0], set.points()[36]);
        assert_eq!(set.right_eye()[5], set.points()[47]);
    }

    #[test]
    fn regions_cover_all_points() {
        let total: usize = [JAW, EYEBROWS, NOSE, LEFT_EYE, RIGHT_EYE, MOUTH]
            .into_iter()
            .map(|r| r.len())
            .sum();
        assert_eq!(total, NUM_LANDMARKS);
    }

    #[test]
    fn pivot_is_rounded_centroid() {
        let mut points = vec![Point::new(10.0, 20.0); NUM_LANDMARKS];
        points[0] = Point::new(10.0 + 68.0 * 0.6, 20.0);
        let set = LandmarkSet::new(points).unwrap();
        let c = set.centroid();
        assert!((c.x - 10.6).abs() < 1e-4);
        assert_eq!(set.pivot(), Point::new(11.0, 20.0));
    }

    #[test]
    fn iou_of_identical_and_disjoint_rects() {
        let a = FaceRect::new(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = FaceRect::new(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);

        // Half overlap: inter 50, union 150
        let c = FaceRect::new(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((a.iou(&c) - 1.0 / 3.0).abs() < 1e-6);
    }
}
