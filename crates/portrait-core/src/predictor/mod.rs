//! 68-point landmark prediction with an ensemble of regression trees.
//!
//! Evaluation follows dlib's `shape_predictor`: the shape starts at the
//! model's mean shape (in face-rect normalised coordinates) and each cascade
//! stage samples pixel intensities at offsets anchored to the current shape,
//! walks every tree in the stage and adds the selected leaf deltas.
//!
//! Models are read from dlib's serialised `.dat` format by [`dlib`].

pub mod dlib;

use std::path::Path;

use image::GrayImage;
use thiserror::Error;
use tracing::info;

use crate::error::ModelLoadError;
use crate::landmarks::{FaceRect, Point};

/// Structural problem in a shape predictor model.
#[derive(Error, Debug)]
pub enum PredictorFormatError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Split test: `pixel[idx1] - pixel[idx2] > thresh` goes left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitFeature {
    pub idx1: usize,
    pub idx2: usize,
    pub thresh: f32,
}

/// Complete binary tree stored breadth-first: node `i` has children
/// `2i + 1` and `2i + 2`; indices past the splits address `leaf_values`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionTree {
    pub splits: Vec<SplitFeature>,
    pub leaf_values: Vec<Vec<Point>>,
}

impl RegressionTree {
    fn leaf(&self, features: &[f32]) -> &[Point] {
        let mut i = 0;
        while i < self.splits.len() {
            let split = &self.splits[i];
            i = if features[split.idx1] - features[split.idx2] > split.thresh {
                2 * i + 1
            } else {
                2 * i + 2
            };
        }
        &self.leaf_values[i - self.splits.len()]
    }
}

#[derive(Debug, Clone)]
pub struct ShapePredictor {
    initial_shape: Vec<Point>,
    forests: Vec<Vec<RegressionTree>>,
    anchor_idx: Vec<Vec<usize>>,
    deltas: Vec<Vec<Point>>,
}

impl ShapePredictor {
    /// Assemble a predictor, checking that every index in the model is in range.
    pub fn new(
        initial_shape: Vec<Point>,
        forests: Vec<Vec<RegressionTree>>,
        anchor_idx: Vec<Vec<usize>>,
        deltas: Vec<Vec<Point>>,
    ) -> Result<Self, PredictorFormatError> {
        let invalid = |msg: String| Err(PredictorFormatError::Invalid(msg));
        let num_parts = initial_shape.len();

        if num_parts == 0 {
            return invalid("empty initial shape".into());
        }
        if forests.len() != anchor_idx.len() || forests.len() != deltas.len() {
            return invalid(format!(
                "{} cascade stages but {} anchor sets and {} delta sets",
                forests.len(),
                anchor_idx.len(),
                deltas.len()
            ));
        }

        for (stage, forest) in forests.iter().enumerate() {
            let anchors = &anchor_idx[stage];
            if anchors.len() != deltas[stage].len() {
                return invalid(format!(
                    "stage {stage}: {} anchors for {} deltas",
                    anchors.len(),
                    deltas[stage].len()
                ));
            }
            if let Some(bad) = anchors.iter().find(|&&a| a >= num_parts) {
                return invalid(format!("stage {stage}: anchor {bad} out of range"));
            }
            for tree in forest {
                if tree.leaf_values.len() != tree.splits.len() + 1 {
                    return invalid(format!(
                        "stage {stage}: tree with {} splits has {} leaves",
                        tree.splits.len(),
                        tree.leaf_values.len()
                    ));
                }
                if tree.splits.iter().any(|s| s.idx1 >= anchors.len() || s.idx2 >= anchors.len()) {
                    return invalid(format!("stage {stage}: split feature out of range"));
                }
                if tree.leaf_values.iter().any(|leaf| leaf.len() != num_parts) {
                    return invalid(format!("stage {stage}: leaf size differs from shape size"));
                }
            }
        }

        Ok(Self {
            initial_shape,
            forests,
            anchor_idx,
            deltas,
        })
    }

    /// Load a dlib `.dat` model, bzip2-compressed when the name ends in `.bz2`.
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        if !path.exists() {
            return Err(ModelLoadError::Missing(path.to_path_buf()));
        }
        let predictor = dlib::load(path).map_err(|e| match e {
            PredictorFormatError::Io(source) => ModelLoadError::Io {
                path: path.to_path_buf(),
                source,
            },
            PredictorFormatError::Invalid(reason) => ModelLoadError::Invalid {
                path: path.to_path_buf(),
                reason,
            },
        })?;
        info!(
            path = %path.display(),
            landmarks = predictor.num_landmarks(),
            stages = predictor.num_cascade_stages(),
            "shape predictor loaded"
        );
        Ok(predictor)
    }

    pub fn num_landmarks(&self) -> usize {
        self.initial_shape.len()
    }

    pub fn num_cascade_stages(&self) -> usize {
        self.forests.len()
    }

    /// Predict landmark positions inside `rect`, rounded to integer pixels.
    pub fn predict(&self, image: &GrayImage, rect: &FaceRect) -> Vec<Point> {
        let to_image = RectFrame::new(rect);
        let mut current = self.initial_shape.clone();
        let mut features = Vec::new();

        for (stage, forest) in self.forests.iter().enumerate() {
            let tform = Similarity::between(&self.initial_shape, &current);

            features.clear();
            features.extend(
                self.anchor_idx[stage]
                    .iter()
                    .zip(&self.deltas[stage])
                    .map(|(&anchor, &delta)| {
                        let p = to_image.map(tform.apply(delta) + current[anchor]).rounded();
                        sample(image, p)
                    }),
            );

            for tree in forest {
                for (point, delta) in current.iter_mut().zip(tree.leaf(&features)) {
                    *point += *delta;
                }
            }
        }

        current
            .into_iter()
            .map(|p| to_image.map(p).rounded())
            .collect()
    }
}

fn sample(image: &GrayImage, p: Point) -> f32 {
    if p.x < 0.0 || p.y < 0.0 {
        return 0.0;
    }
    let (x, y) = (p.x as u32, p.y as u32);
    if x >= image.width() || y >= image.height() {
        return 0.0;
    }
    image.get_pixel(x, y)[0] as f32
}

/// Maps the unit square onto a face rect: (0, 0) to the top-left pixel,
/// (1, 1) to the bottom-right pixel.
#[derive(Debug, Clone, Copy)]
struct RectFrame {
    left: f32,
    top: f32,
    sx: f32,
    sy: f32,
}

impl RectFrame {
    fn new(rect: &FaceRect) -> Self {
        Self {
            left: rect.x,
            top: rect.y,
            sx: rect.width - 1.0,
            sy: rect.height - 1.0,
        }
    }

    fn map(&self, p: Point) -> Point {
        Point::new(self.left + p.x * self.sx, self.top + p.y * self.sy)
    }
}

/// Linear part of the least-squares similarity transform between two shapes:
/// `[[a, -b], [b, a]]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
}

impl Similarity {
    fn between(from: &[Point], to: &[Point]) -> Self {
        let n = from.len().max(1) as f64;
        let mean = |pts: &[Point]| {
            let (sx, sy) = pts
                .iter()
                .fold((0.0f64, 0.0f64), |(sx, sy), p| (sx + p.x as f64, sy + p.y as f64));
            (sx / n, sy / n)
        };
        let (fmx, fmy) = mean(from);
        let (tmx, tmy) = mean(to);

        let (mut norm, mut dot, mut cross) = (0.0f64, 0.0f64, 0.0f64);
        for (f, t) in from.iter().zip(to) {
            let (fx, fy) = (f.x as f64 - fmx, f.y as f64 - fmy);
            let (tx, ty) = (t.x as f64 - tmx, t.y as f64 - tmy);
            norm += fx * fx + fy * fy;
            dot += fx * tx + fy * ty;
            cross += fx * ty - fy * tx;
        }

        if norm <= f64::EPSILON {
            return Self { a: 1.0, b: 0.0 };
        }
        Self {
            a: (dot / norm) as f32,
            b: (cross / norm) as f32,
        }
    }

    fn apply(&self, p: Point) -> Point {
        Point::new(self.a * p.x - self.b * p.y, self.b * p.x + self.a * p.y)
    }
}
