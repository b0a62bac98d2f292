//! SCRFD face detection (InsightFace `det_10g.onnx`) on ONNX Runtime.
//!
//! The grayscale image is replicated to three channels, letterboxed into the
//! top-left of a 640×640 canvas and normalised with `(v - 127.5) / 128`.
//! The model emits, per stride (8, 16, 32), a score map, box distances and
//! keypoints for two anchors per grid cell. Boxes above the score threshold
//! are decoded, mapped back to source pixels and reduced with NMS.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use super::FaceDetector;
use crate::error::{DetectorError, ModelLoadError};
use crate::landmarks::FaceRect;

const NAME: &str = "scrfd";
const INPUT_SIZE: u32 = 640;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

pub struct ScrfdDetector {
    session: Session,
    score_threshold: f32,
    nms_threshold: f32,
}

impl ScrfdDetector {
    pub fn load(path: &Path, intra_threads: usize) -> Result<Self, ModelLoadError> {
        if !path.exists() {
            return Err(ModelLoadError::Missing(path.to_path_buf()));
        }
        let session_error = |e: String| ModelLoadError::Session {
            path: path.to_path_buf(),
            reason: e,
        };
        let session = Session::builder()
            .map_err(|e| session_error(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| session_error(e.to_string()))?
            .with_intra_threads(intra_threads.max(1))
            .map_err(|e| session_error(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e| session_error(e.to_string()))?;

        info!(path = %path.display(), intra_threads, "SCRFD detector loaded");
        Ok(Self {
            session,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        })
    }
}

impl FaceDetector for ScrfdDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRect>, DetectorError> {
        let (input, det_scale) = preprocess(image);
        let tensor = Tensor::from_array(input).map_err(inference)?;
        let outputs = self.session.run(ort::inputs![tensor]).map_err(inference)?;
        // Score maps then box distances; keypoint maps, when present, follow.
        if outputs.len() < 2 * STRIDES.len() {
            return Err(output(format!("expected at least 6 outputs, got {}", outputs.len())));
        }

        let mut candidates = Vec::new();
        for (level, &stride) in STRIDES.iter().enumerate() {
            let (_, scores) = outputs[level].try_extract_tensor::<f32>().map_err(output)?;
            let (_, distances) = outputs[level + STRIDES.len()]
                .try_extract_tensor::<f32>()
                .map_err(output)?;
            decode_level(
                scores,
                distances,
                stride,
                self.score_threshold,
                det_scale,
                &mut candidates,
            )?;
        }

        let faces = nms(candidates, self.nms_threshold);
        debug!(faces = faces.len(), det_scale, "SCRFD detection");
        Ok(faces)
    }
}

fn inference(e: impl ToString) -> DetectorError {
    DetectorError::Inference {
        detector: NAME,
        reason: e.to_string(),
    }
}

fn output(e: impl ToString) -> DetectorError {
    DetectorError::Output {
        detector: NAME,
        reason: e.to_string(),
    }
}

/// Letterbox into a 1×3×640×640 tensor. Returns the tensor and the factor
/// from source pixels to input pixels.
fn preprocess(image: &GrayImage) -> (Array4<f32>, f32) {
    let (w, h) = image.dimensions();
    let (new_w, new_h) = letterbox_size(w, h);
    let det_scale = new_h as f32 / h.max(1) as f32;
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    // Padding is a zero pixel after normalisation.
    let mut input = Array4::<f32>::from_elem((1, 3, size, size), (0.0 - MEAN) / STD);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let v = (pixel[0] as f32 - MEAN) / STD;
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = v;
        }
    }
    (input, det_scale)
}

fn letterbox_size(w: u32, h: u32) -> (u32, u32) {
    let (w, h) = (w.max(1), h.max(1));
    if h > w {
        let new_w = ((INPUT_SIZE as u64 * w as u64) / h as u64).max(1) as u32;
        (new_w, INPUT_SIZE)
    } else {
        let new_h = ((INPUT_SIZE as u64 * h as u64) / w as u64).max(1) as u32;
        (INPUT_SIZE, new_h)
    }
}

/// Decode one stride level, appending boxes in source-pixel coordinates.
fn decode_level(
    scores: &[f32],
    distances: &[f32],
    stride: u32,
    threshold: f32,
    det_scale: f32,
    out: &mut Vec<FaceRect>,
) -> Result<(), DetectorError> {
    let cells = (INPUT_SIZE / stride) as usize;
    let anchors = cells * cells * ANCHORS_PER_CELL;
    if scores.len() != anchors || distances.len() != anchors * 4 {
        return Err(output(format!(
            "stride {stride}: {} scores and {} distances for {anchors} anchors",
            scores.len(),
            distances.len()
        )));
    }

    let s = stride as f32;
    for (i, &score) in scores.iter().enumerate() {
        if score < threshold {
            continue;
        }
        let cell = i / ANCHORS_PER_CELL;
        let cx = (cell % cells) as f32 * s;
        let cy = (cell / cells) as f32 * s;
        let d = &distances[i * 4..i * 4 + 4];
        let x1 = (cx - d[0] * s) / det_scale;
        let y1 = (cy - d[1] * s) / det_scale;
        let x2 = (cx + d[2] * s) / det_scale;
        let y2 = (cy + d[3] * s) / det_scale;
        out.push(FaceRect::new(x1, y1, x2 - x1, y2 - y1, score));
    }
    Ok(())
}

/// Greedy non-maximum suppression. Output is ordered by descending score.
fn nms(mut candidates: Vec<FaceRect>, iou_threshold: f32) -> Vec<FaceRect> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut keep: Vec<FaceRect> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if keep.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn letterbox_keeps_aspect_ratio() {
        assert_eq!(letterbox_size(640, 480), (640, 480));
        assert_eq!(letterbox_size(1280, 720), (640, 360));
        assert_eq!(letterbox_size(480, 960), (320, 640));
        assert_eq!(letterbox_size(256, 256), (640, 640));
    }

    #[test]
    fn preprocess_places_image_top_left_and_pads() {
        let image = GrayImage::from_pixel(320, 160, Luma([255]));
        let (input, scale) = preprocess(&image);
        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert!((scale - 2.0).abs() < 1e-6);
        let inside = (255.0 - MEAN) / STD;
        let pad = -MEAN / STD;
        assert!((input[[0, 0, 0, 0]] - inside).abs() < 1e-6);
        assert!((input[[0, 2, 319, 639]] - inside).abs() < 1e-6);
        assert!((input[[0, 1, 320, 0]] - pad).abs() < 1e-6);
    }

    #[test]
    fn decodes_distances_around_anchor_centres() {
        let stride = 32;
        let cells = (INPUT_SIZE / stride) as usize;
        let anchors = cells * cells * ANCHORS_PER_CELL;
        let mut scores = vec![0.0; anchors];
        let mut distances = vec![0.0; anchors * 4];

        // Second anchor of cell (x=3, y=2): centre (96, 64)
        let i = (2 * cells + 3) * ANCHORS_PER_CELL + 1;
        scores[i] = 0.9;
        distances[i * 4..i * 4 + 4].copy_from_slice(&[1.0, 1.0, 2.0, 2.0]);

        let mut out = Vec::new();
        decode_level(&scores, &distances, stride, 0.5, 2.0, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        let face = out[0];
        assert_eq!((face.x, face.y), (32.0, 16.0));
        assert_eq!((face.width, face.height), (48.0, 48.0));
        assert_eq!(face.score, 0.9);
    }

    #[test]
    fn rejects_mismatched_output_sizes() {
        let mut out = Vec::new();
        assert!(decode_level(&[0.0; 10], &[0.0; 40], 8, 0.5, 1.0, &mut out).is_err());
    }

    #[test]
    fn nms_drops_overlaps_and_orders_by_score() {
        let a = FaceRect::new(0.0, 0.0, 100.0, 100.0, 0.7);
        let b = FaceRect::new(5.0, 5.0, 100.0, 100.0, 0.9);
        let c = FaceRect::new(300.0, 300.0, 50.0, 50.0, 0.6);
        let kept = nms(vec![a, c, b], 0.4);
        assert_eq!(kept, vec![b, c]);
    }

    #[test]
    #[ignore = "needs det_10g.onnx and ONNX Runtime"]
    fn loads_the_published_model() {
        let Ok(dir) = std::env::var("PORTRAIT_MODEL_DIR") else {
            return;
        };
        let mut detector = ScrfdDetector::load(&Path::new(&dir).join("det_10g.onnx"), 1).unwrap();
        let faces = detector.detect(&GrayImage::from_pixel(320, 240, Luma([128]))).unwrap();
        assert!(faces.is_empty());
    }
}
