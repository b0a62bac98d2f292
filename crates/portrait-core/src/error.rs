use std::path::PathBuf;

use thiserror::Error;

use crate::video::VideoError;

/// Failure of a single animation request.
#[derive(Error, Debug)]
pub enum AnimationError {
    #[error("failed to load source image {}: {source}", path.display())]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("no face detected by any detection strategy")]
    NoFaceDetected,

    #[error("landmark detection failed: {0}")]
    Detector(#[from] DetectorError),

    #[error("failed to write video {}: {source}", path.display())]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: VideoError,
    },

    #[error("invalid animation request: {0}")]
    InvalidRequest(String),

    #[error("animation cancelled")]
    Cancelled,
}

/// Run-time failure inside a face detector or the landmark predictor.
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("{detector}: inference failed: {reason}")]
    Inference {
        detector: &'static str,
        reason: String,
    },

    #[error("{detector}: unexpected model output: {reason}")]
    Output {
        detector: &'static str,
        reason: String,
    },

    #[error("predictor returned {0} points, expected 68")]
    LandmarkCount(usize),
}

/// Failure while loading detector or predictor models at start-up.
#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("model file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("failed to read model {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid model {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },

    #[error("failed to create ONNX Runtime session for {}: {reason}", path.display())]
    Session { path: PathBuf, reason: String },
}
