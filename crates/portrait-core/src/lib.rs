//! portrait-core: landmark-driven portrait animation.
//!
//! Takes one still portrait and renders a short clip of it "coming to life":
//! the face is located and annotated with 68 landmarks, every frame rotates
//! and pulses the image about the landmark centroid, and twice per clip the
//! eyes are closed by filling the re-projected eye contours.
//!
//! Face regions come from SCRFD on ONNX Runtime with a Haar cascade
//! fallback; landmarks come from a dlib-format regression-tree predictor.

pub mod animation;
pub mod blink;
pub mod detect;
pub mod error;
pub mod landmarks;
pub mod motion;
pub mod predictor;
pub mod video;

pub use animation::{
    render_frame, AnimationObserver, AnimationPlan, AnimationReport, AnimationRequest,
    AnimationSettings, Animator, CancelFlag, Phase,
};
pub use detect::{DetectorOptions, FaceDetector, LandmarkDetector, ModelPaths};
pub use error::{AnimationError, DetectorError, ModelLoadError};
pub use landmarks::{FaceRect, LandmarkSet, Point};
pub use motion::{FrameTransform, DEFAULT_DURATION_SECS, FPS};
pub use predictor::ShapePredictor;
pub use video::{FfmpegEncoder, StreamFormat, VideoEncoder, VideoError, VideoSink};
