//! Animation driver: decode, detect, plan, render every frame, encode.
//!
//! ```text
//! Idle → ImageLoaded → LandmarksReady → Rendering(0..n) → Finalized
//!                                                    ↘ Failed
//! ```
//!
//! The driver is the only part of the pipeline that touches the filesystem.
//! The output stream is finalized on every exit path, and a temporary output
//! allocated by the driver is removed when the request fails.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::error::{LimitError, LimitErrorKind};
use image::{ImageError, Rgb, RgbImage};
use serde::Serialize;
use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::blink::{blink_at_frame, close_eyelids};
use crate::detect::LandmarkDetector;
use crate::error::AnimationError;
use crate::landmarks::{FaceRect, LandmarkSet, Point};
use crate::motion::{self, transform_for, warp_frame, FrameTransform, DEFAULT_DURATION_SECS, FPS};
use crate::video::{FfmpegEncoder, StreamFormat, VideoEncoder, VideoError, VideoSink};

/// Rendering options shared by every request of an [`Animator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimationSettings {
    /// Fill for pixels that map from outside the source image.
    pub border: Rgb<u8>,
}

impl Default for AnimationSettings {
    fn default() -> Self {
        Self {
            border: Rgb([0, 0, 0]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnimationRequest {
    pub source: PathBuf,
    /// `None` writes to a fresh temporary `.mp4`.
    pub output: Option<PathBuf>,
    pub duration_secs: f64,
}

impl AnimationRequest {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output: None,
            duration_secs: DEFAULT_DURATION_SECS,
        }
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs;
        self
    }
}

/// Pipeline phase reported to an [`AnimationObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    ImageLoaded { width: u32, height: u32 },
    LandmarksReady,
    Rendering { frame: usize, total: usize },
    Finalized,
    Failed,
}

/// Progress hooks. Both methods default to no-ops.
pub trait AnimationObserver {
    fn phase(&mut self, _phase: Phase) {}

    /// Called with every finished frame before it is encoded.
    fn frame(&mut self, _index: usize, _frame: &RgbImage) {}
}

impl AnimationObserver for () {}

/// Cooperative cancellation, checked between frames.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything needed to render any frame of one clip.
#[derive(Debug, Clone)]
pub struct AnimationPlan {
    landmarks: LandmarkSet,
    pivot: Point,
    total_frames: usize,
}

impl AnimationPlan {
    pub fn new(landmarks: LandmarkSet, duration_secs: f64) -> Result<Self, AnimationError> {
        let total_frames = motion::total_frames(duration_secs).ok_or_else(|| {
            AnimationError::InvalidRequest(format!(
                "duration {duration_secs}s yields no frames at {FPS} fps"
            ))
        })?;
        let pivot = landmarks.pivot();
        Ok(Self {
            landmarks,
            pivot,
            total_frames,
        })
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn pivot(&self) -> Point {
        self.pivot
    }

    pub fn landmarks(&self) -> &LandmarkSet {
        &self.landmarks
    }

    pub fn progress(&self, index: usize) -> f64 {
        motion::progress(index, self.total_frames)
    }

    pub fn transform(&self, index: usize) -> FrameTransform {
        transform_for(self.progress(index), self.pivot)
    }

    pub fn blinks(&self, index: usize) -> bool {
        blink_at_frame(index, self.total_frames)
    }
}

/// Render one frame of `plan` from the decoded source.
pub fn render_frame(
    source: &RgbImage,
    plan: &AnimationPlan,
    index: usize,
    settings: &AnimationSettings,
) -> RgbImage {
    let transform = plan.transform(index);
    let frame = warp_frame(source, &transform, settings.border);
    if plan.blinks(index) {
        close_eyelids(frame, plan.landmarks(), &transform)
    } else {
        frame
    }
}

/// Summary of a finished animation.
#[derive(Debug, Clone, Serialize)]
pub struct AnimationReport {
    pub source: PathBuf,
    pub output: PathBuf,
    pub total_frames: usize,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub pivot: Point,
    pub face: FaceRect,
    /// Strategy that located the face.
    pub detector: &'static str,
}

/// Where the encoded clip goes. A temporary path is deleted on drop unless
/// kept.
enum OutputTarget {
    Caller(PathBuf),
    Temporary(TempPath),
}

impl OutputTarget {
    fn resolve(requested: Option<&Path>) -> Result<Self, AnimationError> {
        match requested {
            Some(path) => Ok(Self::Caller(path.to_path_buf())),
            None => tempfile::Builder::new()
                .prefix("portrait-")
                .suffix(".mp4")
                .tempfile()
                .map(|file| Self::Temporary(file.into_temp_path()))
                .map_err(|e| AnimationError::OutputWrite {
                    path: std::env::temp_dir(),
                    source: VideoError::Create(e),
                }),
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Caller(path) => path,
            Self::Temporary(temp) => temp,
        }
    }

    fn keep(self) -> Result<PathBuf, AnimationError> {
        match self {
            Self::Caller(path) => Ok(path),
            Self::Temporary(temp) => temp.keep().map_err(|e| AnimationError::OutputWrite {
                path: e.path.to_path_buf(),
                source: VideoError::Create(e.error),
            }),
        }
    }
}

enum RenderError {
    Cancelled,
    Write(VideoError),
}

/// Long-lived animation service: owns the detector models and the encoder.
pub struct Animator<E: VideoEncoder = FfmpegEncoder> {
    detector: LandmarkDetector,
    encoder: E,
    settings: AnimationSettings,
}

impl<E: VideoEncoder> Animator<E> {
    pub fn new(detector: LandmarkDetector, encoder: E) -> Self {
        Self {
            detector,
            encoder,
            settings: AnimationSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: AnimationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &AnimationSettings {
        &self.settings
    }

    /// Animate `image_path` into `output_path` (or a temporary `.mp4`) and
    /// return where the clip was written.
    pub fn create_animation(
        &mut self,
        image_path: &Path,
        output_path: Option<&Path>,
        duration_secs: f64,
    ) -> Result<PathBuf, AnimationError> {
        let request = AnimationRequest {
            source: image_path.to_path_buf(),
            output: output_path.map(Path::to_path_buf),
            duration_secs,
        };
        self.animate(&request, &mut (), &CancelFlag::new())
            .map(|report| report.output)
    }

    /// Run one request with progress reporting and cancellation.
    pub fn animate(
        &mut self,
        request: &AnimationRequest,
        observer: &mut dyn AnimationObserver,
        cancel: &CancelFlag,
    ) -> Result<AnimationReport, AnimationError> {
        let result = self.run(request, observer, cancel);
        match &result {
            Ok(report) => info!(
                output = %report.output.display(),
                frames = report.total_frames,
                detector = report.detector,
                "animation finished"
            ),
            Err(e) => {
                warn!(source = %request.source.display(), error = %e, "animation failed");
                observer.phase(Phase::Failed);
            }
        }
        result
    }

    fn run(
        &mut self,
        request: &AnimationRequest,
        observer: &mut dyn AnimationObserver,
        cancel: &CancelFlag,
    ) -> Result<AnimationReport, AnimationError> {
        // Reject bad durations before any decoding work.
        if motion::total_frames(request.duration_secs).is_none() {
            return Err(AnimationError::InvalidRequest(format!(
                "duration {}s yields no frames at {FPS} fps",
                request.duration_secs
            )));
        }

        let source = load_source(&request.source)?;
        let (width, height) = source.dimensions();
        observer.phase(Phase::ImageLoaded { width, height });

        let detection = self.detector.detect(&source)?;
        observer.phase(Phase::LandmarksReady);
        let plan = AnimationPlan::new(detection.landmarks, request.duration_secs)?;
        debug!(
            total_frames = plan.total_frames(),
            pivot_x = plan.pivot().x,
            pivot_y = plan.pivot().y,
            "animation planned"
        );

        let target = OutputTarget::resolve(request.output.as_deref())?;
        let write_error = |source: VideoError| AnimationError::OutputWrite {
            path: target.path().to_path_buf(),
            source,
        };
        let format = StreamFormat {
            width,
            height,
            fps: FPS,
        };
        let mut sink = self.encoder.open(target.path(), format).map_err(write_error)?;

        let rendered = self.render_all(&source, &plan, &mut sink, observer, cancel);
        let finished = sink.finish();
        // A render failure outranks the finalisation error it may cause.
        rendered.map_err(|e| match e {
            RenderError::Cancelled => AnimationError::Cancelled,
            RenderError::Write(source) => write_error(source),
        })?;
        finished.map_err(write_error)?;
        observer.phase(Phase::Finalized);

        Ok(AnimationReport {
            source: request.source.clone(),
            output: target.keep()?,
            total_frames: plan.total_frames(),
            fps: FPS,
            width,
            height,
            pivot: plan.pivot(),
            face: detection.region,
            detector: detection.detector,
        })
    }

    fn render_all(
        &self,
        source: &RgbImage,
        plan: &AnimationPlan,
        sink: &mut E::Sink,
        observer: &mut dyn AnimationObserver,
        cancel: &CancelFlag,
    ) -> Result<(), RenderError> {
        let total = plan.total_frames();
        for index in 0..total {
            if cancel.is_cancelled() {
                return Err(RenderError::Cancelled);
            }
            observer.phase(Phase::Rendering {
                frame: index,
                total,
            });
            let frame = render_frame(source, plan, index, &self.settings);
            observer.frame(index, &frame);
            sink.write_frame(&frame).map_err(RenderError::Write)?;
        }
        Ok(())
    }
}

/// Decode the source image as 8-bit RGB.
pub fn load_source(path: &Path) -> Result<RgbImage, AnimationError> {
    let image = image::open(path)
        .map_err(|source| AnimationError::ImageLoad {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(AnimationError::ImageLoad {
            path: path.to_path_buf(),
            source: ImageError::Limits(LimitError::from_kind(LimitErrorKind::DimensionError)),
        });
    }
    Ok(image)
}
