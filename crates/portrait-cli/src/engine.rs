use std::path::PathBuf;

use image::RgbImage;
use portrait_core::{
    AnimationError, AnimationObserver, AnimationReport, AnimationRequest, Animator, CancelFlag,
    FfmpegEncoder, LandmarkDetector, ModelLoadError, Phase, FPS,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to load models: {0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error(transparent)]
    Animation(#[from] AnimationError),
    #[error("failed to write thumbnail {}: {source}", path.display())]
    Thumbnail {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One image to animate, plus where to put its thumbnail.
pub struct AnimateJob {
    pub request: AnimationRequest,
    pub thumbnail: Option<PathBuf>,
}

pub struct AnimateOutcome {
    pub report: AnimationReport,
    pub thumbnail: Option<PathBuf>,
}

enum EngineRequest {
    Animate {
        job: AnimateJob,
        progress: mpsc::UnboundedSender<Phase>,
        reply: oneshot::Sender<Result<AnimateOutcome, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    cancel: CancelFlag,
}

impl EngineHandle {
    /// Run one job on the engine thread; phases stream through `progress`.
    pub async fn animate(
        &self,
        job: AnimateJob,
        progress: mpsc::UnboundedSender<Phase>,
    ) -> Result<AnimateOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Animate {
                job,
                progress,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Abort the in-flight job at the next frame boundary. Sticky: later jobs
    /// are cancelled too.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Models are loaded before the thread starts so a missing or corrupt model
/// fails the command immediately.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let paths = config.model_paths();
    let detector = LandmarkDetector::load(&paths, &config.detector_options())?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        strategies = ?detector.strategies().collect::<Vec<_>>(),
        "models loaded"
    );

    let encoder = FfmpegEncoder::new(&config.ffmpeg, config.codec.as_str());
    let mut animator = Animator::new(detector, encoder);
    let cancel = CancelFlag::new();
    let flag = cancel.clone();

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("portrait-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Animate {
                        job,
                        progress,
                        reply,
                    } => {
                        let result = run_animate(&mut animator, job, progress, &flag);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, cancel })
}

fn run_animate(
    animator: &mut Animator,
    job: AnimateJob,
    progress: mpsc::UnboundedSender<Phase>,
    cancel: &CancelFlag,
) -> Result<AnimateOutcome, EngineError> {
    let mut observer = JobObserver::new(progress, job.thumbnail.is_some());
    let report = animator.animate(&job.request, &mut observer, cancel)?;

    let thumbnail = match (job.thumbnail, observer.thumbnail) {
        (Some(path), Some(frame)) => {
            frame.save(&path).map_err(|source| EngineError::Thumbnail {
                path: path.clone(),
                source,
            })?;
            tracing::debug!(path = %path.display(), "thumbnail written");
            Some(path)
        }
        _ => None,
    };

    Ok(AnimateOutcome { report, thumbnail })
}

/// Frame shown as the thumbnail: one second in, or the last frame of a
/// shorter clip.
pub fn thumbnail_index(total_frames: usize) -> usize {
    (FPS as usize).min(total_frames.saturating_sub(1))
}

/// Forwards phases to the CLI and keeps a copy of the thumbnail frame.
struct JobObserver {
    progress: mpsc::UnboundedSender<Phase>,
    want_thumbnail: bool,
    target: Option<usize>,
    thumbnail: Option<RgbImage>,
}

impl JobObserver {
    fn new(progress: mpsc::UnboundedSender<Phase>, want_thumbnail: bool) -> Self {
        Self {
            progress,
            want_thumbnail,
            target: None,
            thumbnail: None,
        }
    }
}

impl AnimationObserver for JobObserver {
    fn phase(&mut self, phase: Phase) {
        if let Phase::Rendering { total, .. } = phase {
            if self.want_thumbnail && self.target.is_none() {
                self.target = Some(thumbnail_index(total));
            }
        }
        // The receiver may already be gone; progress is advisory.
        let _ = self.progress.send(phase);
    }

    fn frame(&mut self, index: usize, frame: &RgbImage) {
        if self.target == Some(index) {
            self.thumbnail = Some(frame.clone());
        }
    }
}
