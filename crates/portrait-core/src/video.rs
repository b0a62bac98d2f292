//! Output video streams.
//!
//! The animation driver writes frames through the [`VideoEncoder`] /
//! [`VideoSink`] seam. The production encoder is [`FfmpegEncoder`], which
//! spawns the system `ffmpeg` binary and streams raw RGB24 frames to its
//! stdin. `ffmpeg` must be installed; a missing binary surfaces as
//! [`VideoError::Spawn`] when the stream is opened.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, warn};

/// Default codec: MPEG-4 Part 2, the `mp4v` FourCC.
pub const DEFAULT_CODEC: &str = "mpeg4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Error, Debug)]
pub enum VideoError {
    #[error("failed to create output file: {0}")]
    Create(#[source] io::Error),

    #[error("failed to launch `{}`: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("frame is {got_width}x{got_height}, stream is {width}x{height}")]
    FrameSize {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },

    #[error("failed to write frame to encoder: {0}")]
    Write(#[source] io::Error),

    #[error("encoder exited with {status}: {stderr}")]
    EncoderFailed { status: ExitStatus, stderr: String },

    #[error("stream already finished")]
    Finished,
}

/// An open, append-only frame stream.
pub trait VideoSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError>;

    /// Flush and close the container. Further writes fail with
    /// [`VideoError::Finished`].
    fn finish(&mut self) -> Result<(), VideoError>;
}

/// Opens video streams at a path.
pub trait VideoEncoder {
    type Sink: VideoSink;

    fn open(&self, path: &Path, format: StreamFormat) -> Result<Self::Sink, VideoError>;
}

/// Encodes by piping raw frames into an `ffmpeg` subprocess.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: PathBuf,
    codec: String,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg", DEFAULT_CODEC)
    }
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>, codec: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            codec: codec.into(),
        }
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    fn command(&self, path: &Path, format: StreamFormat) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s")
            .arg(format!("{}x{}", format.width, format.height))
            .arg("-r")
            .arg(format.fps.to_string())
            .args(["-i", "-", "-an", "-c:v"])
            .arg(&self.codec)
            .args(["-pix_fmt", "yuv420p"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl VideoEncoder for FfmpegEncoder {
    type Sink = FfmpegSink;

    fn open(&self, path: &Path, format: StreamFormat) -> Result<FfmpegSink, VideoError> {
        let mut child = self
            .command(path, format)
            .spawn()
            .map_err(|source| VideoError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let stdin = child.stdin.take();
        debug!(
            path = %path.display(),
            codec = %self.codec,
            width = format.width,
            height = format.height,
            fps = format.fps,
            "ffmpeg stream opened"
        );
        Ok(FfmpegSink {
            child: Some(child),
            stdin,
            format,
        })
    }
}

pub struct FfmpegSink {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    format: StreamFormat,
}

impl VideoSink for FfmpegSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
        check_size(self.format, frame)?;
        let stdin = self.stdin.as_mut().ok_or(VideoError::Finished)?;
        stdin.write_all(frame.as_raw()).map_err(VideoError::Write)
    }

    fn finish(&mut self) -> Result<(), VideoError> {
        // Closing stdin signals end of stream.
        drop(self.stdin.take());
        let mut child = self.child.take().ok_or(VideoError::Finished)?;

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            // Best effort: the exit status decides success.
            let _ = pipe.read_to_string(&mut stderr);
        }
        let status = child.wait().map_err(VideoError::Write)?;
        if !status.success() {
            return Err(VideoError::EncoderFailed {
                status,
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!("ffmpeg stream dropped without finish; killing encoder");
            drop(self.stdin.take());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Reject frames whose size differs from the stream's.
pub fn check_size(format: StreamFormat, frame: &RgbImage) -> Result<(), VideoError> {
    let (w, h) = frame.dimensions();
    if (w, h) != (format.width, format.height) {
        return Err(VideoError::FrameSize {
            width: format.width,
            height: format.height,
            got_width: w,
            got_height: h,
        });
    }
    Ok(())
}
