//! Per-frame geometric transform synthesis.
//!
//! Every frame is the source image rotated about a fixed pivot and scaled
//! uniformly. Both parameters are pure functions of animation progress
//! `p = frame_index / total_frames`:
//!
//! - `angle = 360 · p` degrees, linear, no easing
//! - `scale = 0.9 + 0.1 · sin(4π · p)`, two pulsation cycles over the clip
//!
//! The affine matrix follows the `getRotationMatrix2D(center, angle, scale)`
//! convention, so positive angles rotate counter-clockwise as seen on screen.

use std::f64::consts::PI;

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use serde::Serialize;

use crate::landmarks::Point;

/// Output frame rate of every animation.
pub const FPS: u32 = 30;

/// Default clip length in seconds.
pub const DEFAULT_DURATION_SECS: f64 = 4.0;

/// Number of frames for a clip of `duration_secs`, or `None` when the
/// duration is not finite, not positive, or rounds to zero frames.
pub fn total_frames(duration_secs: f64) -> Option<usize> {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return None;
    }
    let frames = (duration_secs * FPS as f64).round();
    if frames < 1.0 || frames > u32::MAX as f64 {
        return None;
    }
    Some(frames as usize)
}

/// Animation progress of `frame_index` in `[0, 1)`.
pub fn progress(frame_index: usize, total_frames: usize) -> f64 {
    frame_index as f64 / total_frames.max(1) as f64
}

/// Rotation plus uniform scale about a fixed pivot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameTransform {
    /// Degrees, counter-clockwise.
    pub angle: f64,
    pub scale: f64,
    pub pivot: Point,
}

impl FrameTransform {
    pub fn identity(pivot: Point) -> Self {
        Self {
            angle: 0.0,
            scale: 1.0,
            pivot,
        }
    }

    /// 2×3 forward matrix mapping source pixels to frame pixels.
    pub fn matrix(&self) -> [[f64; 3]; 2] {
        let theta = self.angle.to_radians();
        let alpha = self.scale * theta.cos();
        let beta = self.scale * theta.sin();
        let cx = self.pivot.x as f64;
        let cy = self.pivot.y as f64;
        [
            [alpha, beta, (1.0 - alpha) * cx - beta * cy],
            [-beta, alpha, beta * cx + (1.0 - alpha) * cy],
        ]
    }

    /// Map a source point into frame coordinates.
    pub fn apply(&self, p: Point) -> Point {
        let [r0, r1] = self.matrix();
        let (x, y) = (p.x as f64, p.y as f64);
        Point::new(
            (r0[0] * x + r0[1] * y + r0[2]) as f32,
            (r1[0] * x + r1[1] * y + r1[2]) as f32,
        )
    }

    fn projection(&self) -> Option<Projection> {
        let [r0, r1] = self.matrix();
        Projection::from_matrix([
            r0[0] as f32,
            r0[1] as f32,
            r0[2] as f32,
            r1[0] as f32,
            r1[1] as f32,
            r1[2] as f32,
            0.0,
            0.0,
            1.0,
        ])
    }
}

/// Transform for a given progress value. Total for any finite input.
pub fn transform_for(progress: f64, pivot: Point) -> FrameTransform {
    FrameTransform {
        angle: progress * 360.0,
        scale: 0.9 + 0.1 * (progress * 4.0 * PI).sin(),
        pivot,
    }
}

/// Warp the whole source through `transform` with bilinear sampling.
///
/// Output has the source dimensions. Pre-images inside `[0, w) × [0, h)`
/// are sampled (the last row and column clamp to the edge); pixels that map
/// from outside the source take `border`.
pub fn warp_frame(source: &RgbImage, transform: &FrameTransform, border: Rgb<u8>) -> RgbImage {
    let (width, height) = source.dimensions();
    let mut frame = RgbImage::from_pixel(width, height, border);
    if width == 0 || height == 0 {
        return frame;
    }
    // Only reachable with a zero scale, which transform_for never produces.
    let Some(projection) = transform.projection() else {
        return frame;
    };
    warp_into(
        &replicate_far_edges(source),
        &projection,
        Interpolation::Bilinear,
        border,
        &mut frame,
    );
    frame
}

/// Copy of `source` one pixel wider and taller, the extra column and row
/// repeating the last ones. Bilinear sampling needs a right and bottom
/// neighbour for every pre-image.
fn replicate_far_edges(source: &RgbImage) -> RgbImage {
    let (width, height) = source.dimensions();
    RgbImage::from_fn(width + 1, height + 1, |x, y| {
        *source.get_pixel(x.min(width - 1), y.min(height - 1))
    })
}
