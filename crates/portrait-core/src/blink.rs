//! Eyelid closure.
//!
//! Twice per clip the eyes are "closed" by painting the convex hull of each
//! eye contour solid black. The contours come from the source landmarks
//! re-projected through the same transform that produced the frame, so the
//! patches track the rotated, scaled face.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_line_segment_mut, draw_polygon_mut};
use imageproc::geometry::convex_hull;
use imageproc::point::Point as PixelPoint;

use crate::landmarks::{LandmarkSet, LEFT_EYE, RIGHT_EYE};
use crate::motion::FrameTransform;

/// Blink window in half-clip phase, in tenths: the eyes close while
/// `(2 · progress) mod 1` lies strictly between 0.3 and 0.4.
pub const BLINK_WINDOW_TENTHS: (usize, usize) = (3, 4);

const LID: Rgb<u8> = Rgb([0, 0, 0]);

/// Whether the eyes are closed on frame `index` of a `total`-frame clip.
///
/// The phase `(2 · index mod total) / total` is compared in integers, so a
/// frame landing exactly on a window edge stays open. This gives two windows
/// of width 0.05 in progress: (0.15, 0.2) and (0.65, 0.7).
pub fn blink_at_frame(index: usize, total: usize) -> bool {
    let total = total.max(1);
    let phase = 10 * ((2 * index) % total);
    let (lower, upper) = BLINK_WINDOW_TENTHS;
    phase > lower * total && phase < upper * total
}

/// Paint both eye hulls black on an already transformed frame.
pub fn close_eyelids(
    mut frame: RgbImage,
    landmarks: &LandmarkSet,
    transform: &FrameTransform,
) -> RgbImage {
    let projected: Vec<PixelPoint<i32>> = landmarks
        .points()
        .iter()
        .map(|&p| {
            let q = transform.apply(p).rounded();
            PixelPoint::new(q.x as i32, q.y as i32)
        })
        .collect();

    for eye in [LEFT_EYE, RIGHT_EYE] {
        let mut contour = projected[eye].to_vec();
        contour.sort_by_key(|p| (p.x, p.y));
        contour.dedup();
        if contour.len() < 3 {
            fill_hull(&mut frame, &contour);
            continue;
        }
        let mut hull = convex_hull(contour.as_slice());
        if hull.len() > 1 && hull.first() == hull.last() {
            hull.pop();
        }
        fill_hull(&mut frame, &hull);
    }
    frame
}

fn fill_hull(frame: &mut RgbImage, hull: &[PixelPoint<i32>]) {
    match hull {
        [] => {}
        [p] => {
            if p.x >= 0 && p.y >= 0 && (p.x as u32) < frame.width() && (p.y as u32) < frame.height() {
                frame.put_pixel(p.x as u32, p.y as u32, LID);
            }
        }
        [a, b] => draw_line_segment_mut(
            frame,
            (a.x as f32, a.y as f32),
            (b.x as f32, b.y as f32),
            LID,
        ),
        _ => draw_polygon_mut(frame, hull, LID),
    }
}
