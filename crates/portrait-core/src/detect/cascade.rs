//! Haar cascade face detection on integral images.
//!
//! Reads OpenCV's boosted cascade XML (`haarcascade_frontalface_default.xml`)
//! and scans it over an image pyramid the way `detectMultiScale` does:
//! the image is shrunk by successive factors of `scale_factor`, every window
//! position is classified, and hits are clustered with `group_rectangles`.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::integral_image::{integral_image, integral_squared_image};
use tracing::{debug, info};

use roxmltree::{Document, Node as XmlNode};

use super::FaceDetector;
use crate::error::{DetectorError, ModelLoadError};
use crate::landmarks::FaceRect;

const NAME: &str = "haar-cascade";

type Integral = ImageBuffer<Luma<u64>, Vec<u64>>;

/// Scan and grouping parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeParams {
    pub scale_factor: f64,
    /// Clusters need more than this many raw hits to be reported.
    /// Zero reports raw hits without grouping.
    pub min_neighbors: usize,
    /// Smallest window, in source pixels.
    pub min_size: (u32, u32),
    pub group_eps: f64,
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.3,
            min_neighbors: 5,
            min_size: (0, 0),
            group_eps: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct WeightedRect {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct WeakClassifier {
    nodes: Vec<Node>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
struct Stage {
    threshold: f64,
    classifiers: Vec<WeakClassifier>,
}

/// Window outcome. Rejection records the stage that rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Face,
    Rejected(usize),
}

/// A boosted cascade of Haar-feature trees.
#[derive(Debug, Clone, PartialEq)]
pub struct HaarCascade {
    width: u32,
    height: u32,
    stages: Vec<Stage>,
    features: Vec<Vec<WeightedRect>>,
}

impl HaarCascade {
    pub fn from_xml(text: &str) -> Result<Self, String> {
        let document = Document::parse(text).map_err(|e| format!("malformed XML: {e}"))?;
        let cascade = child(document.root_element(), "cascade")
            .ok_or("no <cascade> element (old-style cascades are not supported)")?;

        for (field, expected) in [("stageType", "BOOST"), ("featureType", "HAAR")] {
            match child_text(cascade, field) {
                Some(v) if v == expected => {}
                other => return Err(format!("{field} is {other:?}, expected {expected}")),
            }
        }
        let width: u32 = number(cascade, "width")?;
        let height: u32 = number(cascade, "height")?;
        if width < 3 || height < 3 {
            return Err(format!("window {width}x{height} is too small"));
        }

        let features = list(cascade, "features")?
            .into_iter()
            .map(|f| parse_feature(f, width, height))
            .collect::<Result<Vec<_>, _>>()?;
        let stages = list(cascade, "stages")?
            .into_iter()
            .map(|s| parse_stage(s, features.len()))
            .collect::<Result<Vec<_>, _>>()?;
        if stages.is_empty() {
            return Err("cascade has no stages".into());
        }

        Ok(Self {
            width,
            height,
            stages,
            features,
        })
    }

    pub fn window(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Classify the window whose top-left corner is `(x, y)`.
    fn evaluate(&self, sum: &Integral, sqsum: &Integral, x: u32, y: u32) -> Verdict {
        // Contrast normalisation over the window shrunk by one pixel per side.
        let (nw, nh) = (self.width - 2, self.height - 2);
        let area = (nw * nh) as f64;
        let valsum = rect_sum(sum, x + 1, y + 1, nw, nh) as f64;
        let valsq = rect_sum(sqsum, x + 1, y + 1, nw, nh) as f64;
        let nf = area * valsq - valsum * valsum;
        let inv_norm = if nf > 0.0 { 1.0 / nf.sqrt() } else { 1.0 };

        for (index, stage) in self.stages.iter().enumerate() {
            let mut total = 0.0;
            for classifier in &stage.classifiers {
                let mut idx = 0usize;
                let leaf = loop {
                    let node = &classifier.nodes[idx];
                    let value = self.feature_value(node.feature, sum, x, y) * inv_norm;
                    let next = if value < node.threshold {
                        node.left
                    } else {
                        node.right
                    };
                    if next <= 0 {
                        break next.unsigned_abs() as usize;
                    }
                    idx = next as usize;
                };
                total += classifier.leaves[leaf];
            }
            if total < stage.threshold {
                return Verdict::Rejected(index);
            }
        }
        Verdict::Face
    }

    fn feature_value(&self, feature: usize, sum: &Integral, x: u32, y: u32) -> f64 {
        self.features[feature]
            .iter()
            .map(|r| r.weight * rect_sum(sum, x + r.x, y + r.y, r.w, r.h) as f64)
            .sum()
    }
}

fn rect_sum(ii: &Integral, x: u32, y: u32, w: u32, h: u32) -> u64 {
    let at = |x: u32, y: u32| ii.get_pixel(x, y)[0];
    (at(x + w, y + h) + at(x, y)) - (at(x + w, y) + at(x, y + h))
}

fn child<'a, 'input>(parent: XmlNode<'a, 'input>, name: &str) -> Option<XmlNode<'a, 'input>> {
    parent.children().find(|c| c.has_tag_name(name))
}

/// Trimmed text of a named child; an empty element reads as "".
fn child_text<'a>(parent: XmlNode<'a, '_>, name: &str) -> Option<&'a str> {
    child(parent, name).map(|c| c.text().unwrap_or("").trim())
}

fn number<T: std::str::FromStr>(parent: XmlNode, name: &str) -> Result<T, String> {
    child_text(parent, name)
        .ok_or_else(|| format!("missing <{name}>"))?
        .parse()
        .map_err(|_| format!("<{name}> is not a number"))
}

fn numbers<T: std::str::FromStr>(text: &str, what: &str) -> Result<Vec<T>, String> {
    text.split_whitespace()
        .map(|t| t.parse().map_err(|_| format!("bad number `{t}` in {what}")))
        .collect()
}

/// Element children of the named child; comments and whitespace are skipped.
fn list<'a, 'input>(
    parent: XmlNode<'a, 'input>,
    name: &str,
) -> Result<Vec<XmlNode<'a, 'input>>, String> {
    child(parent, name)
        .map(|e| e.children().filter(|c| c.is_element()).collect())
        .ok_or_else(|| format!("missing <{name}>"))
}

fn parse_feature(feature: XmlNode, width: u32, height: u32) -> Result<Vec<WeightedRect>, String> {
    if child_text(feature, "tilted").is_some_and(|t| t != "0") {
        return Err("tilted Haar features are not supported".into());
    }
    let rects = list(feature, "rects")?
        .into_iter()
        .map(|r| {
            let v: Vec<f64> = numbers(r.text().unwrap_or(""), "feature rect")?;
            let &[x, y, w, h, weight] = v.as_slice() else {
                return Err(format!("feature rect has {} values, expected 5", v.len()));
            };
            let rect = WeightedRect {
                x: x as u32,
                y: y as u32,
                w: w as u32,
                h: h as u32,
                weight,
            };
            if x < 0.0 || y < 0.0 || rect.x + rect.w > width || rect.y + rect.h > height {
                return Err(format!("feature rect {x} {y} {w} {h} leaves the window"));
            }
            Ok(rect)
        })
        .collect::<Result<Vec<_>, String>>()?;
    if rects.is_empty() {
        return Err("feature without rects".into());
    }
    Ok(rects)
}

fn parse_stage(stage: XmlNode, num_features: usize) -> Result<Stage, String> {
    let threshold = number(stage, "stageThreshold")?;
    let classifiers = list(stage, "weakClassifiers")?
        .into_iter()
        .map(|c| {
            let raw: Vec<f64> =
                numbers(child_text(c, "internalNodes").unwrap_or(""), "internalNodes")?;
            let leaves: Vec<f64> =
                numbers(child_text(c, "leafValues").unwrap_or(""), "leafValues")?;
            if raw.is_empty() || raw.len() % 4 != 0 {
                return Err(format!("internalNodes has {} values", raw.len()));
            }
            let nodes: Vec<Node> = raw
                .chunks_exact(4)
                .map(|n| Node {
                    left: n[0] as i32,
                    right: n[1] as i32,
                    feature: n[2] as usize,
                    threshold: n[3],
                })
                .collect();
            // Child nodes must come later in the list, so evaluation terminates.
            for (index, node) in nodes.iter().enumerate() {
                let in_range = |link: i32| {
                    if link <= 0 {
                        (link.unsigned_abs() as usize) < leaves.len()
                    } else {
                        (index + 1..nodes.len()).contains(&(link as usize))
                    }
                };
                if node.feature >= num_features || !in_range(node.left) || !in_range(node.right) {
                    return Err("weak classifier references a missing node, leaf or feature".into());
                }
            }
            Ok(WeakClassifier { nodes, leaves })
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok(Stage {
        threshold,
        classifiers,
    })
}

/// Integer rectangle used by the scan and the grouping pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: i32,
    y: i32,
    w: i32,
    h: i32,
}

/// Pyramid factors whose window fits the image and meets `min_size`.
fn scan_factors(image: (u32, u32), window: (u32, u32), params: &CascadeParams) -> Vec<f64> {
    let mut factors = Vec::new();
    let mut factor = 1.0f64;
    while params.scale_factor > 1.0 {
        let win_w = (window.0 as f64 * factor).round() as u32;
        let win_h = (window.1 as f64 * factor).round() as u32;
        if win_w > image.0 || win_h > image.1 {
            break;
        }
        if win_w >= params.min_size.0 && win_h >= params.min_size.1 {
            factors.push(factor);
        }
        factor *= params.scale_factor;
    }
    factors
}

pub struct CascadeDetector {
    cascade: HaarCascade,
    params: CascadeParams,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, params: CascadeParams) -> Self {
        Self { cascade, params }
    }

    pub fn load(path: &Path, params: CascadeParams) -> Result<Self, ModelLoadError> {
        if !path.exists() {
            return Err(ModelLoadError::Missing(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cascade = HaarCascade::from_xml(&text).map_err(|reason| ModelLoadError::Invalid {
            path: path.to_path_buf(),
            reason,
        })?;
        info!(
            path = %path.display(),
            stages = cascade.num_stages(),
            window = ?cascade.window(),
            "Haar cascade loaded"
        );
        Ok(Self::new(cascade, params))
    }

    fn scan(&self, image: &GrayImage) -> Vec<Rect> {
        let (iw, ih) = image.dimensions();
        let (ww, wh) = self.cascade.window();
        let mut hits = Vec::new();

        for factor in scan_factors((iw, ih), (ww, wh), &self.params) {
            let sw = (iw as f64 / factor).round() as u32;
            let sh = (ih as f64 / factor).round() as u32;
            if sw < ww || sh < wh {
                break;
            }
            let scaled = if sw == iw && sh == ih {
                image.clone()
            } else {
                imageops::resize(image, sw, sh, FilterType::Triangle)
            };
            let sum: Integral = integral_image::<_, u64>(&scaled);
            let sqsum: Integral = integral_squared_image::<_, u64>(&scaled);

            let step = if factor > 2.0 { 1 } else { 2 };
            let win_w = (ww as f64 * factor).round() as i32;
            let win_h = (wh as f64 * factor).round() as i32;
            for y in (0..=sh - wh).step_by(step) {
                let mut x = 0;
                while x <= sw - ww {
                    match self.cascade.evaluate(&sum, &sqsum, x, y) {
                        Verdict::Face => hits.push(Rect {
                            x: (x as f64 * factor).round() as i32,
                            y: (y as f64 * factor).round() as i32,
                            w: win_w,
                            h: win_h,
                        }),
                        // Rejected by the first stage: the neighbour is skipped too.
                        Verdict::Rejected(0) => x += step as u32,
                        Verdict::Rejected(_) => {}
                    }
                    x += step as u32;
                }
            }
        }
        hits
    }
}

impl FaceDetector for CascadeDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRect>, DetectorError> {
        let hits = self.scan(image);
        let raw = hits.len();
        let faces: Vec<FaceRect> = if self.params.min_neighbors == 0 {
            hits.into_iter().map(|r| to_face(r, 1)).collect()
        } else {
            group_rectangles(&hits, self.params.min_neighbors, self.params.group_eps)
                .into_iter()
                .map(|(r, n)| to_face(r, n))
                .collect()
        };
        debug!(raw, faces = faces.len(), "cascade detection");
        Ok(faces)
    }
}

fn to_face(r: Rect, neighbours: usize) -> FaceRect {
    FaceRect::new(r.x as f32, r.y as f32, r.w as f32, r.h as f32, neighbours as f32)
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * ((a.w.min(b.w) + a.h.min(b.h)) as f64) * 0.5;
    ((a.x - b.x).abs() as f64) <= delta
        && ((a.y - b.y).abs() as f64) <= delta
        && ((a.x + a.w - b.x - b.w).abs() as f64) <= delta
        && ((a.y + a.h - b.y - b.h).abs() as f64) <= delta
}

/// Equivalence classes of `similar`, numbered in order of first appearance.
fn partition(rects: &[Rect], eps: f64) -> (Vec<usize>, usize) {
    let mut parent: Vec<usize> = (0..rects.len()).collect();
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in 0..i {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[ri] = rj;
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; rects.len()];
    let mut classes = 0;
    let mut labels = Vec::with_capacity(rects.len());
    for i in 0..rects.len() {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels.push(class_of_root[root]);
    }
    (labels, classes)
}

/// Average similar rectangles, keep clusters with more than `threshold`
/// members and drop clusters nested inside a stronger one.
fn group_rectangles(rects: &[Rect], threshold: usize, eps: f64) -> Vec<(Rect, usize)> {
    if rects.is_empty() {
        return Vec::new();
    }
    let (labels, classes) = partition(rects, eps);

    let mut sums = vec![[0i64; 4]; classes];
    let mut counts = vec![0usize; classes];
    for (r, &class) in rects.iter().zip(&labels) {
        let s = &mut sums[class];
        s[0] += r.x as i64;
        s[1] += r.y as i64;
        s[2] += r.w as i64;
        s[3] += r.h as i64;
        counts[class] += 1;
    }
    let averaged: Vec<Rect> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let avg = |v: i64| (v as f64 / n as f64).round() as i32;
            Rect {
                x: avg(s[0]),
                y: avg(s[1]),
                w: avg(s[2]),
                h: avg(s[3]),
            }
        })
        .collect();

    let mut grouped = Vec::new();
    for (i, (r1, &n1)) in averaged.iter().zip(&counts).enumerate() {
        if n1 <= threshold {
            continue;
        }
        let nested = averaged.iter().zip(&counts).enumerate().any(|(j, (r2, &n2))| {
            if j == i || n2 <= threshold {
                return false;
            }
            let dx = (r2.w as f64 * eps).round() as i32;
            let dy = (r2.h as f64 * eps).round() as i32;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.w <= r2.x + r2.w + dx
                && r1.y + r1.h <= r2.y + r2.h + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            grouped.push((*r1, n1));
        }
    }
    grouped
}
