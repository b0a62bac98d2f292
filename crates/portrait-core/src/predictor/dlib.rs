//! Reader for dlib's serialised `shape_predictor` files.
//!
//! Layout, in order: format version (1), mean shape as a column matrix, the
//! cascade forests, per-stage anchor indices and per-stage pixel offsets.
//! Integers use dlib's variable-length encoding (control byte with the sign
//! in bit 7 and the byte count in the low nibble, then little-endian bytes);
//! floats are `mantissa · 2^exponent` integer pairs.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use bzip2::read::BzDecoder;

use super::{PredictorFormatError, RegressionTree, ShapePredictor, SplitFeature};
use crate::landmarks::Point;

type Result<T> = std::result::Result<T, PredictorFormatError>;

/// Load a model from disk, decompressing `.bz2` files on the fly.
pub fn load(path: &Path) -> Result<ShapePredictor> {
    let reader = BufReader::new(File::open(path)?);
    if path.extension().is_some_and(|ext| ext == "bz2") {
        read_shape_predictor(BzDecoder::new(reader))
    } else {
        read_shape_predictor(reader)
    }
}

/// Parse a model from an uncompressed byte stream.
pub fn read_shape_predictor<R: Read>(reader: R) -> Result<ShapePredictor> {
    let mut r = DlibReader { inner: reader };

    let version = r.read_int()?;
    if version != 1 {
        return Err(invalid(format!("unsupported shape_predictor version {version}")));
    }

    let initial_shape = r.read_shape()?;
    let num_parts = initial_shape.len();

    let num_stages = r.read_len()?;
    let mut forests = Vec::with_capacity(num_stages);
    for _ in 0..num_stages {
        let num_trees = r.read_len()?;
        let mut forest = Vec::with_capacity(num_trees);
        for _ in 0..num_trees {
            forest.push(r.read_tree(num_parts)?);
        }
        forests.push(forest);
    }

    let anchor_idx = r.read_nested(|r| r.read_len())?;
    let deltas = r.read_nested(|r| Ok(Point::new(r.read_float()?, r.read_float()?)))?;

    ShapePredictor::new(initial_shape, forests, anchor_idx, deltas)
}

fn invalid(msg: String) -> PredictorFormatError {
    PredictorFormatError::Invalid(msg)
}

// Upper bound on any serialised length; the 68-point model stays far below it.
const MAX_LEN: u64 = 1 << 24;

struct DlibReader<R: Read> {
    inner: R,
}

impl<R: Read> DlibReader<R> {
    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_int(&mut self) -> Result<i64> {
        let control = self.read_byte()?;
        let negative = control & 0x80 != 0;
        let size = (control & 0x0F) as usize;
        if size > 8 {
            return Err(invalid(format!("integer of {size} bytes")));
        }

        let mut value: u64 = 0;
        for i in 0..size {
            value |= (self.read_byte()? as u64) << (8 * i);
        }
        let value = value as i64;
        Ok(if negative { -value } else { value })
    }

    fn read_len(&mut self) -> Result<usize> {
        let value = self.read_int()?;
        if value < 0 || value as u64 > MAX_LEN {
            return Err(invalid(format!("bad length {value}")));
        }
        Ok(value as usize)
    }

    fn read_float(&mut self) -> Result<f32> {
        let mantissa = self.read_int()?;
        let exponent = self.read_int()?;
        if mantissa == 0 {
            return Ok(0.0);
        }
        Ok((mantissa as f64 * 2f64.powi(exponent as i32)) as f32)
    }

    /// Column matrix of interleaved x/y values.
    fn read_shape(&mut self) -> Result<Vec<Point>> {
        // Newer dlib writes negated dimensions.
        let rows = self.read_int()?.unsigned_abs();
        let cols = self.read_int()?.unsigned_abs();
        if cols != 1 || rows % 2 != 0 || rows > MAX_LEN {
            return Err(invalid(format!("shape matrix is {rows}x{cols}")));
        }
        (0..rows / 2)
            .map(|_| Ok(Point::new(self.read_float()?, self.read_float()?)))
            .collect()
    }

    fn read_tree(&mut self, num_parts: usize) -> Result<RegressionTree> {
        let num_splits = self.read_len()?;
        let mut splits = Vec::with_capacity(num_splits);
        for _ in 0..num_splits {
            splits.push(SplitFeature {
                idx1: self.read_len()?,
                idx2: self.read_len()?,
                thresh: self.read_float()?,
            });
        }

        let num_leaves = self.read_len()?;
        if num_leaves != num_splits + 1 {
            return Err(invalid(format!(
                "tree with {num_splits} splits has {num_leaves} leaves"
            )));
        }
        let mut leaf_values = Vec::with_capacity(num_leaves);
        for _ in 0..num_leaves {
            let leaf = self.read_shape()?;
            if leaf.len() != num_parts {
                return Err(invalid(format!(
                    "leaf has {} points, shape has {num_parts}",
                    leaf.len()
                )));
            }
            leaf_values.push(leaf);
        }

        Ok(RegressionTree {
            splits,
            leaf_values,
        })
    }

    /// `std::vector<std::vector<T>>`
    fn read_nested<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<Vec<T>>> {
        let outer = self.read_len()?;
        let mut all = Vec::with_capacity(outer);
        for _ in 0..outer {
            let inner = self.read_len()?;
            let mut items = Vec::with_capacity(inner);
            for _ in 0..inner {
                items.push(item(self)?);
            }
            all.push(items);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn write_int(out: &mut Vec<u8>, value: i64) {
        if value == 0 {
            out.push(0);
            return;
        }
        let magnitude = value.unsigned_abs();
        let bytes = magnitude.to_le_bytes();
        let size = 8 - (magnitude.leading_zeros() / 8) as usize;
        out.push(if value < 0 { 0x80 } else { 0 } | size as u8);
        out.extend_from_slice(&bytes[..size]);
    }

    /// Values in these tests are exact multiples of 1/1024.
    fn write_float(out: &mut Vec<u8>, value: f32) {
        write_int(out, (value * 1024.0) as i64);
        write_int(out, -10);
    }

    fn write_shape(out: &mut Vec<u8>, points: &[(f32, f32)]) {
        write_int(out, -(points.len() as i64 * 2));
        write_int(out, -1);
        for &(x, y) in points {
            write_float(out, x);
            write_float(out, y);
        }
    }

    fn model_bytes() -> Vec<u8> {
        let shape = [(0.25, 0.25), (0.75, 0.25), (0.5, 0.75)];
        let mut out = Vec::new();
        write_int(&mut out, 1);
        write_shape(&mut out, &shape);

        // one stage, one stump
        write_int(&mut out, 1);
        write_int(&mut out, 1);
        write_int(&mut out, 1);
        write_int(&mut out, 0);
        write_int(&mut out, 1);
        write_float(&mut out, -2.5);
        write_int(&mut out, 2);
        write_shape(&mut out, &[(0.125, 0.0); 3]);
        write_shape(&mut out, &[(-0.125, 0.0); 3]);

        // anchors
        write_int(&mut out, 1);
        write_int(&mut out, 2);
        write_int(&mut out, 0);
        write_int(&mut out, 2);

        // deltas
        write_int(&mut out, 1);
        write_int(&mut out, 2);
        for v in [0.0, 0.0, 0.5, -0.25] {
            write_float(&mut out, v);
        }
        out
    }

    #[test]
    fn varint_roundtrip_of_signed_values() {
        for value in [0i64, 1, -1, 255, 256, -70000, i32::MAX as i64] {
            let mut buf = Vec::new();
            write_int(&mut buf, value);
            let mut r = DlibReader { inner: Cursor::new(buf) };
            assert_eq!(r.read_int().unwrap(), value);
        }
    }

    #[test]
    fn float_is_mantissa_times_power_of_two() {
        let mut buf = Vec::new();
        write_int(&mut buf, 3);
        write_int(&mut buf, -2);
        write_int(&mut buf, 0);
        write_int(&mut buf, 17);
        let mut r = DlibReader { inner: Cursor::new(buf) };
        assert_eq!(r.read_float().unwrap(), 0.75);
        assert_eq!(r.read_float().unwrap(), 0.0);
    }

    #[test]
    fn parses_a_small_model() {
        let model = read_shape_predictor(Cursor::new(model_bytes())).unwrap();
        assert_eq!(model.num_landmarks(), 3);
        assert_eq!(model.num_cascade_stages(), 1);
        assert_eq!(model.initial_shape[2], Point::new(0.5, 0.75));
        assert_eq!(model.forests[0][0].splits[0].thresh, -2.5);
        assert_eq!(model.anchor_idx[0], vec![0, 2]);
        assert_eq!(model.deltas[0][1], Point::new(0.5, -0.25));
    }

    #[test]
    fn loads_bzip2_compressed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.dat.bz2");
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::fast());
        encoder.write_all(&model_bytes()).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let model = load(&path).unwrap();
        assert_eq!(model.num_landmarks(), 3);
    }

    #[test]
    fn rejects_unknown_version_and_truncation() {
        let mut bytes = model_bytes();
        bytes[1] = 2;
        assert!(matches!(
            read_shape_predictor(Cursor::new(bytes)),
            Err(PredictorFormatError::Invalid(_))
        ));

        let mut bytes = model_bytes();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            read_shape_predictor(Cursor::new(bytes)),
            Err(PredictorFormatError::Io(_))
        ));
    }

    #[test]
    #[ignore = "needs shape_predictor_68_face_landmarks.dat.bz2 in PORTRAIT_MODEL_DIR"]
    fn loads_the_published_68_point_model() {
        let Ok(dir) = std::env::var("PORTRAIT_MODEL_DIR") else {
            return;
        };
        let path = Path::new(&dir).join("shape_predictor_68_face_landmarks.dat.bz2");
        let model = load(&path).unwrap();
        assert_eq!(model.num_landmarks(), 68);
        assert!(model.num_cascade_stages() > 0);
    }
}
