//! Face localisation and 68-point landmark extraction.
//!
//! A [`LandmarkDetector`] owns an ordered list of face-region detectors and a
//! shape predictor. Detection runs on a grayscale copy of the frame; the
//! first detector that reports any region wins, the first region it reports
//! is used, and the predictor places the landmarks inside that region.

pub mod cascade;
pub mod scrfd;

use std::path::PathBuf;

use image::{GrayImage, RgbImage};
use tracing::{debug, info};

use crate::error::{AnimationError, DetectorError, ModelLoadError};
use crate::landmarks::{FaceRect, LandmarkSet, NUM_LANDMARKS};
use crate::predictor::ShapePredictor;

pub use cascade::{CascadeDetector, CascadeParams, HaarCascade};
pub use scrfd::ScrfdDetector;

/// A strategy that finds face regions in a grayscale image.
///
/// Implementations return regions in their own native order; the chain
/// never re-ranks them.
pub trait FaceDetector {
    /// Short identifier used in logs and reports.
    fn name(&self) -> &'static str;

    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRect>, DetectorError>;
}

/// Locations of the model files used by [`LandmarkDetector::load`].
#[derive(Debug, Clone)]
pub struct ModelPaths {
    /// SCRFD ONNX model. `None` runs the cascade alone.
    pub scrfd: Option<PathBuf>,
    pub cascade: PathBuf,
    pub shape_predictor: PathBuf,
}

/// Loader options for the detector chain.
#[derive(Debug, Clone, Copy)]
pub struct DetectorOptions {
    /// ONNX Runtime intra-op threads for the primary detector.
    pub intra_threads: usize,
    pub cascade: CascadeParams,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            intra_threads: 1,
            cascade: CascadeParams::default(),
        }
    }
}

/// One face: its region, its landmarks and the strategy that found it.
#[derive(Debug, Clone)]
pub struct Detection {
    pub region: FaceRect,
    pub landmarks: LandmarkSet,
    pub detector: &'static str,
}

pub struct LandmarkDetector {
    detectors: Vec<Box<dyn FaceDetector + Send>>,
    predictor: ShapePredictor,
}

impl LandmarkDetector {
    /// Build from already constructed strategies, tried in the given order.
    pub fn new(
        detectors: Vec<Box<dyn FaceDetector + Send>>,
        predictor: ShapePredictor,
    ) -> Result<Self, DetectorError> {
        if predictor.num_landmarks() != NUM_LANDMARKS {
            return Err(DetectorError::LandmarkCount(predictor.num_landmarks()));
        }
        Ok(Self {
            detectors,
            predictor,
        })
    }

    /// Load SCRFD (when configured), the Haar cascade fallback and the
    /// landmark predictor.
    pub fn load(paths: &ModelPaths, options: &DetectorOptions) -> Result<Self, ModelLoadError> {
        let mut detectors: Vec<Box<dyn FaceDetector + Send>> = Vec::with_capacity(2);
        if let Some(scrfd) = &paths.scrfd {
            detectors.push(Box::new(ScrfdDetector::load(scrfd, options.intra_threads)?));
        }
        detectors.push(Box::new(CascadeDetector::load(&paths.cascade, options.cascade)?));

        let predictor = ShapePredictor::load(&paths.shape_predictor)?;
        if predictor.num_landmarks() != NUM_LANDMARKS {
            return Err(ModelLoadError::Invalid {
                path: paths.shape_predictor.clone(),
                reason: format!(
                    "predictor has {} landmarks, expected {NUM_LANDMARKS}",
                    predictor.num_landmarks()
                ),
            });
        }

        info!(
            strategies = ?detectors.iter().map(|d| d.name()).collect::<Vec<_>>(),
            "landmark detector ready"
        );
        Ok(Self {
            detectors,
            predictor,
        })
    }

    pub fn strategies(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.detectors.iter().map(|d| d.name())
    }

    /// Find the first face and its 68 landmarks.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Detection, AnimationError> {
        let gray = image::imageops::grayscale(image);

        for detector in &mut self.detectors {
            let regions = detector.detect(&gray)?;
            debug!(detector = detector.name(), faces = regions.len(), "face regions");
            let Some(&region) = regions.first() else {
                continue;
            };

            let points = self.predictor.predict(&gray, &region);
            let landmarks = LandmarkSet::new(points)
                .map_err(|e| DetectorError::LandmarkCount(e.0))?;
            info!(
                detector = detector.name(),
                x = region.x,
                y = region.y,
                width = region.width,
                height = region.height,
                "face located"
            );
            return Ok(Detection {
                region,
                landmarks,
                detector: detector.name(),
            });
        }

        Err(AnimationError::NoFaceDetected)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::landmarks::Point;
    use crate::predictor::ShapePredictor;

    /// Reports the same regions for every image.
    pub(crate) struct FixedDetector {
        pub name: &'static str,
        pub regions: Vec<FaceRect>,
    }

    impl FaceDetector for FixedDetector {
        fn name(&self) -> &'static str {
            self.name
        }

        fn detect(&mut self, _image: &GrayImage) -> Result<Vec<FaceRect>, DetectorError> {
            Ok(self.regions.clone())
        }
    }

    struct FailingDetector;

    impl FaceDetector for FailingDetector {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&mut self, _image: &GrayImage) -> Result<Vec<FaceRect>, DetectorError> {
            Err(DetectorError::Inference {
                detector: "failing",
                reason: "boom".into(),
            })
        }
    }

    pub(crate) fn mean_shape_predictor() -> ShapePredictor {
        let shape = (0..NUM_LANDMARKS)
            .map(|i| Point::new((i % 8) as f32 / 7.0, (i / 8) as f32 / 8.0))
            .collect();
        ShapePredictor::new(shape, vec![], vec![], vec![]).unwrap()
    }

    fn fixed(name: &'static str, regions: Vec<FaceRect>) -> Box<dyn FaceDetector + Send> {
        Box::new(FixedDetector { name, regions })
    }

    #[test]
    fn falls_back_when_primary_finds_nothing() {
        let face = FaceRect::new(10.0, 10.0, 50.0, 50.0, 5.0);
        let mut chain = LandmarkDetector::new(
            vec![fixed("primary", vec![]), fixed("fallback", vec![face])],
            mean_shape_predictor(),
        )
        .unwrap();

        let detection = chain.detect(&RgbImage::new(64, 64)).unwrap();
        assert_eq!(detection.detector, "fallback");
        assert_eq!(detection.region, face);
        assert_eq!(detection.landmarks.points().len(), 68);
        assert_eq!(detection.landmarks.points()[0], Point::new(10.0, 10.0));
    }

    #[test]
    fn uses_first_region_of_first_successful_detector() {
        let first = FaceRect::new(0.0, 0.0, 20.0, 20.0, 0.6);
        let second = FaceRect::new(30.0, 30.0, 30.0, 30.0, 0.9);
        let mut chain = LandmarkDetector::new(
            vec![fixed("primary", vec![first, second]), fixed("fallback", vec![second])],
            mean_shape_predictor(),
        )
        .unwrap();

        let detection = chain.detect(&RgbImage::new(64, 64)).unwrap();
        assert_eq!(detection.detector, "primary");
        assert_eq!(detection.region, first);
    }

    #[test]
    fn no_regions_anywhere_is_no_face() {
        let mut chain = LandmarkDetector::new(
            vec![fixed("primary", vec![]), fixed("fallback", vec![])],
            mean_shape_predictor(),
        )
        .unwrap();
        assert!(matches!(
            chain.detect(&RgbImage::new(32, 32)),
            Err(AnimationError::NoFaceDetected)
        ));
    }

    #[test]
    fn detector_failure_propagates() {
        let failing: Box<dyn FaceDetector + Send> = Box::new(FailingDetector);
        let mut chain =
            LandmarkDetector::new(vec![failing, fixed("fallback", vec![])], mean_shape_predictor())
                .unwrap();
        assert!(matches!(
            chain.detect(&RgbImage::new(32, 32)),
            Err(AnimationError::Detector(DetectorError::Inference { .. }))
        ));
    }

    #[test]
    fn rejects_predictors_without_68_points() {
        let five = ShapePredictor::new(vec![Point::default(); 5], vec![], vec![], vec![]).unwrap();
        assert!(matches!(
            LandmarkDetector::new(vec![], five),
            Err(DetectorError::LandmarkCount(5))
        ));
    }
}
