use std::path::PathBuf;

use portrait_core::detect::CascadeParams;
use portrait_core::{DetectorOptions, ModelPaths, DEFAULT_DURATION_SECS};
use portrait_models::{CASCADE_MODEL, SCRFD_MODEL, SHAPE_PREDICTOR_MODEL};

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the detector and predictor models.
    pub model_dir: PathBuf,
    /// `ffmpeg` binary used to encode clips.
    pub ffmpeg: PathBuf,
    /// `ffmpeg` video codec name.
    pub codec: String,
    /// Clip length when `--duration` is not given.
    pub duration_secs: f64,
    /// ONNX Runtime intra-op threads for SCRFD.
    pub detector_threads: usize,
    /// Run the Haar cascade alone, without loading SCRFD.
    pub skip_primary: bool,
}

impl Config {
    /// Load configuration from `PORTRAIT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            model_dir: var("PORTRAIT_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(portrait_models::default_model_dir),
            ffmpeg: var("PORTRAIT_FFMPEG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
            codec: var("PORTRAIT_CODEC")
                .unwrap_or_else(|| portrait_core::video::DEFAULT_CODEC.to_string()),
            duration_secs: parse_or(var("PORTRAIT_DURATION"), DEFAULT_DURATION_SECS),
            detector_threads: parse_or(var("PORTRAIT_DETECTOR_THREADS"), 1),
            skip_primary: var("PORTRAIT_SKIP_PRIMARY")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths {
            scrfd: (!self.skip_primary).then(|| self.model_dir.join(SCRFD_MODEL)),
            cascade: self.model_dir.join(CASCADE_MODEL),
            shape_predictor: self.model_dir.join(SHAPE_PREDICTOR_MODEL),
        }
    }

    pub fn detector_options(&self) -> DetectorOptions {
        DetectorOptions {
            intra_threads: self.detector_threads.max(1),
            cascade: CascadeParams::default(),
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config(&[]);
        assert_eq!(cfg.ffmpeg, PathBuf::from("ffmpeg"));
        assert_eq!(cfg.codec, "mpeg4");
        assert_eq!(cfg.duration_secs, 4.0);
        assert_eq!(cfg.detector_threads, 1);
        assert!(!cfg.skip_primary);
        assert!(cfg.model_dir.ends_with("portrait/models"));
    }

    #[test]
    fn environment_overrides_defaults() {
        let cfg = config(&[
            ("PORTRAIT_MODEL_DIR", "/opt/models"),
            ("PORTRAIT_FFMPEG", "/usr/local/bin/ffmpeg"),
            ("PORTRAIT_CODEC", "libx264"),
            ("PORTRAIT_DURATION", "2.5"),
            ("PORTRAIT_DETECTOR_THREADS", "4"),
            ("PORTRAIT_SKIP_PRIMARY", "1"),
        ]);
        assert_eq!(cfg.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(cfg.ffmpeg, PathBuf::from("/usr/local/bin/ffmpeg"));
        assert_eq!(cfg.codec, "libx264");
        assert_eq!(cfg.duration_secs, 2.5);
        assert_eq!(cfg.detector_threads, 4);
        assert!(cfg.skip_primary);
    }

    #[test]
    fn unparsable_numbers_fall_back() {
        let cfg = config(&[
            ("PORTRAIT_DURATION", "four"),
            ("PORTRAIT_DETECTOR_THREADS", "-2"),
            ("PORTRAIT_SKIP_PRIMARY", "0"),
        ]);
        assert_eq!(cfg.duration_secs, 4.0);
        assert_eq!(cfg.detector_threads, 1);
        assert!(!cfg.skip_primary);
    }

    #[test]
    fn model_paths_follow_model_dir() {
        let cfg = config(&[("PORTRAIT_MODEL_DIR", "/m")]);
        let paths = cfg.model_paths();
        assert_eq!(paths.scrfd, Some(PathBuf::from("/m/det_10g.onnx")));
        assert_eq!(
            paths.cascade,
            PathBuf::from("/m/haarcascade_frontalface_default.xml")
        );
        assert_eq!(
            paths.shape_predictor,
            PathBuf::from("/m/shape_predictor_68_face_landmarks.dat.bz2")
        );

        let cascade_only = config(&[("PORTRAIT_MODEL_DIR", "/m"), ("PORTRAIT_SKIP_PRIMARY", "yes")]);
        assert_eq!(cascade_only.model_paths().scrfd, None);
    }
}
