//! Model files the portrait animator needs, where they live, and how to
//! check them.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Model file descriptor: download URL, on-disk name, optional pinned
/// SHA-256 and a human-readable size.
#[derive(Debug)]
pub struct ModelFile {
    pub name: &'static str,
    pub url: &'static str,
    /// Files without a pinned digest are checked against the digest `setup`
    /// recorded next to them (see [`record_digest`]).
    pub sha256: Option<&'static str>,
    pub size_display: &'static str,
}

pub const SCRFD_MODEL: &str = "det_10g.onnx";
pub const SHAPE_PREDICTOR_MODEL: &str = "shape_predictor_68_face_landmarks.dat.bz2";
pub const CASCADE_MODEL: &str = "haarcascade_frontalface_default.xml";

// det_10g digest is the oid of the HuggingFace Git LFS pointer file.
pub const MODELS: &[ModelFile] = &[
    ModelFile {
        name: SCRFD_MODEL,
        url: "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/det_10g.onnx",
        sha256: Some("5838f7fe053675b1c7a08b633df49e7af5495cee0493c7dcf6697200b85b5b91"),
        size_display: "16 MB",
    },
    ModelFile {
        name: SHAPE_PREDICTOR_MODEL,
        url: "https://github.com/davisking/dlib-models/raw/master/shape_predictor_68_face_landmarks.dat.bz2",
        sha256: None,
        size_display: "64 MB",
    },
    ModelFile {
        name: CASCADE_MODEL,
        url: "https://raw.githubusercontent.com/opencv/opencv/4.10.0/data/haarcascades/haarcascade_frontalface_default.xml",
        sha256: None,
        size_display: "930 KB",
    },
];

/// Look up a manifest entry by file name.
pub fn find_model(name: &str) -> Option<&'static ModelFile> {
    MODELS.iter().find(|m| m.name == name)
}

/// Determine the model directory.
///
/// Root gets the system-wide `/var/lib/portrait/models`; everyone else gets
/// `$XDG_DATA_HOME/portrait/models` (`~/.local/share/portrait/models`).
pub fn default_model_dir() -> PathBuf {
    if is_root() {
        PathBuf::from("/var/lib/portrait/models")
    } else {
        let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.local/share")
        });
        PathBuf::from(data_home).join("portrait/models")
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: &'static str, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to record checksum: {path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("recorded checksum is malformed: {path}")]
    MalformedRecord { path: PathBuf },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: &'static str,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// Outcome of checking one model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Digest matches the pinned checksum.
    ChecksumOk,
    /// Digest matches the one recorded when the file was installed.
    RecordedChecksumOk,
    /// File exists; nothing is pinned or recorded for it.
    Present,
}

/// Sidecar holding the digest of an unpinned model, `<name>.sha256`.
pub fn digest_record_path(model: &ModelFile, model_dir: &Path) -> PathBuf {
    model_dir.join(format!("{}.sha256", model.name))
}

/// Hash the installed file and store the digest beside it.
pub fn record_digest(model: &ModelFile, model_dir: &Path) -> Result<String, ModelIntegrityError> {
    let digest = sha256_file_hex(&model_dir.join(model.name))?;
    let record = digest_record_path(model, model_dir);
    fs::write(&record, format!("{digest}\n"))
        .map_err(|source| ModelIntegrityError::Record { path: record, source })?;
    Ok(digest)
}

/// Digest previously stored by [`record_digest`], if any.
pub fn recorded_digest(
    model: &ModelFile,
    model_dir: &Path,
) -> Result<Option<String>, ModelIntegrityError> {
    let record = digest_record_path(model, model_dir);
    let text = match fs::read_to_string(&record) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ModelIntegrityError::Read { path: record, source }),
    };
    let digest = text.trim();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ModelIntegrityError::MalformedRecord { path: record });
    }
    Ok(Some(digest.to_ascii_lowercase()))
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn verify_file_sha256(
    name: &'static str,
    path: &Path,
    expected_sha256: &str,
) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name,
            path: path.to_path_buf(),
        });
    }

    let digest = sha256_file_hex(path)?;
    if digest != expected_sha256 {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name,
            path: path.to_path_buf(),
            expected: expected_sha256.to_string(),
            got: digest,
        });
    }
    Ok(())
}

/// Check one manifest entry inside `model_dir`.
pub fn verify_model(
    model: &ModelFile,
    model_dir: &Path,
) -> Result<Verification, ModelIntegrityError> {
    let path = model_dir.join(model.name);
    match model.sha256 {
        Some(expected) => {
            verify_file_sha256(model.name, &path, expected)?;
            Ok(Verification::ChecksumOk)
        }
        None if !path.is_file() => Err(ModelIntegrityError::MissingModel {
            name: model.name,
            path,
        }),
        None => match recorded_digest(model, model_dir)? {
            Some(expected) => {
                verify_file_sha256(model.name, &path, &expected)?;
                Ok(Verification::RecordedChecksumOk)
            }
            None => Ok(Verification::Present),
        },
    }
}

/// Check every manifest entry, stopping at the first failure.
pub fn verify_models_dir(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    for model in MODELS {
        verify_model(model, model_dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn sha256_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        fs::write(&path, b"hello").unwrap();

        assert_eq!(sha256_file_hex(&path).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn verify_file_sha256_rejects_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.onnx");

        let err = verify_file_sha256("nope.onnx", &path, "00").unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { .. }));
    }

    #[test]
    fn verify_file_sha256_rejects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        fs::write(&path, b"hello").unwrap();

        let err = verify_file_sha256("model.onnx", &path, "00").unwrap_err();
        match err {
            ModelIntegrityError::ChecksumMismatch { got, .. } => assert_eq!(got, HELLO_SHA256),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn verify_file_sha256_accepts_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        fs::write(&path, b"hello").unwrap();

        verify_file_sha256("model.onnx", &path, HELLO_SHA256).unwrap();
    }

    #[test]
    fn unpinned_models_are_presence_checked() {
        let dir = tempfile::tempdir().unwrap();
        let cascade = find_model(CASCADE_MODEL).unwrap();

        let err = verify_model(cascade, dir.path()).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { .. }));

        fs::write(dir.path().join(CASCADE_MODEL), b"<opencv_storage/>").unwrap();
        assert_eq!(
            verify_model(cascade, dir.path()).unwrap(),
            Verification::Present
        );
    }

    #[test]
    fn recorded_digest_catches_later_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let predictor = find_model(SHAPE_PREDICTOR_MODEL).unwrap();
        let path = dir.path().join(SHAPE_PREDICTOR_MODEL);
        fs::write(&path, b"hello").unwrap();

        assert_eq!(record_digest(predictor, dir.path()).unwrap(), HELLO_SHA256);
        assert_eq!(
            recorded_digest(predictor, dir.path()).unwrap().as_deref(),
            Some(HELLO_SHA256)
        );
        assert_eq!(
            verify_model(predictor, dir.path()).unwrap(),
            Verification::RecordedChecksumOk
        );

        fs::write(&path, b"hellp").unwrap();
        let err = verify_model(predictor, dir.path()).unwrap_err();
        match err {
            ModelIntegrityError::ChecksumMismatch { expected, .. } => {
                assert_eq!(expected, HELLO_SHA256)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_digest_record_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cascade = find_model(CASCADE_MODEL).unwrap();
        fs::write(dir.path().join(CASCADE_MODEL), b"<opencv_storage/>").unwrap();
        fs::write(digest_record_path(cascade, dir.path()), "not-a-digest\n").unwrap();

        let err = verify_model(cascade, dir.path()).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MalformedRecord { .. }));
    }

    #[test]
    fn pinned_model_with_wrong_content_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SCRFD_MODEL), b"not an onnx graph").unwrap();

        let scrfd = find_model(SCRFD_MODEL).unwrap();
        let err = verify_model(scrfd, dir.path()).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::ChecksumMismatch { .. }));
    }

    #[test]
    fn verify_models_dir_reports_missing() {
        let dir = tempfile::tempdir().unwrap();

        let err = verify_models_dir(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            ModelIntegrityError::MissingModel { name: SCRFD_MODEL, .. }
        ));
    }

    #[test]
    fn manifest_names_are_unique_and_checksums_well_formed() {
        for (i, model) in MODELS.iter().enumerate() {
            assert!(MODELS[i + 1..].iter().all(|m| m.name != model.name));
            if let Some(digest) = model.sha256 {
                assert_eq!(digest.len(), 64);
                assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
            }
        }
    }

    #[test]
    fn default_model_dir_ends_in_portrait_models() {
        assert!(default_model_dir().ends_with("portrait/models"));
    }
}
