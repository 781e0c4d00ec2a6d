//! Completeness checks for installed model directories

use crate::installer::SUCCESS_MARKER;
use std::path::{Path, PathBuf};

/// Why an installed directory cannot be trusted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),

    #[error("success marker missing in {0:?}")]
    MissingMarker(PathBuf),

    #[error("essential file '{0}' is missing")]
    MissingFile(String),

    #[error("essential file '{0}' is empty")]
    EmptyFile(String),
}

/// Check an installed directory against the success marker and a manifest
///
/// Rules are applied in order and the first failure is returned:
/// 1. `dir` exists and is a directory (symlinks are followed)
/// 2. `dir/.success` exists
/// 3. every manifest entry exists under `dir` and is non-empty
pub fn validate<S: AsRef<str>>(dir: &Path, manifest: &[S]) -> Result<(), ValidationFailure> {
    if !dir.is_dir() {
        return Err(ValidationFailure::NotADirectory(dir.to_path_buf()));
    }

    if !dir.join(SUCCESS_MARKER).exists() {
        return Err(ValidationFailure::MissingMarker(dir.to_path_buf()));
    }

    for name in manifest {
        let name = name.as_ref();
        match std::fs::metadata(dir.join(name)) {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => return Err(ValidationFailure::EmptyFile(name.to_string())),
            Err(_) => return Err(ValidationFailure::MissingFile(name.to_string())),
        }
    }

    Ok(())
}

/// Whether a cached directory is usable without re-downloading
pub fn is_valid_model_dir<S: AsRef<str>>(dir: &Path, manifest: &[S]) -> bool {
    match validate(dir, manifest) {
        Ok(()) => true,
        Err(failure) => {
            tracing::debug!(dir = ?dir, reason = %failure, "Model directory rejected");
            false
        }
    }
}
