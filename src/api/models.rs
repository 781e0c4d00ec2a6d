//! API request and response models

use crate::download::DownloadInfo;
use crate::layout::RepositoryId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub cache_root: PathBuf,
    pub active_downloads: usize,
}

/// Download state with derived progress
#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadStatus {
    #[serde(flatten)]
    pub info: DownloadInfo,
    /// Fraction complete in `[0, 1]`
    pub progress: f64,
}

impl From<DownloadInfo> for DownloadStatus {
    fn from(info: DownloadInfo) -> Self {
        let progress = info.progress();
        Self { info, progress }
    }
}

/// Response to a start request
#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    /// "started", "already_active" or "already_complete"
    pub outcome: String,
    #[serde(flatten)]
    pub status: DownloadStatus,
}

/// Path of a validated install
#[derive(Debug, Serialize, Deserialize)]
pub struct PathResponse {
    pub repository: RepositoryId,
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateCheckResponse {
    pub repository: RepositoryId,
    pub has_update: bool,
}

/// Manifest to validate against: a family name or an explicit file list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestSelector {
    Family(String),
    Files(Vec<String>),
}

/// Request to validate an arbitrary directory
#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub path: PathBuf,

    /// Without a manifest only the success marker is checked
    #[serde(default)]
    pub manifest: Option<ManifestSelector>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Request to re-root the cache
#[derive(Debug, Serialize, Deserialize)]
pub struct ResetRequest {
    pub cache_root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub cache_root: PathBuf,
}
