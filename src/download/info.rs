//! Per-repository download state

use crate::layout::RepositoryId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle state of one repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    NotStarted,
    Downloading,
    Paused,
    Verifying,
    Complete,
    Failed,
}

impl DownloadState {
    /// Whether a transfer task currently owns the repository
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadState::Downloading | DownloadState::Verifying)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadState::NotStarted => "not_started",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Verifying => "verifying",
            DownloadState::Complete => "complete",
            DownloadState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of a repository's download progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub repository: RepositoryId,
    pub state: DownloadState,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: f64,
    pub last_error: Option<String>,

    /// Commit of the snapshot being fetched or installed
    pub commit: Option<String>,
    /// File currently being transferred
    pub current_file: Option<String>,
    /// Validated install path, set once `Complete`
    pub downloaded_path: Option<PathBuf>,
    pub has_update: bool,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl DownloadInfo {
    pub fn new(repository: RepositoryId) -> Self {
        Self {
            repository,
            state: DownloadState::NotStarted,
            bytes_downloaded: 0,
            total_bytes: 0,
            speed_bytes_per_sec: 0.0,
            last_error: None,
            commit: None,
            current_file: None,
            downloaded_path: None,
            has_update: false,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Fraction complete in `[0, 1]`; zero while the total is unknown
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_downloaded as f64 / self.total_bytes as f64).min(1.0)
    }

    pub fn is_complete(&self) -> bool {
        self.state == DownloadState::Complete
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}
