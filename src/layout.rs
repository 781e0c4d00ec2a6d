//! Repository cache layout
//!
//! Maps repositories onto the on-disk cache structure:
//! ```text
//! <cache_root>/
//! ├── models--MNN--Qwen2.5-Omni-3B-MNN/
//! │   ├── blobs/
//! │   │   └── {commit}/            staging area, `.part` files while downloading
//! │   ├── snapshots/
//! │   │   └── {commit}/            pointer path (symlink to the blob, or a copy)
//! │   │       ├── .success
//! │   │       ├── config.json
//! │   │       └── llm.mnn
//! │   └── refs/
//! │       └── main                 commit hash the revision resolves to
//! └── datasets--org--name/
//!     └── ...
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Separator placed between the kind prefix and each identifier segment
const SEGMENT_SEPARATOR: &str = "--";

/// Kind of repository hosted by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoKind {
    Model,
    Dataset,
    Space,
}

impl RepoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Dataset => "dataset",
            Self::Space => "space",
        }
    }

    /// Pluralised prefix used for cache folder names ("models", "datasets", ...)
    fn folder_prefix(&self) -> &'static str {
        match self {
            Self::Model => "models",
            Self::Dataset => "datasets",
            Self::Space => "spaces",
        }
    }

    fn from_folder_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "models" => Some(Self::Model),
            "datasets" => Some(Self::Dataset),
            "spaces" => Some(Self::Space),
            _ => None,
        }
    }
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepoKind {
    type Err = InvalidRepositoryId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" | "models" => Ok(Self::Model),
            "dataset" | "datasets" => Ok(Self::Dataset),
            "space" | "spaces" => Ok(Self::Space),
            other => Err(InvalidRepositoryId::UnknownKind(other.to_string())),
        }
    }
}

/// Rejected repository identifier
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidRepositoryId {
    #[error("repository identifier has no segments")]
    Empty,

    #[error("unknown repository kind '{0}'")]
    UnknownKind(String),

    #[error("invalid segment '{segment}' in repository identifier: {reason}")]
    Segment {
        segment: String,
        reason: &'static str,
    },
}

/// Split an identifier on `/`, dropping empty segments
///
/// `"org//name/"` and `"org/name"` both yield `["org", "name"]`.
pub fn normalize_segments(identifier: &str) -> Vec<&str> {
    identifier.split('/').filter(|s| !s.is_empty()).collect()
}

fn check_segment(segment: &str) -> Result<(), InvalidRepositoryId> {
    let reason = if segment == "." || segment == ".." {
        Some("relative path component")
    } else if segment.contains(SEGMENT_SEPARATOR) {
        Some("contains '--'")
    } else if segment.starts_with('-') || segment.ends_with('-') {
        Some("starts or ends with '-'")
    } else if segment.contains('\\') || segment.contains('\0') {
        Some("contains a path separator or NUL")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(InvalidRepositoryId::Segment {
            segment: segment.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Identity of a repository in the remote registry
///
/// The identifier is stored normalized (`"org/name"`), so two ids that
/// differ only in redundant separators compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawRepositoryId")]
pub struct RepositoryId {
    kind: RepoKind,
    identifier: String,
}

impl RepositoryId {
    /// Create a validated repository id
    pub fn new(kind: RepoKind, identifier: &str) -> Result<Self, InvalidRepositoryId> {
        let segments = normalize_segments(identifier);
        if segments.is_empty() {
            return Err(InvalidRepositoryId::Empty);
        }
        for segment in &segments {
            check_segment(segment)?;
        }

        Ok(Self {
            kind,
            identifier: segments.join("/"),
        })
    }

    /// Shorthand for a model repository
    pub fn model(identifier: &str) -> Result<Self, InvalidRepositoryId> {
        Self::new(RepoKind::Model, identifier)
    }

    pub fn kind(&self) -> RepoKind {
        self.kind
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.identifier.split('/')
    }

    /// Cache folder name for this repository
    pub fn folder_name(&self) -> String {
        folder_name(self.kind, &self.identifier)
    }
}

#[derive(Deserialize)]
struct RawRepositoryId {
    kind: RepoKind,
    identifier: String,
}

impl TryFrom<RawRepositoryId> for RepositoryId {
    type Error = InvalidRepositoryId;

    fn try_from(raw: RawRepositoryId) -> Result<Self, Self::Error> {
        Self::new(raw.kind, &raw.identifier)
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.identifier)
    }
}

/// Convert a repository to its cache folder name
///
/// e.g. (Model, "MNN/Qwen2.5-Omni-3B-MNN") -> "models--MNN--Qwen2.5-Omni-3B-MNN"
///
/// Returns an empty string when the identifier has no segments, so callers
/// probing with unvalidated input get a harmless value rather than a panic.
pub fn folder_name(kind: RepoKind, identifier: &str) -> String {
    let segments = normalize_segments(identifier);
    if segments.is_empty() {
        return String::new();
    }

    let mut parts = Vec::with_capacity(segments.len() + 1);
    parts.push(kind.folder_prefix());
    parts.extend(segments);
    parts.join(SEGMENT_SEPARATOR)
}

/// Convert a cache folder name back to its repository
///
/// e.g. "models--MNN--Qwen2.5-Omni-3B-MNN" -> (Model, "MNN/Qwen2.5-Omni-3B-MNN")
pub fn parse_folder_name(name: &str) -> Option<RepositoryId> {
    let (prefix, rest) = name.split_once(SEGMENT_SEPARATOR)?;
    let kind = RepoKind::from_folder_prefix(prefix)?;
    let identifier = rest.split(SEGMENT_SEPARATOR).collect::<Vec<_>>().join("/");
    let id = RepositoryId::new(kind, &identifier).ok()?;
    // Folders we could not have produced ("models--a----b") are not ours
    (id.folder_name() == name).then_some(id)
}

/// Snapshot directory for a commit inside a repository storage folder
pub fn snapshot_dir(storage_folder: &Path, commit_hash: &str) -> PathBuf {
    storage_folder.join("snapshots").join(commit_hash)
}

/// Pointer path of a file inside a snapshot
pub fn pointer_path(storage_folder: &Path, commit_hash: &str, relative_path: &str) -> PathBuf {
    snapshot_dir(storage_folder, commit_hash).join(relative_path)
}

/// Cache layout rooted at a cache directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Storage folder holding every snapshot, blob and ref of a repository
    pub fn repo_dir(&self, id: &RepositoryId) -> PathBuf {
        self.root.join(id.folder_name())
    }

    pub fn snapshot_dir(&self, id: &RepositoryId, commit_hash: &str) -> PathBuf {
        snapshot_dir(&self.repo_dir(id), commit_hash)
    }

    pub fn pointer_path(&self, id: &RepositoryId, commit_hash: &str, relative_path: &str) -> PathBuf {
        pointer_path(&self.repo_dir(id), commit_hash, relative_path)
    }

    /// Staging directory a snapshot is downloaded into before installation
    pub fn blob_dir(&self, id: &RepositoryId, commit_hash: &str) -> PathBuf {
        self.repo_dir(id).join("blobs").join(commit_hash)
    }

    pub fn ref_path(&self, id: &RepositoryId, revision: &str) -> PathBuf {
        self.repo_dir(id).join("refs").join(revision)
    }

    /// Read the commit hash a revision currently resolves to
    pub fn read_ref(&self, id: &RepositoryId, revision: &str) -> Option<String> {
        let content = std::fs::read_to_string(self.ref_path(id, revision)).ok()?;
        let commit = content.trim();
        (!commit.is_empty()).then(|| commit.to_string())
    }

    /// Record the commit hash a revision resolves to
    pub async fn write_ref(
        &self,
        id: &RepositoryId,
        revision: &str,
        commit_hash: &str,
    ) -> std::io::Result<()> {
        let path = self.ref_path(id, revision);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, commit_hash).await
    }

    /// List all repositories with at least one snapshot in the cache
    pub fn list_cached_repositories(&self) -> Vec<RepositoryId> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut repos: Vec<_> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let id = parse_folder_name(&name)?;
                has_snapshot(&entry.path()).then_some(id)
            })
            .collect();

        repos.sort();
        repos
    }
}

fn has_snapshot(repo_dir: &Path) -> bool {
    std::fs::read_dir(repo_dir.join("snapshots"))
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
