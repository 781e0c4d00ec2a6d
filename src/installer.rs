//! Atomic installation of downloaded blobs
//!
//! A blob (a single file or a directory tree) is published at a pointer path
//! either as a symlink or, on filesystems that refuse links, as a full copy.
//! The success marker is written strictly after publication, so a marker on
//! disk always means the content beside it is complete.

use dashmap::DashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

/// File name of the success marker inside an installed directory
pub const SUCCESS_MARKER: &str = ".success";

/// One copy lock per cache root, shared by every installer on that root
static COPY_LOCKS: LazyLock<DashMap<PathBuf, Arc<Mutex<()>>>> = LazyLock::new(DashMap::new);

fn copy_lock_for(cache_root: &Path) -> Arc<Mutex<()>> {
    COPY_LOCKS.entry(lock_key(cache_root)).or_default().clone()
}

/// Absolute, lexically normalised root; independent of whether it exists yet
fn lock_key(cache_root: &Path) -> PathBuf {
    let absolute = std::path::absolute(cache_root).unwrap_or_else(|_| cache_root.to_path_buf());

    let mut key = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                key.pop();
            }
            other => key.push(other),
        }
    }
    key
}

/// Errors raised while publishing a blob
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("blob {0:?} does not exist")]
    MissingBlob(PathBuf),

    #[error("failed to prepare {path:?}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove existing {path:?}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to copy {from:?} to {to:?}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write success marker {path:?}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How a blob ended up at its pointer path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMethod {
    /// A fresh symlink was created
    Symlink,
    /// The pointer path already linked to this blob
    AlreadyLinked,
    /// Symlinks were refused, the blob was copied
    Copy,
}

/// Result of the symlink capability probe
#[derive(Debug)]
enum LinkOutcome {
    Linked,
    AlreadyLinked,
    Unsupported(io::Error),
}

/// Symbolic link creation, abstracted so tests can simulate filesystems
/// without link support
pub trait Linker: Send + Sync {
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;
}

/// Linker backed by the operating system
pub struct SystemLinker;

impl Linker for SystemLinker {
    #[cfg(unix)]
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    #[cfg(windows)]
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        if target.is_dir() {
            std::os::windows::fs::symlink_dir(target, link)
        } else {
            std::os::windows::fs::symlink_file(target, link)
        }
    }

    #[cfg(not(any(unix, windows)))]
    fn symlink(&self, _target: &Path, _link: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symbolic links are not supported on this platform",
        ))
    }
}

/// Publishes blobs at pointer paths for one cache root
pub struct Installer {
    linker: Arc<dyn Linker>,
    copy_lock: Arc<Mutex<()>>,
}

impl Installer {
    /// Create an installer using OS symlinks
    pub fn new(cache_root: &Path) -> Self {
        Self::with_linker(cache_root, Arc::new(SystemLinker))
    }

    /// Create an installer with a custom link strategy
    pub fn with_linker(cache_root: &Path, linker: Arc<dyn Linker>) -> Self {
        Self {
            linker,
            copy_lock: copy_lock_for(cache_root),
        }
    }

    /// Publish `target_blob` at `link_path` and stamp the success marker
    ///
    /// Idempotent: publishing the same pair twice leaves the same end state.
    /// Any error is returned before the marker is written.
    pub fn publish(
        &self,
        target_blob: &Path,
        link_path: &Path,
    ) -> Result<InstallMethod, InstallError> {
        if !target_blob.exists() {
            return Err(InstallError::MissingBlob(target_blob.to_path_buf()));
        }

        if let Some(parent) = link_path.parent() {
            fs::create_dir_all(parent).map_err(|source| InstallError::Prepare {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let method = match self.try_link(target_blob, link_path) {
            LinkOutcome::Linked => InstallMethod::Symlink,
            LinkOutcome::AlreadyLinked => InstallMethod::AlreadyLinked,
            LinkOutcome::Unsupported(err) => {
                tracing::warn!(
                    link = ?link_path,
                    error = %err,
                    "Symlink refused, falling back to copy"
                );
                self.copy_fallback(target_blob, link_path)?;
                crate::metrics::record_install_copy_fallback();
                InstallMethod::Copy
            }
        };

        let marker = write_success_marker(link_path)?;
        tracing::debug!(
            blob = ?target_blob,
            link = ?link_path,
            marker = ?marker,
            method = ?method,
            "Blob published"
        );

        Ok(method)
    }

    fn try_link(&self, target: &Path, link: &Path) -> LinkOutcome {
        match self.linker.symlink(target, link) {
            Ok(()) => LinkOutcome::Linked,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                self.resolve_collision(target, link)
            }
            Err(err) => LinkOutcome::Unsupported(err),
        }
    }

    /// Last write wins: anything at the link path that is not already our
    /// link is replaced
    fn resolve_collision(&self, target: &Path, link: &Path) -> LinkOutcome {
        if let Ok(existing) = fs::read_link(link)
            && existing == target
        {
            return LinkOutcome::AlreadyLinked;
        }

        tracing::debug!(link = ?link, "Link path occupied, replacing");
        if let Err(err) = remove_path(link) {
            return LinkOutcome::Unsupported(err);
        }

        match self.linker.symlink(target, link) {
            Ok(()) => LinkOutcome::Linked,
            Err(err) => LinkOutcome::Unsupported(err),
        }
    }

    fn copy_fallback(&self, target: &Path, link: &Path) -> Result<(), InstallError> {
        let _guard = self.copy_lock.lock().unwrap_or_else(PoisonError::into_inner);

        remove_path(link).map_err(|source| InstallError::Remove {
            path: link.to_path_buf(),
            source,
        })?;

        let copied = if target.is_dir() {
            copy_dir_recursive(target, link)
        } else {
            fs::copy(target, link).map(|_| ())
        };

        copied.map_err(|source| InstallError::Copy {
            from: target.to_path_buf(),
            to: link.to_path_buf(),
            source,
        })
    }
}

/// Location of the success marker for a pointer path
///
/// Directories carry `.success` inside, single files get a sibling
/// `<name>.success`.
pub fn marker_path(link_path: &Path) -> PathBuf {
    if link_path.is_dir() {
        return link_path.join(SUCCESS_MARKER);
    }

    let mut name = link_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(SUCCESS_MARKER);
    link_path.with_file_name(name)
}

fn write_success_marker(link_path: &Path) -> Result<PathBuf, InstallError> {
    let marker = marker_path(link_path);
    if marker.exists() {
        return Ok(marker);
    }

    fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&marker)
        .map_err(|source| InstallError::Marker {
            path: marker.clone(),
            source,
        })?;

    Ok(marker)
}

/// Copy a directory tree, skipping any success marker in the source
fn copy_dir_recursive(source: &Path, destination: &Path) -> io::Result<()> {
    fs::create_dir_all(destination)?;

    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == SUCCESS_MARKER {
            continue;
        }

        let from = entry.path();
        let to = destination.join(&name);
        if from.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }

    Ok(())
}

/// Remove a symlink, file or directory tree
///
/// Symlinks are removed without touching what they point at. A missing path
/// is not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
