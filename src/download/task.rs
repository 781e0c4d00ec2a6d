//! Background transfer task for one repository

use super::events::DownloadEvent;
use super::info::DownloadState;
use super::manager::{ActiveTransfer, CancelReason, Inner};
use crate::error::CacheError;
use crate::installer::{InstallError, SUCCESS_MARKER, remove_path};
use crate::layout::RepositoryId;
use crate::manifest::RepositoryProfile;
use crate::transport::{RemoteFile, RemoteSnapshot, TransferError};
use crate::validator::{ValidationFailure, validate};
use futures::StreamExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Why a transfer stopped before installing
enum Interrupt {
    Cancelled(CancelReason),
    Failed(CacheError),
}

impl From<CacheError> for Interrupt {
    fn from(err: CacheError) -> Self {
        Interrupt::Failed(err)
    }
}

impl From<TransferError> for Interrupt {
    fn from(err: TransferError) -> Self {
        Interrupt::Failed(err.into())
    }
}

impl From<InstallError> for Interrupt {
    fn from(err: InstallError) -> Self {
        Interrupt::Failed(err.into())
    }
}

impl From<ValidationFailure> for Interrupt {
    fn from(err: ValidationFailure) -> Self {
        Interrupt::Failed(err.into())
    }
}

/// Throttles progress events and tracks transfer speed
struct ProgressTracker {
    interval: Duration,
    last_emit: Instant,
    window_start: Instant,
    window_bytes: u64,
    speed: f64,
}

impl ProgressTracker {
    fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            interval,
            last_emit: now,
            window_start: now,
            window_bytes: 0,
            speed: 0.0,
        }
    }

    /// Account for `bytes`; returns the current speed when an event is due
    fn record(&mut self, bytes: u64) -> Option<f64> {
        self.window_bytes += bytes;

        let now = Instant::now();
        if now.duration_since(self.last_emit) < self.interval {
            return None;
        }

        let elapsed = now.duration_since(self.window_start).as_secs_f64();
        if elapsed > 0.0 {
            self.speed = self.window_bytes as f64 / elapsed;
        }
        self.window_start = now;
        self.window_bytes = 0;
        self.last_emit = now;
        Some(self.speed)
    }

    fn speed(&self) -> f64 {
        self.speed
    }
}

/// Run one transfer to completion, pause, removal or failure
pub(super) async fn run(
    inner: Arc<Inner>,
    id: RepositoryId,
    profile: RepositoryProfile,
    transfer: Arc<ActiveTransfer>,
) {
    // Wakes pause/remove callers once the final state is recorded
    let _done = transfer.done.clone().drop_guard();

    let outcome = fetch_and_install(&inner, &id, &profile, &transfer).await;
    finish(&inner, &id, &transfer, outcome);
}

fn finish(
    inner: &Inner,
    id: &RepositoryId,
    transfer: &Arc<ActiveTransfer>,
    outcome: Result<PathBuf, Interrupt>,
) {
    let repo = id.to_string();

    match outcome {
        Ok(path) => {
            inner.update(id, |info| {
                info.state = DownloadState::Complete;
                info.downloaded_path = Some(path.clone());
                info.current_file = None;
                info.speed_bytes_per_sec = 0.0;
                info.has_update = false;
                info.last_error = None;
            });
            inner.release(id, transfer);

            tracing::info!(repo = %id, path = ?path, "Download complete");
            crate::metrics::record_download_finished(&repo);
            inner.events.emit(DownloadEvent::Finished {
                repository: id.clone(),
                path,
            });
        }
        Err(Interrupt::Cancelled(CancelReason::Pause)) => {
            inner.update(id, |info| {
                info.state = DownloadState::Paused;
                info.speed_bytes_per_sec = 0.0;
            });
            inner.release(id, transfer);

            tracing::info!(repo = %id, "Download paused");
            crate::metrics::record_download_paused(&repo);
            inner.events.emit(DownloadEvent::Paused {
                repository: id.clone(),
            });
        }
        Err(Interrupt::Cancelled(CancelReason::Remove)) => {
            // The remover resets the record and announces the removal
            inner.release(id, transfer);
            tracing::debug!(repo = %id, "Transfer aborted for removal");
        }
        Err(Interrupt::Failed(err)) => {
            let error = err.to_string();
            inner.update(id, |info| {
                info.state = DownloadState::Failed;
                info.last_error = Some(error.clone());
                info.speed_bytes_per_sec = 0.0;
            });
            inner.release(id, transfer);

            tracing::error!(repo = %id, error = %error, "Download failed");
            crate::metrics::record_download_failed(&repo);
            inner.events.emit(DownloadEvent::Failed {
                repository: id.clone(),
                error,
            });
        }
    }
}

async fn fetch_and_install(
    inner: &Inner,
    id: &RepositoryId,
    profile: &RepositoryProfile,
    transfer: &ActiveTransfer,
) -> Result<PathBuf, Interrupt> {
    discard_invalid_install(inner, id, profile).await?;

    let snapshot = tokio::select! {
        biased;
        _ = transfer.cancel.cancelled() => return Err(Interrupt::Cancelled(transfer.reason())),
        resolved = inner.transport.resolve(id, &profile.revision) => resolved?,
    };
    snapshot.check_paths()?;

    let total_bytes = snapshot.total_size();
    inner.update(id, |info| {
        info.commit = Some(snapshot.commit.clone());
        info.total_bytes = total_bytes;
        info.has_update = false;
    });
    inner.events.emit(DownloadEvent::TotalSize {
        repository: id.clone(),
        total_bytes,
    });

    tracing::info!(
        repo = %id,
        commit = %snapshot.commit,
        files = snapshot.files.len(),
        total_bytes,
        "Resolved snapshot"
    );

    let blob_dir = inner.layout.blob_dir(id, &snapshot.commit);
    fs::create_dir_all(&blob_dir)
        .await
        .map_err(|e| CacheError::io(&blob_dir, e))?;
    clear_stale_marker(&blob_dir).await?;

    download_files(inner, id, &snapshot, &blob_dir, transfer).await?;

    inner.update(id, |info| {
        info.state = DownloadState::Verifying;
        info.current_file = None;
        info.speed_bytes_per_sec = 0.0;
    });

    let pointer = inner.layout.snapshot_dir(id, &snapshot.commit);
    if let Err(err) = install(inner, profile, &blob_dir, &pointer).await {
        tracing::warn!(repo = %id, pointer = ?pointer, "Discarding unusable install");
        let (pointer, blob_dir) = (pointer.clone(), blob_dir.clone());
        let _ = tokio::task::spawn_blocking(move || {
            let _ = remove_path(&pointer);
            let _ = remove_path(&blob_dir);
        })
        .await;
        return Err(err);
    }

    inner
        .layout
        .write_ref(id, &profile.revision, &snapshot.commit)
        .await
        .map_err(|e| CacheError::io(inner.layout.ref_path(id, &profile.revision), e))?;

    Ok(pointer)
}

/// Delete an installed snapshot that no longer validates, along with its ref
async fn discard_invalid_install(
    inner: &Inner,
    id: &RepositoryId,
    profile: &RepositoryProfile,
) -> Result<(), Interrupt> {
    let Some(commit) = inner.layout.read_ref(id, &profile.revision) else {
        return Ok(());
    };

    let pointer = inner.layout.snapshot_dir(id, &commit);
    if fs::symlink_metadata(&pointer).await.is_err() {
        return Ok(());
    }

    let reason = match validate(&pointer, profile.manifest.files()) {
        Ok(()) => return Ok(()),
        Err(reason) => reason,
    };

    tracing::warn!(repo = %id, pointer = ?pointer, reason = %reason, "Deleting invalid install");

    let ref_path = inner.layout.ref_path(id, &profile.revision);
    let target = pointer.clone();
    tokio::task::spawn_blocking(move || remove_path(&target))
        .await
        .map_err(|e| CacheError::Task(e.to_string()))?
        .map_err(|e| CacheError::io(&pointer, e))?;
    remove_path(&ref_path).map_err(|e| CacheError::io(&ref_path, e))?;

    Ok(())
}

/// A marker in staging would vouch for content that is about to change
async fn clear_stale_marker(blob_dir: &Path) -> Result<(), Interrupt> {
    let marker = blob_dir.join(SUCCESS_MARKER);
    match fs::remove_file(&marker).await {
        Ok(()) => {
            tracing::warn!(marker = ?marker, "Removed stale success marker from staging");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(marker, e).into()),
    }
}

/// Publish the staged blob and check it against the manifest
async fn install(
    inner: &Inner,
    profile: &RepositoryProfile,
    blob_dir: &Path,
    pointer: &Path,
) -> Result<(), Interrupt> {
    let installer = inner.installer.clone();
    let manifest = profile.manifest.clone();
    let (blob_dir, pointer) = (blob_dir.to_path_buf(), pointer.to_path_buf());

    tokio::task::spawn_blocking(move || -> Result<(), Interrupt> {
        let method = installer.publish(&blob_dir, &pointer)?;
        tracing::debug!(pointer = ?pointer, method = ?method, "Published snapshot");
        validate(&pointer, manifest.files())?;
        Ok(())
    })
    .await
    .map_err(|e| CacheError::Task(e.to_string()))?
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Stream every file of the snapshot into `blob_dir`
async fn download_files(
    inner: &Inner,
    id: &RepositoryId,
    snapshot: &RemoteSnapshot,
    blob_dir: &Path,
    transfer: &ActiveTransfer,
) -> Result<(), Interrupt> {
    let mut tracker = ProgressTracker::new(inner.settings.progress_interval);
    let mut downloaded: u64 = 0;

    for file in &snapshot.files {
        if transfer.cancel.is_cancelled() {
            inner.update(id, |info| info.bytes_downloaded = downloaded);
            return Err(Interrupt::Cancelled(transfer.reason()));
        }

        let final_path = blob_dir.join(&file.path);
        if let Ok(meta) = fs::metadata(&final_path).await
            && file.size.is_none_or(|size| size == meta.len())
        {
            tracing::debug!(repo = %id, file = %file.path, "File already downloaded");
            downloaded += meta.len();
            continue;
        }

        inner.update(id, |info| {
            info.current_file = Some(file.path.clone());
            info.bytes_downloaded = downloaded;
        });

        let written = download_file(inner, id, file, &final_path, transfer, &mut tracker, downloaded)
            .await?;
        downloaded += written;
    }

    let info = inner.update(id, |info| {
        info.bytes_downloaded = downloaded;
        info.speed_bytes_per_sec = tracker.speed();
    });
    inner.events.emit(DownloadEvent::Progress { info });

    Ok(())
}

/// Download one file through its `.part` sibling; returns the file's size
async fn download_file(
    inner: &Inner,
    id: &RepositoryId,
    file: &RemoteFile,
    final_path: &Path,
    transfer: &ActiveTransfer,
    tracker: &mut ProgressTracker,
    downloaded_before: u64,
) -> Result<u64, Interrupt> {
    let part = part_path(final_path);
    if let Some(parent) = part.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| CacheError::io(parent, e))?;
    }

    let mut offset = fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);
    if file.size.is_some_and(|size| offset > size) {
        tracing::warn!(repo = %id, file = %file.path, "Partial file larger than remote, restarting");
        offset = 0;
    }

    let body = tokio::select! {
        biased;
        _ = transfer.cancel.cancelled() => {
            inner.update(id, |info| info.bytes_downloaded = downloaded_before + offset);
            return Err(Interrupt::Cancelled(transfer.reason()));
        }
        opened = inner.transport.open(file, offset) => opened?,
    };

    let write_error = |e: io::Error| TransferError::Write {
        path: file.path.clone(),
        message: e.to_string(),
    };

    let (handle, mut file_bytes) = if body.resumed && offset > 0 {
        tracing::debug!(repo = %id, file = %file.path, offset, "Resuming file");
        let handle = OpenOptions::new()
            .append(true)
            .open(&part)
            .await
            .map_err(write_error)?;
        (handle, offset)
    } else {
        tracing::debug!(repo = %id, file = %file.path, "Downloading file");
        (fs::File::create(&part).await.map_err(write_error)?, 0)
    };

    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, handle);
    let mut stream = body.stream;
    let repo = id.to_string();

    loop {
        let next = tokio::select! {
            biased;
            _ = transfer.cancel.cancelled() => {
                // Keep what we have for the next resume
                let _ = writer.flush().await;
                inner.update(id, |info| info.bytes_downloaded = downloaded_before + file_bytes);
                return Err(Interrupt::Cancelled(transfer.reason()));
            }
            next = tokio::time::timeout(inner.settings.chunk_timeout, stream.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                let _ = writer.flush().await;
                return Err(TransferError::Stalled(inner.settings.chunk_timeout.as_secs()).into());
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                let _ = writer.flush().await;
                return Err(e.into());
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        writer.write_all(&chunk).await.map_err(write_error)?;
        file_bytes += chunk.len() as u64;
        crate::metrics::record_bytes_downloaded(&repo, chunk.len() as u64);

        if let Some(speed) = tracker.record(chunk.len() as u64) {
            let info = inner.update(id, |info| {
                info.bytes_downloaded = downloaded_before + file_bytes;
                info.speed_bytes_per_sec = speed;
            });
            inner.events.emit(DownloadEvent::Progress { info });
        }
    }

    writer.flush().await.map_err(write_error)?;
    drop(writer);

    if let Some(expected) = file.size
        && expected != file_bytes
    {
        let _ = fs::remove_file(&part).await;
        return Err(TransferError::SizeMismatch {
            path: file.path.clone(),
            expected,
            actual: file_bytes,
        }
        .into());
    }

    fs::rename(&part, final_path).await.map_err(write_error)?;
    Ok(file_bytes)
}
