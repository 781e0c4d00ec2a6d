//! Download orchestration
//!
//! One [`DownloadManager`] owns the lifecycle of every repository under a
//! cache root. At most one transfer task runs per repository; the `active`
//! map, filled with insert-if-absent semantics, is the point where
//! concurrent starts are serialized.

use super::events::{DownloadEvent, DownloadListener, EventBus};
use super::info::{DownloadInfo, DownloadState};
use super::task;
use crate::error::{CacheError, CacheResult};
use crate::installer::{Installer, Linker, SystemLinker, remove_path};
use crate::layout::{CacheLayout, RepositoryId};
use crate::manifest::{ManifestCatalog, RepositoryProfile};
use crate::transport::Transport;
use crate::validator::is_valid_model_dir;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Tunables for transfers under one cache root
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub cache_root: PathBuf,
    /// Minimum time between two progress events for one repository
    pub progress_interval: Duration,
    /// Longest wait for the next body chunk before the transfer fails
    pub chunk_timeout: Duration,
}

impl DownloadSettings {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            progress_interval: Duration::from_millis(500),
            chunk_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of [`DownloadManager::start_download`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new transfer task was spawned
    Started,
    /// A transfer for this repository is already running
    AlreadyActive,
    /// The repository is installed and valid at this path
    AlreadyComplete(PathBuf),
}

/// Why a running transfer was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CancelReason {
    Pause,
    Remove,
}

/// Handle to a running transfer task, or to a removal in progress
pub(super) struct ActiveTransfer {
    pub(super) cancel: CancellationToken,
    reason: Mutex<Option<CancelReason>>,
    /// Cancelled by the task once its final state is recorded
    pub(super) done: CancellationToken,
    /// Holds the slot while repository files are deleted
    removal: bool,
}

impl ActiveTransfer {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            reason: Mutex::new(None),
            done: CancellationToken::new(),
            removal: false,
        }
    }

    fn removal() -> Self {
        Self {
            removal: true,
            ..Self::new()
        }
    }

    fn request_cancel(&self, reason: CancelReason) {
        let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        // Removal wins over a pause requested earlier
        if current.is_none() || reason == CancelReason::Remove {
            *current = Some(reason);
        }
        drop(current);
        self.cancel.cancel();
    }

    pub(super) fn reason(&self) -> CancelReason {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(CancelReason::Pause)
    }
}

pub(super) struct Inner {
    pub(super) settings: DownloadSettings,
    pub(super) layout: CacheLayout,
    pub(super) installer: Arc<Installer>,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) catalog: Arc<ManifestCatalog>,
    pub(super) events: EventBus,
    records: DashMap<RepositoryId, DownloadInfo>,
    active: DashMap<RepositoryId, Arc<ActiveTransfer>>,
}

impl Inner {
    /// Mutate the record of `id`, creating it on first touch
    pub(super) fn update<F>(&self, id: &RepositoryId, f: F) -> DownloadInfo
    where
        F: FnOnce(&mut DownloadInfo),
    {
        let mut entry = self
            .records
            .entry(id.clone())
            .or_insert_with(|| DownloadInfo::new(id.clone()));
        f(entry.value_mut());
        entry.touch();
        entry.clone()
    }

    /// Drop the active entry, but only if it still belongs to `transfer`
    pub(super) fn release(&self, id: &RepositoryId, transfer: &Arc<ActiveTransfer>) {
        self.active
            .remove_if(id, |_, current| Arc::ptr_eq(current, transfer));
        crate::metrics::update_active_downloads(self.active.len());
    }

    /// Commit of the installed snapshot: the completed record first, then the ref on disk
    pub(super) fn installed_commit(
        &self,
        id: &RepositoryId,
        profile: &RepositoryProfile,
    ) -> Option<String> {
        let from_record = self
            .records
            .get(id)
            .filter(|r| r.state == DownloadState::Complete)
            .and_then(|r| r.commit.clone());

        from_record.or_else(|| self.layout.read_ref(id, &profile.revision))
    }

    /// Validated install path of a repository, if any
    pub(super) fn installed_path(
        &self,
        id: &RepositoryId,
        profile: &RepositoryProfile,
    ) -> Option<(String, PathBuf)> {
        let commit = self.installed_commit(id, profile)?;
        let path = self.layout.snapshot_dir(id, &commit);
        is_valid_model_dir(&path, profile.manifest.files()).then_some((commit, path))
    }
}

/// Orchestrates downloads, installation and validation for one cache root
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    /// Create a manager; must be called from within a tokio runtime
    pub fn new(
        settings: DownloadSettings,
        transport: Arc<dyn Transport>,
        catalog: Arc<ManifestCatalog>,
    ) -> Self {
        Self::with_linker(settings, transport, catalog, Arc::new(SystemLinker))
    }

    /// Create a manager whose installer links through `linker`
    pub fn with_linker(
        settings: DownloadSettings,
        transport: Arc<dyn Transport>,
        catalog: Arc<ManifestCatalog>,
        linker: Arc<dyn Linker>,
    ) -> Self {
        let layout = CacheLayout::new(settings.cache_root.clone());
        let installer = Arc::new(Installer::with_linker(&settings.cache_root, linker));

        Self {
            inner: Arc::new(Inner {
                settings,
                layout,
                installer,
                transport,
                catalog,
                events: EventBus::new(),
                records: DashMap::new(),
                active: DashMap::new(),
            }),
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.inner.layout
    }

    pub fn cache_root(&self) -> &std::path::Path {
        self.inner.layout.root()
    }

    pub fn catalog(&self) -> &ManifestCatalog {
        &self.inner.catalog
    }

    pub fn add_listener(&self, listener: Arc<dyn DownloadListener>) {
        self.inner.events.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DownloadListener>) {
        self.inner.events.remove_listener(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until listeners have seen every event emitted so far
    pub async fn flush_events(&self) {
        self.inner.events.flush().await;
    }

    /// Start or resume fetching a repository
    ///
    /// No-op when a transfer is already running or the repository is
    /// installed and valid.
    pub fn start_download(&self, id: &RepositoryId) -> CacheResult<StartOutcome> {
        if self.inner.active.contains_key(id) {
            return Ok(StartOutcome::AlreadyActive);
        }

        let profile = self.inner.catalog.profile(id);
        if let Some((commit, path)) = self.inner.installed_path(id, &profile) {
            self.inner.update(id, |info| {
                info.state = DownloadState::Complete;
                info.commit = Some(commit);
                info.downloaded_path = Some(path.clone());
            });
            return Ok(StartOutcome::AlreadyComplete(path));
        }

        let transfer = match self.inner.active.entry(id.clone()) {
            Entry::Occupied(_) => return Ok(StartOutcome::AlreadyActive),
            Entry::Vacant(slot) => {
                let transfer = Arc::new(ActiveTransfer::new());
                slot.insert(transfer.clone());
                transfer
            }
        };

        self.inner.update(id, |info| {
            info.state = DownloadState::Downloading;
            info.last_error = None;
            info.speed_bytes_per_sec = 0.0;
            info.downloaded_path = None;
        });

        tracing::info!(repo = %id, revision = %profile.revision, "Starting download");
        crate::metrics::record_download_started(&id.to_string());
        crate::metrics::update_active_downloads(self.inner.active.len());
        self.inner.events.emit(DownloadEvent::Started {
            repository: id.clone(),
        });

        tokio::spawn(task::run(self.inner.clone(), id.clone(), profile, transfer));

        Ok(StartOutcome::Started)
    }

    /// Pause a running transfer, keeping partial data for resumption
    ///
    /// Returns once the transfer task has stopped, or `false` immediately when
    /// nothing was running.
    pub async fn pause_download(&self, id: &RepositoryId) -> bool {
        let Some(transfer) = self.inner.active.get(id).map(|t| t.value().clone()) else {
            return false;
        };
        if transfer.removal {
            return false;
        }

        transfer.request_cancel(CancelReason::Pause);
        transfer.done.cancelled().await;
        true
    }

    /// Abort any transfer and delete everything cached for a repository
    ///
    /// The repository's active slot is held until the files are gone and the
    /// record is reset, so a concurrent start reports `AlreadyActive`.
    pub async fn remove_download(&self, id: &RepositoryId) -> CacheResult<()> {
        let removal = Arc::new(ActiveTransfer::removal());
        loop {
            let running = match self.inner.active.entry(id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(removal.clone());
                    break;
                }
                Entry::Occupied(slot) => slot.get().clone(),
            };

            // Another removal finishes first, then ours runs (idempotent)
            if !running.removal {
                running.request_cancel(CancelReason::Remove);
            }
            running.done.cancelled().await;
        }

        let repo_dir = self.inner.layout.repo_dir(id);
        let target = repo_dir.clone();
        let deleted = tokio::task::spawn_blocking(move || remove_path(&target))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))
            .and_then(|removed| removed.map_err(|e| CacheError::io(repo_dir, e)));

        if deleted.is_ok() {
            self.inner
                .records
                .insert(id.clone(), DownloadInfo::new(id.clone()));

            tracing::info!(repo = %id, "Removed cached repository");
            crate::metrics::record_download_removed(&id.to_string());
            self.inner.events.emit(DownloadEvent::Removed {
                repository: id.clone(),
            });
        }

        self.inner.release(id, &removal);
        removal.done.cancel();

        deleted
    }

    /// Snapshot of a repository's state
    ///
    /// Repositories never touched by this manager are probed on disk, so a
    /// previous process's completed installs report `Complete`.
    pub fn get_download_info(&self, id: &RepositoryId) -> DownloadInfo {
        if let Some(info) = self.inner.records.get(id) {
            return info.clone();
        }

        let profile = self.inner.catalog.profile(id);
        match self.inner.installed_path(id, &profile) {
            Some((commit, path)) => self.inner.update(id, |info| {
                info.state = DownloadState::Complete;
                info.commit = Some(commit);
                info.downloaded_path = Some(path);
            }),
            None => DownloadInfo::new(id.clone()),
        }
    }

    /// Validated install path, or `None` when the repository is not usable
    pub fn get_downloaded_file(&self, id: &RepositoryId) -> Option<PathBuf> {
        let profile = self.inner.catalog.profile(id);
        self.inner.installed_path(id, &profile).map(|(_, path)| path)
    }

    /// Compare the installed commit with the registry's current one
    ///
    /// Returns `false` when nothing is installed.
    pub async fn check_for_update(&self, id: &RepositoryId) -> CacheResult<bool> {
        let profile = self.inner.catalog.profile(id);
        let Some(installed) = self.inner.installed_commit(id, &profile) else {
            return Ok(false);
        };

        let remote = self.inner.transport.resolve(id, &profile.revision).await?;
        let has_update = remote.commit != installed;

        let info = self.inner.update(id, |info| info.has_update = has_update);
        if has_update {
            tracing::info!(repo = %id, installed = %installed, remote = %remote.commit, "Update available");
            self.inner.events.emit(DownloadEvent::HasUpdate { info });
        }

        Ok(has_update)
    }

    /// All repositories known in memory, configured, or found on disk
    pub fn list(&self) -> Vec<DownloadInfo> {
        let mut ids: Vec<RepositoryId> = self.inner.records.iter().map(|r| r.key().clone()).collect();
        ids.extend(self.inner.catalog.repositories().cloned());
        ids.extend(self.inner.layout.list_cached_repositories());
        ids.sort();
        ids.dedup();

        ids.iter().map(|id| self.get_download_info(id)).collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Pause every running transfer and wait for them to stop
    pub async fn shutdown(&self) {
        let transfers: Vec<_> = self
            .inner
            .active
            .iter()
            .map(|t| t.value().clone())
            .collect();

        if !transfers.is_empty() {
            tracing::info!(count = transfers.len(), "Pausing active downloads");
        }

        for transfer in &transfers {
            transfer.request_cancel(CancelReason::Pause);
        }
        for transfer in transfers {
            transfer.done.cancelled().await;
        }

        self.inner.events.flush().await;
    }
}
