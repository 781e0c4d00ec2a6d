//! Process-wide cache context
//!
//! [`ModelCache`] owns the current [`DownloadManager`] and can swap it for a
//! fresh one rooted elsewhere. Nothing is global: callers hold the context
//! and pass it where it is needed.

use crate::download::events::same_listener;
use crate::download::{DownloadListener, DownloadManager, DownloadSettings};
use crate::error::{CacheError, CacheResult};
use crate::manifest::ManifestCatalog;
use crate::transport::Transport;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;

pub struct ModelCache {
    transport: Arc<dyn Transport>,
    catalog: Arc<ManifestCatalog>,
    current: RwLock<Current>,
    /// Re-registered on every manager this context creates
    listeners: Mutex<Vec<Arc<dyn DownloadListener>>>,
}

struct Current {
    settings: DownloadSettings,
    manager: DownloadManager,
}

impl ModelCache {
    /// Create the context; must be called from within a tokio runtime
    pub fn new(
        settings: DownloadSettings,
        transport: Arc<dyn Transport>,
        catalog: Arc<ManifestCatalog>,
    ) -> Self {
        let manager = DownloadManager::new(settings.clone(), transport.clone(), catalog.clone());

        Self {
            transport,
            catalog,
            current: RwLock::new(Current { settings, manager }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// The manager for the current cache root
    pub async fn manager(&self) -> DownloadManager {
        self.current.read().await.manager.clone()
    }

    pub async fn cache_root(&self) -> PathBuf {
        self.current.read().await.settings.cache_root.clone()
    }

    /// Register a listener on the current manager and every later one
    pub async fn add_listener(&self, listener: Arc<dyn DownloadListener>) {
        {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            if !listeners.iter().any(|l| same_listener(l, &listener)) {
                listeners.push(listener.clone());
            }
        }
        self.current.read().await.manager.add_listener(listener);
    }

    /// Discard all in-memory state and re-root the cache at `cache_root`
    ///
    /// Running transfers are paused first, so their partial data stays on
    /// disk under the old root. Channel subscribers of the old manager see
    /// their stream close.
    pub async fn reset_instance(&self, cache_root: impl Into<PathBuf>) -> CacheResult<DownloadManager> {
        let cache_root = cache_root.into();
        tokio::fs::create_dir_all(&cache_root)
            .await
            .map_err(|e| CacheError::io(&cache_root, e))?;

        let mut current = self.current.write().await;
        current.manager.shutdown().await;

        let settings = DownloadSettings {
            cache_root: cache_root.clone(),
            ..current.settings.clone()
        };
        let manager =
            DownloadManager::new(settings.clone(), self.transport.clone(), self.catalog.clone());

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            manager.add_listener(listener);
        }

        *current = Current {
            settings,
            manager: manager.clone(),
        };

        tracing::info!(cache_root = ?cache_root, "Cache context reset");
        Ok(manager)
    }
}
