//! Shared helpers for download integration tests
//!
//! `ScriptedTransport` serves in-memory files in small chunks. Its gate lets a
//! test hold every body after the first chunk, so a transfer can be observed
//! (and paused or removed) while it is still `Downloading`.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use model_cache::{
    DownloadEvent, DownloadManager, DownloadSettings, EssentialManifest, ManifestCatalog,
    RemoteBody, RemoteFile, RemoteSnapshot, RepositoryId, RepositoryProfile, TransferError,
    Transport,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

pub const CHUNK_SIZE: usize = 4;

pub struct ScriptedTransport {
    commit: Mutex<String>,
    files: Vec<(String, Vec<u8>)>,
    gate: watch::Sender<bool>,
    ignore_ranges: AtomicBool,
    fail_resolve: AtomicBool,
    resolves: AtomicUsize,
    opened: Mutex<Vec<(String, u64)>>,
}

impl ScriptedTransport {
    /// Transport with the gate open
    pub fn new(commit: &str, files: &[(&str, &[u8])]) -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            commit: Mutex::new(commit.to_string()),
            files: files
                .iter()
                .map(|(name, data)| (name.to_string(), data.to_vec()))
                .collect(),
            gate,
            ignore_ranges: AtomicBool::new(false),
            fail_resolve: AtomicBool::new(false),
            resolves: AtomicUsize::new(0),
            opened: Mutex::new(Vec::new()),
        })
    }

    /// Transport whose bodies stall after their first chunk until `open_gate`
    pub fn gated(commit: &str, files: &[(&str, &[u8])]) -> Arc<Self> {
        let transport = Self::new(commit, files);
        transport.close_gate();
        transport
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn set_commit(&self, commit: &str) {
        *self.commit.lock().unwrap() = commit.to_string();
    }

    pub fn ignore_ranges(&self) {
        self.ignore_ranges.store(true, Ordering::SeqCst);
    }

    pub fn fail_resolve(&self) {
        self.fail_resolve.store(true, Ordering::SeqCst);
    }

    /// Undo `fail_resolve`
    pub fn restore_resolve(&self) {
        self.fail_resolve.store(false, Ordering::SeqCst);
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    /// Every `(file, offset)` the orchestrator opened, in order
    pub fn opened(&self) -> Vec<(String, u64)> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn resolve(
        &self,
        repo: &RepositoryId,
        _revision: &str,
    ) -> Result<RemoteSnapshot, TransferError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if self.fail_resolve.load(Ordering::SeqCst) {
            return Err(TransferError::Resolve {
                repo: repo.to_string(),
                message: "repository not found".to_string(),
            });
        }

        Ok(RemoteSnapshot {
            commit: self.commit.lock().unwrap().clone(),
            files: self
                .files
                .iter()
                .map(|(name, data)| RemoteFile {
                    path: name.clone(),
                    url: format!("scripted://{}", name),
                    size: Some(data.len() as u64),
                })
                .collect(),
        })
    }

    async fn open(&self, file: &RemoteFile, offset: u64) -> Result<RemoteBody, TransferError> {
        self.opened.lock().unwrap().push((file.path.clone(), offset));

        let data = self
            .files
            .iter()
            .find(|(name, _)| *name == file.path)
            .map(|(_, data)| data.clone())
            .unwrap_or_default();

        let resumed = offset > 0 && !self.ignore_ranges.load(Ordering::SeqCst);
        let start = if resumed {
            (offset as usize).min(data.len())
        } else {
            0
        };

        let gate = self.gate.subscribe();
        let body = stream::unfold(
            (data, start, gate, false),
            |(data, pos, mut gate, sent_any)| async move {
                if pos >= data.len() {
                    return None;
                }
                if sent_any {
                    let _ = gate.wait_for(|open| *open).await;
                }
                let end = (pos + CHUNK_SIZE).min(data.len());
                let chunk = Bytes::copy_from_slice(&data[pos..end]);
                Some((Ok(chunk), (data, end, gate, true)))
            },
        );

        Ok(RemoteBody {
            resumed,
            stream: body.boxed(),
        })
    }
}

pub fn repo() -> RepositoryId {
    RepositoryId::model("org/tiny").unwrap()
}

pub fn settings(root: &Path) -> DownloadSettings {
    DownloadSettings {
        cache_root: root.to_path_buf(),
        progress_interval: Duration::ZERO,
        chunk_timeout: Duration::from_secs(5),
    }
}

pub fn catalog(manifest: &[&str]) -> Arc<ManifestCatalog> {
    let mut catalog = ManifestCatalog::new();
    catalog.assign(
        repo(),
        RepositoryProfile {
            manifest: EssentialManifest::new(manifest.iter().copied()),
            revision: "main".to_string(),
        },
    );
    Arc::new(catalog)
}

pub fn manager(root: &Path, transport: Arc<ScriptedTransport>, manifest: &[&str]) -> DownloadManager {
    DownloadManager::new(settings(root), transport, catalog(manifest))
}

/// Wait for the next event named `name` for any repository
pub async fn wait_for(rx: &mut broadcast::Receiver<DownloadEvent>, name: &str) -> DownloadEvent {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if event.name() == name => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed while waiting for {name}: {e}"),
            }
        }
    };

    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
}

/// Wait for the transfer to end and return the terminal event
pub async fn wait_for_terminal(rx: &mut broadcast::Receiver<DownloadEvent>) -> DownloadEvent {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event)
                    if matches!(event.name(), "finished" | "failed" | "paused" | "removed") =>
                {
                    return event;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    };

    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("transfer did not finish")
}
