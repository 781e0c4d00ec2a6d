//! Download lifecycle events and listener dispatch
//!
//! Events are queued to a single dispatcher task, which calls registered
//! listeners in registration order. Emitters never run listener code and never
//! hold a lock while a listener runs.

use super::info::DownloadInfo;
use crate::layout::RepositoryId;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Events emitted during a repository's download lifecycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started {
        repository: RepositoryId,
    },
    Progress {
        info: DownloadInfo,
    },
    TotalSize {
        repository: RepositoryId,
        total_bytes: u64,
    },
    Finished {
        repository: RepositoryId,
        path: PathBuf,
    },
    Failed {
        repository: RepositoryId,
        error: String,
    },
    Paused {
        repository: RepositoryId,
    },
    Removed {
        repository: RepositoryId,
    },
    HasUpdate {
        info: DownloadInfo,
    },
}

impl DownloadEvent {
    pub fn repository(&self) -> &RepositoryId {
        match self {
            DownloadEvent::Progress { info } | DownloadEvent::HasUpdate { info } => &info.repository,
            DownloadEvent::Started { repository }
            | DownloadEvent::TotalSize { repository, .. }
            | DownloadEvent::Finished { repository, .. }
            | DownloadEvent::Failed { repository, .. }
            | DownloadEvent::Paused { repository }
            | DownloadEvent::Removed { repository } => repository,
        }
    }

    /// Event name, as used for server-sent events
    pub fn name(&self) -> &'static str {
        match self {
            DownloadEvent::Started { .. } => "started",
            DownloadEvent::Progress { .. } => "progress",
            DownloadEvent::TotalSize { .. } => "total_size",
            DownloadEvent::Finished { .. } => "finished",
            DownloadEvent::Failed { .. } => "failed",
            DownloadEvent::Paused { .. } => "paused",
            DownloadEvent::Removed { .. } => "removed",
            DownloadEvent::HasUpdate { .. } => "has_update",
        }
    }

    /// Invoke the listener method matching this event
    pub fn deliver(&self, listener: &dyn DownloadListener) {
        match self {
            DownloadEvent::Started { repository } => listener.on_download_start(repository),
            DownloadEvent::Progress { info } => {
                listener.on_download_progress(&info.repository, info)
            }
            DownloadEvent::TotalSize {
                repository,
                total_bytes,
            } => listener.on_download_total_size(repository, *total_bytes),
            DownloadEvent::Finished { repository, path } => {
                listener.on_download_finished(repository, path)
            }
            DownloadEvent::Failed { repository, error } => {
                listener.on_download_failed(repository, error)
            }
            DownloadEvent::Paused { repository } => listener.on_download_paused(repository),
            DownloadEvent::Removed { repository } => listener.on_download_file_removed(repository),
            DownloadEvent::HasUpdate { info } => {
                listener.on_download_has_update(&info.repository, info)
            }
        }
    }
}

/// Observer of download lifecycle events
///
/// Every method defaults to a no-op. Methods are called from the dispatcher
/// task and should return quickly.
pub trait DownloadListener: Send + Sync {
    fn on_download_start(&self, _repo: &RepositoryId) {}
    fn on_download_progress(&self, _repo: &RepositoryId, _info: &DownloadInfo) {}
    fn on_download_finished(&self, _repo: &RepositoryId, _path: &Path) {}
    fn on_download_failed(&self, _repo: &RepositoryId, _error: &str) {}
    fn on_download_paused(&self, _repo: &RepositoryId) {}
    fn on_download_file_removed(&self, _repo: &RepositoryId) {}
    fn on_download_total_size(&self, _repo: &RepositoryId, _total_bytes: u64) {}
    fn on_download_has_update(&self, _repo: &RepositoryId, _info: &DownloadInfo) {}
}

/// Listener that logs every event
pub struct TracingListener;

impl DownloadListener for TracingListener {
    fn on_download_start(&self, repo: &RepositoryId) {
        tracing::info!(repo = %repo, "Download started");
    }

    fn on_download_progress(&self, repo: &RepositoryId, info: &DownloadInfo) {
        tracing::info!(
            repo = %repo,
            bytes = info.bytes_downloaded,
            total = info.total_bytes,
            speed = format!("{:.1} MB/s", info.speed_bytes_per_sec / (1024.0 * 1024.0)),
            file = ?info.current_file,
            "Download progress"
        );
    }

    fn on_download_finished(&self, repo: &RepositoryId, path: &Path) {
        tracing::info!(repo = %repo, path = ?path, "Download finished");
    }

    fn on_download_failed(&self, repo: &RepositoryId, error: &str) {
        tracing::error!(repo = %repo, error = %error, "Download failed");
    }

    fn on_download_paused(&self, repo: &RepositoryId) {
        tracing::info!(repo = %repo, "Download paused");
    }

    fn on_download_file_removed(&self, repo: &RepositoryId) {
        tracing::info!(repo = %repo, "Download removed");
    }

    fn on_download_total_size(&self, repo: &RepositoryId, total_bytes: u64) {
        tracing::info!(repo = %repo, total_bytes, "Download size known");
    }

    fn on_download_has_update(&self, repo: &RepositoryId, info: &DownloadInfo) {
        tracing::info!(repo = %repo, commit = ?info.commit, "Update available");
    }
}

type ListenerList = Arc<RwLock<Vec<Arc<dyn DownloadListener>>>>;

enum Dispatch {
    Event(DownloadEvent),
    Flush(oneshot::Sender<()>),
}

/// Fan-out of download events to listeners and channel subscribers
pub struct EventBus {
    queue: mpsc::UnboundedSender<Dispatch>,
    listeners: ListenerList,
    broadcast_tx: broadcast::Sender<DownloadEvent>,
}

impl EventBus {
    /// Create the bus and spawn its dispatcher task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let listeners: ListenerList = Arc::new(RwLock::new(Vec::new()));
        let (broadcast_tx, _) = broadcast::channel(256);

        tokio::spawn(dispatch_loop(rx, listeners.clone()));

        Self {
            queue,
            listeners,
            broadcast_tx,
        }
    }

    /// Register a listener; registering the same instance twice is a no-op
    pub fn add_listener(&self, listener: Arc<dyn DownloadListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DownloadListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| !same_listener(l, listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Subscribe to the raw event stream
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Queue an event for listeners, then publish it to subscribers
    ///
    /// A subscriber that has seen an event can `flush` to wait for the
    /// listeners to see it too.
    pub fn emit(&self, event: DownloadEvent) {
        let _ = self.queue.send(Dispatch::Event(event.clone()));
        // No receivers is fine
        let _ = self.broadcast_tx.send(event);
    }

    /// Wait until every event emitted so far has reached the listeners
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.queue.send(Dispatch::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of the listener instance, ignoring vtable differences
pub(crate) fn same_listener(a: &Arc<dyn DownloadListener>, b: &Arc<dyn DownloadListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Dispatch>, listeners: ListenerList) {
    while let Some(message) = rx.recv().await {
        let event = match message {
            Dispatch::Event(event) => event,
            Dispatch::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        // Snapshot so listeners may (un)register from inside a callback
        let snapshot: Vec<_> = listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in snapshot {
            let delivered = catch_unwind(AssertUnwindSafe(|| event.deliver(listener.as_ref())));
            if delivered.is_err() {
                tracing::error!(
                    repo = %event.repository(),
                    event = event.name(),
                    "Download listener panicked"
                );
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mocks::RecordingListener;
    use super::*;
    use std::sync::Mutex;

    fn repo() -> RepositoryId {
        RepositoryId::model("org/name").unwrap()
    }

    #[tokio::test]
    async fn test_listener_registration_is_idempotent() {
        let bus = EventBus::new();
        let listener = Arc::new(RecordingListener::default());
        let as_dyn: Arc<dyn DownloadListener> = listener.clone();

        bus.add_listener(as_dyn.clone());
        bus.add_listener(as_dyn.clone());
        assert_eq!(bus.listener_count(), 1);

        bus.emit(DownloadEvent::Started { repository: repo() });
        bus.flush().await;
        assert_eq!(listener.names(), vec!["started"]);

        bus.remove_listener(&as_dyn);
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_events_delivered_in_registration_order() {
        struct Ordered {
            tag: &'static str,
            log: Arc<Mutex<Vec<&'static str>>>,
        }

        impl DownloadListener for Ordered {
            fn on_download_paused(&self, _repo: &RepositoryId) {
                self.log.lock().unwrap().push(self.tag);
            }
        }

        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            bus.add_listener(Arc::new(Ordered {
                tag,
                log: log.clone(),
            }));
        }

        bus.emit(DownloadEvent::Paused { repository: repo() });
        bus.flush().await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_dispatch() {
        struct Panics;
        impl DownloadListener for Panics {
            fn on_download_start(&self, _repo: &RepositoryId) {
                panic!("listener bug");
            }
        }

        let bus = EventBus::new();
        let recorder = Arc::new(RecordingListener::default());
        bus.add_listener(Arc::new(Panics));
        bus.add_listener(recorder.clone());

        bus.emit(DownloadEvent::Started { repository: repo() });
        bus.emit(DownloadEvent::Removed { repository: repo() });
        bus.flush().await;

        assert_eq!(recorder.names(), vec!["started", "removed"]);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(DownloadEvent::TotalSize {
            repository: repo(),
            total_bytes: 42,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "total_size");
        assert_eq!(event.repository(), &repo());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = DownloadEvent::Failed {
            repository: repo(),
            error: "boom".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "failed");
        assert_eq!(json["error"], "boom");
        assert_eq!(json["repository"]["identifier"], "org/name");
    }
}
