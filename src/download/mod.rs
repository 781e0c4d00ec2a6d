//! Download orchestration, progress state and lifecycle events

pub mod events;
pub mod info;
pub mod manager;
mod task;

pub use events::{DownloadEvent, DownloadListener, EventBus, TracingListener};
pub use info::{DownloadInfo, DownloadState};
pub use manager::{DownloadManager, DownloadSettings, StartOutcome};
