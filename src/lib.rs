//! Model Cache - local cache and installer for model repositories
//!
//! Downloads multi-file model repositories from a remote registry into a
//! content-addressed cache, publishes each snapshot atomically at a stable
//! path, and only hands out paths that pass completeness validation.

pub mod api;
pub mod config;
pub mod download;
pub mod error;
pub mod installer;
pub mod layout;
pub mod manifest;
pub mod metrics;
pub mod runtime;
pub mod transport;
pub mod validator;

pub use config::{CacheConfig, RepositoryConfig};
pub use download::{
    DownloadEvent, DownloadInfo, DownloadListener, DownloadManager, DownloadSettings,
    DownloadState, StartOutcome, TracingListener,
};
pub use error::{ApiError, CacheError, CacheResult};
pub use installer::{InstallError, InstallMethod, Installer, SUCCESS_MARKER};
pub use layout::{CacheLayout, InvalidRepositoryId, RepoKind, RepositoryId};
pub use manifest::{EssentialManifest, ManifestCatalog, RepositoryProfile};
pub use runtime::ModelCache;
pub use transport::{HubTransport, RemoteBody, RemoteFile, RemoteSnapshot, TransferError, Transport};
pub use validator::{ValidationFailure, is_valid_model_dir, validate};
