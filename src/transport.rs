//! Remote registry access
//!
//! The orchestrator talks to the registry through [`Transport`]: one call to
//! resolve a revision into a commit and file list, one call to open a file body
//! from a byte offset. [`HubTransport`] is the production implementation,
//! using hf-hub for repository metadata and reqwest for ranged file bodies.

use crate::layout::{RepoKind, RepositoryId};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use hf_hub::api::tokio::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use reqwest::{StatusCode, header};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Stream of body chunks for one file
pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// Transport failures; all of them end the transfer in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("cannot resolve {repo}: {message}")]
    Resolve { repo: String, message: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("no data received for {0} seconds")]
    Stalled(u64),

    #[error("{path} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("cannot write {path}: {message}")]
    Write { path: String, message: String },

    #[error("registry returned unsafe path '{0}'")]
    UnsafePath(String),
}

/// One file of a remote snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Path relative to the snapshot root
    pub path: String,
    pub url: String,
    pub size: Option<u64>,
}

/// A revision resolved to a commit and its file list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSnapshot {
    pub commit: String,
    pub files: Vec<RemoteFile>,
}

impl RemoteSnapshot {
    /// Sum of the sizes the registry reported
    pub fn total_size(&self) -> u64 {
        self.files.iter().filter_map(|f| f.size).sum()
    }

    /// Reject a commit or file path that would land outside the repository
    /// folder once joined onto cache paths
    pub fn check_paths(&self) -> Result<(), TransferError> {
        let commit_is_component = matches!(
            Path::new(&self.commit).components().collect::<Vec<_>>().as_slice(),
            [Component::Normal(_)]
        );
        if !commit_is_component || self.commit.contains(['/', '\\']) {
            return Err(TransferError::UnsafePath(self.commit.clone()));
        }

        for file in &self.files {
            let path = Path::new(&file.path);
            let relative = !file.path.is_empty()
                && !file.path.contains('\\')
                && path
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)));
            if !relative {
                return Err(TransferError::UnsafePath(file.path.clone()));
            }
        }

        Ok(())
    }
}

/// An opened file body
pub struct RemoteBody {
    /// True when the body starts at the requested offset, false when it
    /// restarts from zero
    pub resumed: bool,
    pub stream: ByteStream,
}

impl RemoteBody {
    pub fn empty(resumed: bool) -> Self {
        Self {
            resumed,
            stream: stream::empty().boxed(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolve `revision` of `repo` into a commit and its files
    async fn resolve(
        &self,
        repo: &RepositoryId,
        revision: &str,
    ) -> Result<RemoteSnapshot, TransferError>;

    /// Open `file` starting at byte `offset`
    async fn open(&self, file: &RemoteFile, offset: u64) -> Result<RemoteBody, TransferError>;
}

/// Connection settings for [`HubTransport`]
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub endpoint: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
    /// Scratch directory hf-hub requires; repository files never land here
    pub cache_dir: PathBuf,
}

/// Hugging Face compatible registry transport
pub struct HubTransport {
    api: Api,
    client: reqwest::Client,
    token: Option<String>,
}

impl HubTransport {
    pub fn new(settings: HubSettings) -> anyhow::Result<Self> {
        let api = ApiBuilder::new()
            .with_endpoint(settings.endpoint.clone())
            .with_cache_dir(settings.cache_dir.join(".hub"))
            .with_token(settings.token.clone())
            .with_progress(false)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HF API client: {}", e))?;

        let client = reqwest::Client::builder()
            .tcp_nodelay(true)
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            api,
            client,
            token: settings.token,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// File size from a HEAD request, if the registry reports one
    async fn head_size(&self, url: &str) -> Option<u64> {
        let response = self.request(reqwest::Method::HEAD, url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }

        let headers = response.headers();
        headers
            .get("x-linked-size")
            .or_else(|| headers.get(header::CONTENT_LENGTH))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

fn repo_type(kind: RepoKind) -> RepoType {
    match kind {
        RepoKind::Model => RepoType::Model,
        RepoKind::Dataset => RepoType::Dataset,
        RepoKind::Space => RepoType::Space,
    }
}

#[async_trait]
impl Transport for HubTransport {
    async fn resolve(
        &self,
        repo: &RepositoryId,
        revision: &str,
    ) -> Result<RemoteSnapshot, TransferError> {
        let api_repo = self.api.repo(Repo::with_revision(
            repo.identifier().to_string(),
            repo_type(repo.kind()),
            revision.to_string(),
        ));

        let info = api_repo.info().await.map_err(|e| TransferError::Resolve {
            repo: repo.to_string(),
            message: e.to_string(),
        })?;

        // File URLs are pinned to the resolved commit, not the moving revision
        let pinned = self.api.repo(Repo::with_revision(
            repo.identifier().to_string(),
            repo_type(repo.kind()),
            info.sha.clone(),
        ));

        let mut files = Vec::with_capacity(info.siblings.len());
        for sibling in info.siblings {
            let url = pinned.url(&sibling.rfilename);
            let size = self.head_size(&url).await;
            files.push(RemoteFile {
                path: sibling.rfilename,
                url,
                size,
            });
        }

        tracing::debug!(repo = %repo, commit = %info.sha, files = files.len(), "Resolved snapshot");

        Ok(RemoteSnapshot {
            commit: info.sha,
            files,
        })
    }

    async fn open(&self, file: &RemoteFile, offset: u64) -> Result<RemoteBody, TransferError> {
        let mut request = self.request(reqwest::Method::GET, &file.url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let resumed = match response.status() {
            StatusCode::PARTIAL_CONTENT => true,
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                // Nothing left past the offset
                return Ok(RemoteBody::empty(true));
            }
            status if status.is_success() => {
                if offset > 0 {
                    tracing::warn!(url = %file.url, "Server ignored range request, restarting file");
                }
                false
            }
            status => {
                return Err(TransferError::Status {
                    url: file.url.clone(),
                    status: status.as_u16(),
                });
            }
        };

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransferError::Network(e.to_string())))
            .boxed();

        Ok(RemoteBody { resumed, stream })
    }
}
