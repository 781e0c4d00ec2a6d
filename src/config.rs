//! Configuration structures and loading logic

use crate::download::DownloadSettings;
use crate::layout::{InvalidRepositoryId, RepoKind, RepositoryId};
use crate::manifest::{DEFAULT_REVISION, EssentialManifest};
use crate::transport::HubSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Main cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub api_port: u16,
    pub cache_root: PathBuf,
    pub endpoint: String,

    /// Registry access token, only ever taken from the environment
    #[serde(skip)]
    pub hf_token: Option<String>,

    pub progress_interval_ms: u64,
    pub chunk_timeout_secs: u64,
    pub connect_timeout_secs: u64,

    /// Manifest families: name -> essential files
    pub manifests: BTreeMap<String, Vec<String>>,
    pub repositories: Vec<RepositoryConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            cache_root: default_cache_root(),
            endpoint: default_endpoint(),
            hf_token: None,
            progress_interval_ms: default_progress_interval_ms(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            manifests: BTreeMap::new(),
            repositories: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("MODEL_CACHE_API_PORT") {
            config.api_port = port
                .parse()
                .context("Invalid MODEL_CACHE_API_PORT value")?;
        }
        if let Ok(root) = std::env::var("MODEL_CACHE_ROOT") {
            config.cache_root = PathBuf::from(root);
        }
        if let Ok(endpoint) = std::env::var("MODEL_CACHE_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(token) = std::env::var("HF_TOKEN")
            && !token.is_empty()
        {
            config.hf_token = Some(token);
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.progress_interval_ms == 0 {
            anyhow::bail!("progress_interval_ms must be greater than zero");
        }
        if self.chunk_timeout_secs == 0 {
            anyhow::bail!("chunk_timeout_secs must be greater than zero");
        }

        for (family, files) in &self.manifests {
            if files.iter().any(|f| f.is_empty() || f.starts_with('/')) {
                anyhow::bail!(
                    "Manifest '{}' entries must be non-empty relative paths",
                    family
                );
            }
        }

        let mut seen = HashSet::new();
        for repo in &self.repositories {
            let id = repo
                .repository_id()
                .with_context(|| format!("Invalid repository id '{}'", repo.id))?;

            if let Some(family) = &repo.manifest
                && !self.manifests.contains_key(family)
                && EssentialManifest::builtin(family).is_none()
            {
                anyhow::bail!("Repository '{}' uses unknown manifest '{}'", repo.id, family);
            }
            if repo.revision.is_empty() || repo.revision.contains('/') {
                anyhow::bail!(
                    "Repository '{}' revision '{}' must be a single path component",
                    repo.id,
                    repo.revision
                );
            }
            if !seen.insert(id) {
                anyhow::bail!("Duplicate repository: {}", repo.id);
            }
        }

        // Ensure the cache root exists or can be created
        if !self.cache_root.exists() {
            std::fs::create_dir_all(&self.cache_root)
                .with_context(|| format!("Cannot create cache root: {:?}", self.cache_root))?;
        }

        Ok(())
    }

    /// Orchestrator settings derived from this configuration
    pub fn download_settings(&self) -> DownloadSettings {
        DownloadSettings {
            cache_root: self.cache_root.clone(),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            chunk_timeout: Duration::from_secs(self.chunk_timeout_secs),
        }
    }

    /// Transport settings derived from this configuration
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            endpoint: self.endpoint.clone(),
            token: self.hf_token.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            cache_dir: self.cache_root.clone(),
        }
    }
}

/// A repository the cache knows about up front
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RepositoryConfig {
    /// Registry identifier, e.g. "MNN/Qwen2.5-Omni-3B-MNN"
    pub id: String,

    #[serde(default = "default_kind")]
    pub kind: RepoKind,

    /// Manifest family checked after installation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,

    #[serde(default = "default_revision")]
    pub revision: String,

    /// Start downloading as soon as the service comes up
    #[serde(default)]
    pub prefetch: bool,
}

impl RepositoryConfig {
    pub fn repository_id(&self) -> Result<RepositoryId, InvalidRepositoryId> {
        RepositoryId::new(self.kind, &self.id)
    }
}

// Default functions
fn default_api_port() -> u16 {
    9300
}
fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("model-cache"))
        .unwrap_or_else(|| PathBuf::from("/tmp/model-cache"))
}
fn default_endpoint() -> String {
    "https://huggingface.co".to_string()
}
fn default_progress_interval_ms() -> u64 {
    500
}
fn default_chunk_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_kind() -> RepoKind {
    RepoKind::Model
}
fn default_revision() -> String {
    DEFAULT_REVISION.to_string()
}
