//! Essential-file manifests and per-repository download profiles

use crate::config::CacheConfig;
use crate::layout::RepositoryId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Revision resolved when a repository does not name one
pub const DEFAULT_REVISION: &str = "main";

/// Files a Qwen2.5-Omni MNN export cannot load without
pub const QWEN2_5_OMNI_FILES: &[&str] = &[
    "config.json",
    "llm.mnn",
    "llm.mnn.weight",
    "embeddings_bf16.bin",
    "tokenizer.txt",
    "audio.mnn",
    "audio.mnn.weight",
    "bigvgan.mnn",
    "bigvgan.mnn.weight",
    "dit.mnn",
    "dit.mnn.weight",
    "predit.mnn",
    "predit.mnn.weight",
];

/// Built-in manifest families, available without configuration
const BUILTIN_FAMILIES: &[(&str, &[&str])] = &[("qwen2.5-omni", QWEN2_5_OMNI_FILES)];

/// Ordered list of files a model family needs to be usable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EssentialManifest(Vec<String>);

impl EssentialManifest {
    pub fn new<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(files.into_iter().map(Into::into).collect())
    }

    /// Look up a built-in family by name
    pub fn builtin(family: &str) -> Option<Self> {
        BUILTIN_FAMILIES
            .iter()
            .find(|(name, _)| *name == family)
            .map(|(_, files)| Self::new(files.iter().copied()))
    }

    pub fn files(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How one repository is fetched and checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryProfile {
    pub manifest: EssentialManifest,
    pub revision: String,
}

impl Default for RepositoryProfile {
    fn default() -> Self {
        Self {
            manifest: EssentialManifest::default(),
            revision: DEFAULT_REVISION.to_string(),
        }
    }
}

/// Manifest families and the repositories assigned to them
#[derive(Debug, Clone)]
pub struct ManifestCatalog {
    families: HashMap<String, EssentialManifest>,
    profiles: HashMap<RepositoryId, RepositoryProfile>,
}

impl ManifestCatalog {
    /// Catalog with only the built-in families
    pub fn new() -> Self {
        let families = BUILTIN_FAMILIES
            .iter()
            .map(|(name, files)| (name.to_string(), EssentialManifest::new(files.iter().copied())))
            .collect();

        Self {
            families,
            profiles: HashMap::new(),
        }
    }

    /// Build the catalog from configured families and repositories
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let mut catalog = Self::new();

        for (family, files) in &config.manifests {
            catalog.add_family(family, EssentialManifest::new(files.iter().cloned()));
        }

        for repo in &config.repositories {
            let id = repo
                .repository_id()
                .with_context(|| format!("Invalid repository id '{}'", repo.id))?;

            let manifest = match &repo.manifest {
                Some(family) => catalog
                    .family(family)
                    .cloned()
                    .with_context(|| format!("Unknown manifest family '{}' for {}", family, id))?,
                None => EssentialManifest::default(),
            };

            catalog.assign(
                id,
                RepositoryProfile {
                    manifest,
                    revision: repo.revision.clone(),
                },
            );
        }

        Ok(catalog)
    }

    pub fn add_family(&mut self, name: &str, manifest: EssentialManifest) {
        self.families.insert(name.to_string(), manifest);
    }

    pub fn family(&self, name: &str) -> Option<&EssentialManifest> {
        self.families.get(name)
    }

    pub fn assign(&mut self, id: RepositoryId, profile: RepositoryProfile) {
        self.profiles.insert(id, profile);
    }

    /// Profile for a repository; unassigned repositories only need the marker
    pub fn profile(&self, id: &RepositoryId) -> RepositoryProfile {
        self.profiles.get(id).cloned().unwrap_or_default()
    }

    pub fn repositories(&self) -> impl Iterator<Item = &RepositoryId> {
        self.profiles.keys()
    }
}

impl Default for ManifestCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use crate::layout::RepoKind;

    #[test]
    fn test_builtin_family() {
        let manifest = EssentialManifest::builtin("qwen2.5-omni").unwrap();
        assert_eq!(manifest.files().len(), 13);
        assert_eq!(manifest.files()[0], "config.json");
        assert!(EssentialManifest::builtin("unknown").is_none());
    }

    #[test]
    fn test_default_profile() {
        let catalog = ManifestCatalog::new();
        let profile = catalog.profile(&RepositoryId::model("org/name").unwrap());
        assert!(profile.manifest.is_empty());
        assert_eq!(profile.revision, "main");
    }

    #[test]
    fn test_from_config() {
        let mut config = CacheConfig::default();
        config
            .manifests
            .insert("tiny".to_string(), vec!["config.json".to_string()]);
        config.repositories = vec![
            RepositoryConfig {
                id: "MNN/Qwen2.5-Omni-3B-MNN".to_string(),
                kind: RepoKind::Model,
                manifest: Some("qwen2.5-omni".to_string()),
                revision: "main".to_string(),
                prefetch: false,
            },
            RepositoryConfig {
                id: "org/tiny".to_string(),
                kind: RepoKind::Model,
                manifest: Some("tiny".to_string()),
                revision: "v1".to_string(),
                prefetch: true,
            },
        ];

        let catalog = ManifestCatalog::from_config(&config).unwrap();

        let omni = catalog.profile(&RepositoryId::model("MNN/Qwen2.5-Omni-3B-MNN").unwrap());
        assert_eq!(omni.manifest.files().len(), 13);

        let tiny = catalog.profile(&RepositoryId::model("org/tiny").unwrap());
        assert_eq!(tiny.manifest, EssentialManifest::new(["config.json"]));
        assert_eq!(tiny.revision, "v1");
        assert_eq!(catalog.repositories().count(), 2);
    }

    #[test]
    fn test_from_config_unknown_family() {
        let config = CacheConfig {
            repositories: vec![RepositoryConfig {
                id: "org/name".to_string(),
                kind: RepoKind::Model,
                manifest: Some("missing".to_string()),
                revision: "main".to_string(),
                prefetch: false,
            }],
            ..Default::default()
        };

        let err = ManifestCatalog::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_manifest_serializes_as_list() {
        let manifest = EssentialManifest::new(["a.json", "b.bin"]);
        let json = serde_json::to_string(&manifest).unwrap();
        assert_eq!(json, r#"["a.json","b.bin"]"#);
    }
}
