//! Workspace configurations known to the manager.
//!
//! Configuration CRUD lives elsewhere; the manager only needs to look up a
//! version by hash, know the latest version of every workspace, and read its
//! access-control data.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;

use anyhow::Context;
use serde::Deserialize;

use wsman_model::{
    GitRepository, SharedInstanceConfig, WorkspaceAccess, WorkspaceConfig, WorkspaceHash,
    WorkspaceId, WorkspaceVersion,
};

pub trait WorkspaceCatalog: Send + Sync {
    fn version(&self, hash: &WorkspaceHash) -> Option<WorkspaceVersion>;

    /// The newest version of every workspace.
    fn latest_versions(&self) -> Vec<WorkspaceVersion>;

    fn access(&self, id: &WorkspaceId) -> Option<WorkspaceAccess>;

    fn latest_version(&self, id: &WorkspaceId) -> Option<WorkspaceVersion> {
        self.latest_versions().into_iter().find(|v| v.id() == id)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "workspace")]
    workspaces: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    repositories: Vec<GitRepository>,
    #[serde(default)]
    shared_instances: Vec<SharedInstanceConfig>,
    #[serde(default)]
    memory_limit: Option<String>,
    #[serde(default)]
    base_image: Option<String>,
    #[serde(default)]
    access: WorkspaceAccess,
}

#[derive(Default)]
struct CatalogState {
    versions: HashMap<WorkspaceHash, WorkspaceVersion>,
    latest: BTreeMap<WorkspaceId, WorkspaceHash>,
    access: HashMap<WorkspaceId, WorkspaceAccess>,
}

/// Catalog backed by a TOML file. Reloading keeps every version seen so far,
/// so instances of superseded versions stay resolvable until they retire.
#[derive(Default)]
pub struct StaticCatalog {
    state: RwLock<CatalogState>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let catalog = Self::new();
        catalog.apply_toml(raw)?;
        Ok(catalog)
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let catalog = Self::new();
        catalog.reload(path).await?;
        Ok(catalog)
    }

    pub async fn reload(&self, path: &Path) -> anyhow::Result<()> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read catalog {}", path.display()))?;
        self.apply_toml(&raw)
            .with_context(|| format!("parse catalog {}", path.display()))
    }

    fn apply_toml(&self, raw: &str) -> anyhow::Result<()> {
        let file: CatalogFile = toml::from_str(raw)?;
        for entry in file.workspaces {
            let id = WorkspaceId(entry.id);
            if id.as_str().is_empty() || !id.as_str().chars().all(|c| c.is_ascii_alphanumeric()) {
                anyhow::bail!("workspace id {:?} must be alphanumeric", id.as_str());
            }
            let config = WorkspaceConfig {
                id,
                name: entry.name,
                repositories: entry.repositories,
                shared_instances: entry.shared_instances,
                memory_limit: entry.memory_limit,
                base_image: entry.base_image,
            };
            self.publish(config, entry.access);
        }
        Ok(())
    }

    /// Records `config` as the latest version of its workspace.
    pub fn publish(&self, config: WorkspaceConfig, access: WorkspaceAccess) -> WorkspaceVersion {
        let version = WorkspaceVersion::new(config);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state
            .latest
            .insert(version.id().clone(), version.hash().clone());
        state.access.insert(version.id().clone(), access);
        state
            .versions
            .insert(version.hash().clone(), version.clone());
        version
    }
}

impl WorkspaceCatalog for StaticCatalog {
    fn version(&self, hash: &WorkspaceHash) -> Option<WorkspaceVersion> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .versions
            .get(hash)
            .cloned()
    }

    fn latest_versions(&self) -> Vec<WorkspaceVersion> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .latest
            .values()
            .filter_map(|hash| state.versions.get(hash).cloned())
            .collect()
    }

    fn access(&self, id: &WorkspaceId) -> Option<WorkspaceAccess> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .access
            .get(id)
            .cloned()
    }
}
