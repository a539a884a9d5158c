//! Integration Store Module
//!
//! Durable keyed storage of integrations. Every mutation persists a manifest
//! to `<root>/<id>.json`; reads are served from the in-memory index that is
//! populated from disk at startup.

use crate::{
    events::{EventBus, IntegrationEvent},
    models::{Category, InstallMetadata, Integration, IntegrationPatch, Manifest, MarketplaceMetadata},
    Result, RuntimeError,
};
use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Durable integration registry
#[derive(Debug)]
pub struct IntegrationStore {
    /// Directory holding one manifest file per integration
    root: PathBuf,

    /// Live manifests indexed by integration id
    manifests: DashMap<String, Manifest>,

    /// Secondary indices; the write lock also serializes mutations
    indices: RwLock<StoreIndices>,

    events: EventBus,
}

#[derive(Debug, Default)]
struct StoreIndices {
    by_name: HashMap<String, String>,
    by_category: HashMap<Category, HashSet<String>>,
    by_author: HashMap<String, HashSet<String>>,
    by_tag: HashMap<String, HashSet<String>>,
}

impl StoreIndices {
    fn insert(&mut self, integration: &Integration) {
        let id = integration.id.clone();
        self.by_name.insert(integration.name.clone(), id.clone());
        self.by_category
            .entry(integration.category)
            .or_default()
            .insert(id.clone());
        self.by_author
            .entry(integration.author.clone())
            .or_default()
            .insert(id.clone());
        for tag in &integration.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(id.clone());
        }
    }

    fn remove(&mut self, integration: &Integration) {
        let id = &integration.id;
        if self.by_name.get(&integration.name) == Some(id) {
            self.by_name.remove(&integration.name);
        }
        remove_from(&mut self.by_category, &integration.category, id);
        remove_from(&mut self.by_author, &integration.author, id);
        for tag in &integration.tags {
            remove_from(&mut self.by_tag, tag, id);
        }
    }
}

fn remove_from<K: std::hash::Hash + Eq>(index: &mut HashMap<K, HashSet<String>>, key: &K, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

/// Search criteria; every present field must match
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationFilter {
    /// Case-insensitive substring of the name
    pub name: Option<String>,
    pub category: Option<Category>,
    pub author: Option<String>,
    /// Matches integrations carrying any of these tags
    pub tags: Option<Vec<String>>,
}

impl IntegrationFilter {
    fn matches(&self, integration: &Integration) -> bool {
        if let Some(name) = &self.name {
            if !integration
                .name
                .to_lowercase()
                .contains(&name.to_lowercase())
            {
                return false;
            }
        }
        if let Some(category) = self.category {
            if integration.category != category {
                return false;
            }
        }
        if let Some(author) = &self.author {
            if &integration.author != author {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !tags.is_empty() && !tags.iter().any(|tag| integration.tags.contains(tag)) {
                return false;
            }
        }
        true
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub enabled: usize,
    pub by_category: BTreeMap<String, usize>,
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("static id pattern compiles")
    })
}

/// Ids double as file names and must not escape the storage root
fn check_id(id: &str) -> Result<()> {
    if id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(RuntimeError::validation(
            "id",
            format!("Invalid integration id '{}'", id),
        ))
    }
}

impl IntegrationStore {
    /// Create an empty store rooted at `root` without touching the disk
    pub fn new(root: impl Into<PathBuf>, events: EventBus) -> Self {
        Self {
            root: root.into(),
            manifests: DashMap::new(),
            indices: RwLock::new(StoreIndices::default()),
            events,
        }
    }

    /// Create the storage root if needed and load every manifest in it
    pub async fn open(root: impl Into<PathBuf>, events: EventBus) -> Result<Self> {
        let store = Self::new(root, events);
        tokio::fs::create_dir_all(&store.root).await.map_err(|e| {
            RuntimeError::Storage(format!(
                "cannot create storage root {}: {}",
                store.root.display(),
                e
            ))
        })?;
        store.load().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load all manifests from disk into the index. Any unreadable file is fatal.
    pub async fn load(&self) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            RuntimeError::Storage(format!(
                "cannot read storage root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let mut indices = self.indices.write().await;
        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let raw = tokio::fs::read(&path).await?;
            let manifest: Manifest = serde_json::from_slice(&raw).map_err(|e| {
                RuntimeError::Storage(format!("corrupt manifest {}: {}", path.display(), e))
            })?;
            let integration = &manifest.integration;
            check_id(&integration.id)?;

            if let Some(existing) = indices.by_name.get(&integration.name) {
                if existing != &integration.id {
                    return Err(RuntimeError::Storage(format!(
                        "manifest {} reuses name '{}'",
                        path.display(),
                        integration.name
                    )));
                }
            }

            indices.insert(integration);
            debug!(integration_id = %integration.id, path = %path.display(), "Loaded manifest");
            self.manifests.insert(integration.id.clone(), manifest);
            loaded += 1;
        }

        info!(count = loaded, root = %self.root.display(), "Integration store loaded");
        Ok(loaded)
    }

    /// Register a new integration from the API
    pub async fn register(&self, integration: Integration) -> Result<String> {
        self.register_from(integration, "api", None).await
    }

    /// Register a new integration with explicit install metadata
    pub async fn register_from(
        &self,
        mut integration: Integration,
        source: &str,
        marketplace: Option<MarketplaceMetadata>,
    ) -> Result<String> {
        if integration.id.is_empty() {
            integration.id = Uuid::new_v4().to_string();
        }
        check_id(&integration.id)?;

        let mut indices = self.indices.write().await;
        if indices.by_name.contains_key(&integration.name) {
            return Err(RuntimeError::DuplicateName(integration.name));
        }
        if self.manifests.contains_key(&integration.id) {
            return Err(RuntimeError::validation(
                "id",
                format!("Integration id '{}' is already in use", integration.id),
            ));
        }

        let manifest = Manifest {
            integration,
            install: InstallMetadata::new(source),
            marketplace,
        };
        self.persist(&manifest).await?;

        let id = manifest.integration.id.clone();
        let name = manifest.integration.name.clone();
        indices.insert(&manifest.integration);
        self.manifests.insert(id.clone(), manifest);
        drop(indices);

        info!(integration_id = %id, integration_name = %name, source, "Integration registered");
        self.events.publish_integration(IntegrationEvent::Registered {
            integration_id: id.clone(),
            name,
        });
        Ok(id)
    }

    /// Remove an integration and delete its manifest.
    ///
    /// The file goes first; if it cannot be deleted the integration stays
    /// registered, so memory never disagrees with what the next load sees.
    pub async fn unregister(&self, id: &str) -> Result<Integration> {
        let mut indices = self.indices.write().await;
        if !self.manifests.contains_key(id) {
            return Err(RuntimeError::not_found("Integration", id));
        }

        let path = self.manifest_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(integration_id = %id, "Manifest already missing on disk");
            }
            Err(e) => {
                return Err(RuntimeError::Storage(format!(
                    "cannot delete manifest {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        let Some((_, manifest)) = self.manifests.remove(id) else {
            return Err(RuntimeError::not_found("Integration", id));
        };
        indices.remove(&manifest.integration);
        drop(indices);

        let integration = manifest.integration;
        info!(integration_id = %id, integration_name = %integration.name, "Integration unregistered");
        self.events.publish_integration(IntegrationEvent::Unregistered {
            integration_id: id.to_string(),
            name: integration.name.clone(),
        });
        Ok(integration)
    }

    pub fn get(&self, id: &str) -> Option<Integration> {
        self.manifests
            .get(id)
            .map(|entry| entry.integration.clone())
    }

    pub fn get_manifest(&self, id: &str) -> Option<Manifest> {
        self.manifests.get(id).map(|entry| entry.clone())
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Integration> {
        let indices = self.indices.read().await;
        indices.by_name.get(name).and_then(|id| self.get(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.manifests.contains_key(id)
    }

    /// All integrations ordered by name
    pub fn list(&self) -> Vec<Integration> {
        let mut integrations: Vec<Integration> = self
            .manifests
            .iter()
            .map(|entry| entry.integration.clone())
            .collect();
        integrations.sort_by(|a, b| a.name.cmp(&b.name));
        integrations
    }

    pub async fn search(&self, filter: &IntegrationFilter) -> Vec<Integration> {
        let candidates: Option<HashSet<String>> = {
            let indices = self.indices.read().await;
            if let Some(category) = filter.category {
                Some(indices.by_category.get(&category).cloned().unwrap_or_default())
            } else if let Some(author) = &filter.author {
                Some(indices.by_author.get(author).cloned().unwrap_or_default())
            } else {
                filter.tags.as_ref().filter(|tags| !tags.is_empty()).map(|tags| {
                    tags.iter()
                        .filter_map(|tag| indices.by_tag.get(tag))
                        .flatten()
                        .cloned()
                        .collect()
                })
            }
        };

        let mut results: Vec<Integration> = match candidates {
            Some(ids) => ids.iter().filter_map(|id| self.get(id)).collect(),
            None => self.list(),
        };
        results.retain(|integration| filter.matches(integration));
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }

    /// Apply a partial update; the id is preserved
    pub async fn update(&self, id: &str, patch: &IntegrationPatch) -> Result<Integration> {
        let current = self
            .get(id)
            .ok_or_else(|| RuntimeError::not_found("Integration", id))?;
        let mut updated = current;
        patch.apply_to(&mut updated);
        let updated = self.replace(id, updated).await?;
        if let Some(enabled) = patch.enabled {
            self.set_enabled(id, enabled).await?;
        }
        Ok(updated)
    }

    /// Replace every mutable field of an integration with `integration`'s
    pub async fn replace(&self, id: &str, mut integration: Integration) -> Result<Integration> {
        integration.id = id.to_string();

        let mut indices = self.indices.write().await;
        let mut manifest = self
            .manifests
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| RuntimeError::not_found("Integration", id))?;

        if let Some(owner) = indices.by_name.get(&integration.name) {
            if owner != id {
                return Err(RuntimeError::DuplicateName(integration.name));
            }
        }

        let previous = std::mem::replace(&mut manifest.integration, integration);
        manifest.install.updated_at = Utc::now();
        self.persist(&manifest).await?;

        indices.remove(&previous);
        indices.insert(&manifest.integration);
        let updated = manifest.integration.clone();
        self.manifests.insert(id.to_string(), manifest);
        drop(indices);

        info!(integration_id = %id, integration_name = %updated.name, "Integration updated");
        self.events.publish_integration(IntegrationEvent::Updated {
            integration_id: id.to_string(),
            name: updated.name.clone(),
        });
        Ok(updated)
    }

    /// Enable or disable an integration without touching its definition
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let _guard = self.indices.write().await;
        let mut manifest = self
            .manifests
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| RuntimeError::not_found("Integration", id))?;
        manifest.install.enabled = enabled;
        manifest.install.updated_at = Utc::now();
        self.persist(&manifest).await?;
        self.manifests.insert(id.to_string(), manifest);
        info!(integration_id = %id, enabled, "Integration enablement changed");
        Ok(())
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.manifests
            .get(id)
            .map(|entry| entry.install.enabled)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for entry in self.manifests.iter() {
            stats.total += 1;
            if entry.install.enabled {
                stats.enabled += 1;
            }
            *stats
                .by_category
                .entry(entry.integration.category.to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    /// Write-to-temp then rename so a crash never leaves a torn manifest
    async fn persist(&self, manifest: &Manifest) -> Result<()> {
        let id = &manifest.integration.id;
        let path = self.manifest_path(id);
        let tmp = self.root.join(format!(".{}.json.tmp", id));
        let body = serde_json::to_vec_pretty(manifest)?;

        tokio::fs::write(&tmp, body).await.map_err(|e| {
            RuntimeError::Storage(format!("cannot write manifest {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            RuntimeError::Storage(format!("cannot commit manifest {}: {}", path.display(), e))
        })?;

        debug!(integration_id = %id, path = %path.display(), "Manifest persisted");
        Ok(())
    }
}
