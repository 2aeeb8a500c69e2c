//! Process-local registry: one JSON document indexing every node.
//!
//! The on-disk files remain the source of truth; `registry.json` is a fast
//! index in the same spirit as a rebuildable secondary index.  It is loaded
//! lazily into a cache guarded by an async mutex, and every mutation
//! re-serialises the whole document and atomically replaces the file before
//! the mutex is released.  Observers of `registry.json` therefore always see
//! one complete, internally-consistent document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::GraphError;
use crate::frontmatter::parse_node_text;
use crate::fsio::{atomic_write_creating, read_optional};
use crate::node::{Node, NodeType, Priority};

pub const REGISTRY_FILE: &str = "registry.json";

// ── Entry ─────────────────────────────────────────────────────────────────────

/// Compact per-node record.  Derived, never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// File category: `node`, `moc`, `reflection`, `now`, or `index`.
    pub kind: String,
    pub description: String,
    pub priority: Priority,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Path of the backing file, relative to the graph root.
    #[serde(rename = "filePath")]
    pub file_path: String,
    #[serde(
        rename = "canonicalKey",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub canonical_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub aliases: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub links: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub archived: Option<bool>,
    #[serde(
        rename = "mergedInto",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub merged_into: Option<String>,
}

impl RegistryEntry {
    pub fn from_node(node: &Node, kind: &str, rel_path: &str) -> Self {
        Self {
            node_type: node.header.node_type,
            kind: kind.to_string(),
            description: node.header.description.clone(),
            priority: node.header.priority,
            created: node.header.created,
            updated: node.header.updated,
            file_path: rel_path.to_string(),
            canonical_key: node.header.canonical_key.clone(),
            aliases: node.header.aliases.clone(),
            links: node.header.links.clone(),
            tags: node.header.tags.clone(),
            archived: node.header.archived,
            merged_into: node.header.merged_into.clone(),
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived.unwrap_or(false)
    }
}

/// Shallow field merge applied by [`Registry::update`].
#[derive(Debug, Clone, Default)]
pub struct RegistryPatch {
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub updated: Option<DateTime<Utc>>,
    pub canonical_key: Option<String>,
    pub aliases: Option<Vec<String>>,
    pub links: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub archived: Option<bool>,
    pub merged_into: Option<String>,
}

impl RegistryPatch {
    fn apply(self, entry: &mut RegistryEntry) {
        if let Some(v) = self.description {
            entry.description = v;
        }
        if let Some(v) = self.priority {
            entry.priority = v;
        }
        if let Some(v) = self.updated {
            entry.updated = v;
        }
        if let Some(v) = self.canonical_key {
            entry.canonical_key = Some(v);
        }
        if let Some(v) = self.aliases {
            entry.aliases = Some(v);
        }
        if let Some(v) = self.links {
            entry.links = Some(v);
        }
        if let Some(v) = self.tags {
            entry.tags = Some(v);
        }
        if let Some(v) = self.archived {
            entry.archived = Some(v);
        }
        if let Some(v) = self.merged_into {
            entry.merged_into = Some(v);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total: usize,
    pub archived: usize,
    /// Non-archived entries — the `Nodes: N` figure the index node reports.
    pub node_count: usize,
    pub by_type: BTreeMap<String, usize>,
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub struct Registry {
    root: PathBuf,
    cache: Mutex<Option<BTreeMap<String, RegistryEntry>>>,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    /// Insert or replace an entry, persisting before returning.
    pub async fn register(&self, id: &str, entry: RegistryEntry) -> Result<(), GraphError> {
        let mut guard = self.cache.lock().await;
        let map = self.loaded(&mut guard)?;
        map.insert(id.to_string(), entry);
        self.persist(map)
    }

    /// Shallow-merge `patch` into an existing entry.  Returns `false` when
    /// the id is unknown (nothing persisted).
    pub async fn update(&self, id: &str, patch: RegistryPatch) -> Result<bool, GraphError> {
        let mut guard = self.cache.lock().await;
        let map = self.loaded(&mut guard)?;
        let Some(entry) = map.get_mut(id) else {
            return Ok(false);
        };
        patch.apply(entry);
        self.persist(map)?;
        Ok(true)
    }

    /// Remove an entry outright.  Used when a node file is deleted.
    pub async fn remove(&self, id: &str) -> Result<bool, GraphError> {
        let mut guard = self.cache.lock().await;
        let map = self.loaded(&mut guard)?;
        let removed = map.remove(id).is_some();
        if removed {
            self.persist(map)?;
        }
        Ok(removed)
    }

    pub async fn get(&self, id: &str) -> Result<Option<RegistryEntry>, GraphError> {
        let mut guard = self.cache.lock().await;
        let map = self.loaded(&mut guard)?;
        Ok(map.get(id).cloned())
    }

    pub async fn list(&self) -> Result<Vec<(String, RegistryEntry)>, GraphError> {
        let mut guard = self.cache.lock().await;
        let map = self.loaded(&mut guard)?;
        Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    pub async fn stats(&self) -> Result<RegistryStats, GraphError> {
        let mut guard = self.cache.lock().await;
        let map = self.loaded(&mut guard)?;
        let mut stats = RegistryStats {
            total: map.len(),
            ..Default::default()
        };
        for entry in map.values() {
            if entry.is_archived() {
                stats.archived += 1;
            } else {
                stats.node_count += 1;
            }
            *stats
                .by_type
                .entry(entry.node_type.slug().to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }

    /// Run `f` against the cache under the mutex.  Gives multi-step callers
    /// (read-decide-write merge logic) a consistent snapshot without
    /// re-locking per call.
    pub async fn with_entries<R>(
        &self,
        f: impl FnOnce(&BTreeMap<String, RegistryEntry>) -> R,
    ) -> Result<R, GraphError> {
        let mut guard = self.cache.lock().await;
        let map = self.loaded(&mut guard)?;
        Ok(f(map))
    }

    /// Compound mutation: `f` runs with exclusive access to the cache and may
    /// interleave its own file writes (node file first, then its row).  The
    /// document is persisted once, after `f` succeeds; an `Err` from `f`
    /// leaves the file untouched.
    pub async fn locked<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, RegistryEntry>) -> Result<R, GraphError>,
    ) -> Result<R, GraphError> {
        let mut guard = self.cache.lock().await;
        let map = self.loaded(&mut guard)?;
        let result = f(map)?;
        self.persist(map)?;
        Ok(result)
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn loaded<'a>(
        &self,
        guard: &'a mut Option<BTreeMap<String, RegistryEntry>>,
    ) -> Result<&'a mut BTreeMap<String, RegistryEntry>, GraphError> {
        if guard.is_none() {
            *guard = Some(self.load_or_rebuild()?);
        }
        Ok(guard.as_mut().expect("cache populated above"))
    }

    fn load_or_rebuild(&self) -> Result<BTreeMap<String, RegistryEntry>, GraphError> {
        match read_optional(&self.file_path())? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(map) => Ok(map),
                Err(err) => {
                    warn!(error = %err, "registry.json unparseable — rebuilding from disk");
                    self.rebuild_from_disk()
                }
            },
            None => self.rebuild_from_disk(),
        }
    }

    /// Walk the graph tree and reconstruct every entry from frontmatter.
    fn rebuild_from_disk(&self) -> Result<BTreeMap<String, RegistryEntry>, GraphError> {
        let mut map = BTreeMap::new();

        for sub in ["nodes", "mocs", "reflections"] {
            let dir = self.root.join(sub);
            if !dir.is_dir() {
                continue;
            }
            for file in WalkDir::new(&dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "md"))
            {
                self.rebuild_one(&mut map, file.path());
            }
        }
        for singleton in ["now.md", "index.md"] {
            let path = self.root.join(singleton);
            if path.is_file() {
                self.rebuild_one(&mut map, &path);
            }
        }

        info!(entries = map.len(), root = %self.root.display(), "registry rebuilt from disk");
        Ok(map)
    }

    fn rebuild_one(&self, map: &mut BTreeMap<String, RegistryEntry>, path: &Path) {
        let Ok(Some(text)) = read_optional(path) else {
            return;
        };
        let Some((header, body)) = parse_node_text(&text) else {
            warn!(path = %path.display(), "skipping file with unparseable header during rebuild");
            return;
        };
        let rel = path
            .strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let kind = kind_for_rel_path(&rel);
        let node = Node {
            header,
            body,
            path: path.to_path_buf(),
        };
        map.insert(
            node.header.id.clone(),
            RegistryEntry::from_node(&node, kind, &rel),
        );
    }

    fn persist(&self, map: &BTreeMap<String, RegistryEntry>) -> Result<(), GraphError> {
        let rendered = serde_json::to_string_pretty(map)?;
        atomic_write_creating(&self.file_path(), &rendered)
    }
}

/// Derive the file category from its location under the graph root.
pub fn kind_for_rel_path(rel: &str) -> &'static str {
    if rel.starts_with("mocs/") {
        "moc"
    } else if rel.starts_with("reflections/") {
        "reflection"
    } else if rel == "now.md" {
        "now"
    } else if rel == "index.md" {
        "index"
    } else {
        "node"
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
