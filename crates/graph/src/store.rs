//! Node store: every read and write path that touches node files.
//!
//! Write discipline, in order: the node file lands on disk first (atomic
//! temp + rename), then its registry row is updated under the registry
//! mutex.  A reader that observes a registry row is therefore guaranteed to
//! find the file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::GraphError;
use crate::frontmatter::{parse_node_text, serialize_node};
use crate::fsio::{atomic_write_creating, read_optional};
use crate::ids::{key_slug, node_id, node_rel_path, slugify, uid};
use crate::node::{Node, NodeHeader, NodeType, Priority, SourceRef};
use crate::registry::{Registry, RegistryEntry, RegistryPatch};

/// Ambient facts every write needs: who is writing, from which session,
/// at what time.  Time is injected so tests are deterministic.
#[derive(Debug, Clone)]
pub struct WriteContext {
    /// Scope for uid hashing — stable per workspace.
    pub scope: String,
    pub session_key: String,
    /// Provenance kind recorded in `sources` (`chat`, `bootstrap`, …).
    pub source_kind: String,
    pub now: DateTime<Utc>,
}

impl WriteContext {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            session_key: self.session_key.clone(),
            kind: self.source_kind.clone(),
            timestamp: self.now.timestamp_millis(),
        }
    }
}

/// Everything the caller knows about a node it wants written.
#[derive(Debug, Clone)]
pub struct NodeDraft {
    pub node_type: NodeType,
    pub canonical_key: String,
    pub description: String,
    pub priority: Priority,
    pub body: String,
    pub links: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub supersedes: Option<Vec<String>>,
    pub applies_to: Option<String>,
}

/// Inputs for a clustered reflection write.
#[derive(Debug, Clone)]
pub struct ClusteredReflection {
    pub domain: String,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub description: String,
    pub body: String,
    pub sources: Vec<String>,
    pub tags: Vec<String>,
    pub compression_level: crate::node::CompressionLevel,
}

pub struct GraphStore {
    root: PathBuf,
    registry: Arc<Registry>,
}

impl GraphStore {
    pub fn new(root: impl Into<PathBuf>, registry: Arc<Registry>) -> Self {
        Self {
            root: root.into(),
            registry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    /// Read one node file.  `Ok(None)` on a missing file or an unparseable
    /// header (warned); other IO errors propagate.
    pub fn read_node(&self, path: &Path) -> Result<Option<Node>, GraphError> {
        let Some(text) = read_optional(path)? else {
            return Ok(None);
        };
        match parse_node_text(&text) {
            Some((header, body)) => Ok(Some(Node {
                header,
                body,
                path: path.to_path_buf(),
            })),
            None => {
                warn!(path = %path.display(), "node header unparseable — skipping file");
                Ok(None)
            }
        }
    }

    /// Read a node by id through its registry row.
    pub async fn read_by_id(&self, id: &str) -> Result<Option<Node>, GraphError> {
        let Some(entry) = self.registry.get(id).await? else {
            return Ok(None);
        };
        self.read_node(&self.root.join(&entry.file_path))
    }

    /// All nodes of one type, sorted by `updated` descending.
    pub fn list_by_type(&self, node_type: NodeType) -> Result<Vec<Node>, GraphError> {
        let dir = self.root.join("nodes").join(node_type.slug());
        let mut nodes = self.collect_nodes(&dir)?;
        nodes.sort_by(|a, b| b.header.updated.cmp(&a.header.updated));
        Ok(nodes)
    }

    /// Every node under the graph root, sorted by `updated` descending.
    pub fn list_all(&self) -> Result<Vec<Node>, GraphError> {
        let mut nodes = Vec::new();
        for sub in ["nodes", "mocs", "reflections"] {
            nodes.extend(self.collect_nodes(&self.root.join(sub))?);
        }
        for singleton in ["now.md", "index.md"] {
            if let Some(node) = self.read_node(&self.root.join(singleton))? {
                nodes.push(node);
            }
        }
        nodes.sort_by(|a, b| b.header.updated.cmp(&a.header.updated));
        Ok(nodes)
    }

    fn collect_nodes(&self, dir: &Path) -> Result<Vec<Node>, GraphError> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut nodes = Vec::new();
        for file in WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "md"))
        {
            if let Some(node) = self.read_node(file.path())? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    // ── Observation writes ────────────────────────────────────────────────

    /// Content-addressed upsert: the deterministic path for
    /// `(type, canonicalKey)`.  An existing file keeps its `created`
    /// timestamp and accumulated aliases/sources.
    pub async fn write_observation_upsert(
        &self,
        draft: &NodeDraft,
        ctx: &WriteContext,
    ) -> Result<Node, GraphError> {
        let rel = node_rel_path(draft.node_type, &draft.canonical_key)?;
        let path = self.root.join(&rel);
        let id = node_id(draft.node_type, &draft.canonical_key)?;
        let existing = self.read_node(&path)?;

        let mut header = NodeHeader::new(
            &id,
            &draft.description,
            draft.node_type,
            draft.priority,
            ctx.now,
        );
        header.canonical_key = Some(draft.canonical_key.clone());
        header.uid = Some(uid(&ctx.scope, draft.node_type, &draft.canonical_key));
        header.links = draft.links.clone();
        header.tags = draft.tags.clone();
        header.supersedes = draft.supersedes.clone();
        header.applies_to = draft.applies_to.clone();

        let mut sources = Vec::new();
        if let Some(prev) = &existing {
            header.created = prev.header.created;
            if let Some(prev_aliases) = &prev.header.aliases {
                header.aliases = Some(prev_aliases.clone());
            }
            if let Some(prev_sources) = &prev.header.sources {
                sources.extend(prev_sources.clone());
            }
        }
        sources.push(ctx.source_ref());
        header.sources = Some(sources);

        self.write_and_register(header, &draft.body, &path, &rel, "node")
            .await
    }

    /// Legacy date-based write: `<type>-<slug>-YYYY-MM-DD[-N].md` with the
    /// collision suffix N in 2..=99.
    pub async fn write_legacy(
        &self,
        draft: &NodeDraft,
        ctx: &WriteContext,
    ) -> Result<Node, GraphError> {
        let slug = key_slug(draft.node_type, &draft.canonical_key)?;
        let date = ctx.now.format("%Y-%m-%d");
        let dir = self.root.join("nodes").join(draft.node_type.slug());
        let base = format!("{}-{slug}-{date}", draft.node_type.slug());

        let stem = self.free_stem(&dir, &base)?;
        let rel = format!("nodes/{}/{stem}.md", draft.node_type.slug());
        let path = self.root.join(&rel);
        let id = format!("omg/{}/{stem}", draft.node_type.slug());

        let mut header =
            NodeHeader::new(&id, &draft.description, draft.node_type, draft.priority, ctx.now);
        header.canonical_key = Some(draft.canonical_key.clone());
        header.uid = Some(uid(&ctx.scope, draft.node_type, &draft.canonical_key));
        header.links = draft.links.clone();
        header.tags = draft.tags.clone();
        header.supersedes = draft.supersedes.clone();
        header.applies_to = draft.applies_to.clone();
        header.sources = Some(vec![ctx.source_ref()]);

        self.write_and_register(header, &draft.body, &path, &rel, "node")
            .await
    }

    /// First unused `<base>[-N].md` stem in `dir`; N runs 2..=99.
    fn free_stem(&self, dir: &Path, base: &str) -> Result<String, GraphError> {
        if !dir.join(format!("{base}.md")).exists() {
            return Ok(base.to_string());
        }
        for n in 2..=99u32 {
            let candidate = format!("{base}-{n}");
            if !dir.join(format!("{candidate}.md")).exists() {
                return Ok(candidate);
            }
        }
        Err(GraphError::CollisionSuffixExhausted {
            path: dir.join(format!("{base}.md")),
        })
    }

    // ── Reflection writes ─────────────────────────────────────────────────

    /// Free-standing reflection node at a date-suffixed path.
    pub async fn write_reflection(
        &self,
        title: &str,
        description: &str,
        body: &str,
        ctx: &WriteContext,
    ) -> Result<Node, GraphError> {
        let slug = slugify(title)?;
        let date = ctx.now.format("%Y-%m-%d");
        let dir = self.root.join("reflections");
        let stem = self.free_stem(&dir, &format!("{slug}-{date}"))?;
        let rel = format!("reflections/{stem}.md");
        let path = self.root.join(&rel);

        let header = NodeHeader::new(
            format!("omg/reflection/{stem}"),
            description,
            NodeType::Reflection,
            Priority::Medium,
            ctx.now,
        );
        self.write_and_register(header, body, &path, &rel, "reflection")
            .await
    }

    /// Deterministic clustered-reflection path
    /// `reflections/<domain>/<start>__<end>.md`; re-running the same cluster
    /// overwrites in place.
    pub async fn write_clustered_reflection(
        &self,
        reflection: &ClusteredReflection,
        ctx: &WriteContext,
    ) -> Result<Node, GraphError> {
        let domain_slug = slugify(&reflection.domain)?;
        let start = reflection.range_start.format("%Y-%m-%d");
        let end = reflection.range_end.format("%Y-%m-%d");
        let stem = format!("{start}__{end}");
        let rel = format!("reflections/{domain_slug}/{stem}.md");
        let path = self.root.join(&rel);
        let existing = self.read_node(&path)?;

        let mut header = NodeHeader::new(
            format!("omg/reflection/{domain_slug}-{stem}"),
            &reflection.description,
            NodeType::Reflection,
            Priority::Medium,
            ctx.now,
        );
        if let Some(prev) = &existing {
            header.created = prev.header.created;
        }
        header.compression_level = Some(reflection.compression_level);
        if !reflection.sources.is_empty() {
            header.links = Some(reflection.sources.clone());
        }
        if !reflection.tags.is_empty() {
            header.tags = Some(reflection.tags.clone());
        }

        self.write_and_register(header, &reflection.body, &path, &rel, "reflection")
            .await
    }

    // ── Singletons ────────────────────────────────────────────────────────

    /// Overwrite the `now.md` snapshot.  `created` survives overwrites;
    /// `links` is set only when this turn touched nodes.
    pub async fn write_now(
        &self,
        body: &str,
        recent_ids: &[String],
        ctx: &WriteContext,
    ) -> Result<Node, GraphError> {
        let rel = "now.md";
        let path = self.root.join(rel);
        let existing = self.read_node(&path)?;

        let mut header = NodeHeader::new(
            "omg/now",
            "Current state snapshot",
            NodeType::Now,
            Priority::High,
            ctx.now,
        );
        if let Some(prev) = &existing {
            header.created = prev.header.created;
        }
        if !recent_ids.is_empty() {
            header.links = Some(recent_ids.to_vec());
        }

        self.write_and_register(header, body, &path, rel, "now").await
    }

    /// Regenerate `index.md`: one wikilink per MOC plus the node count.
    pub async fn write_index(
        &self,
        moc_ids: &[String],
        node_count: usize,
        ctx: &WriteContext,
    ) -> Result<Node, GraphError> {
        let rel = "index.md";
        let path = self.root.join(rel);
        let existing = self.read_node(&path)?;

        let mut header = NodeHeader::new(
            "omg/index",
            "Graph index",
            NodeType::Index,
            Priority::Medium,
            ctx.now,
        );
        if let Some(prev) = &existing {
            header.created = prev.header.created;
        }

        let mut body = String::from("# Index\n\n## Maps of Content\n");
        if moc_ids.is_empty() {
            body.push_str("\n(no MOCs yet)\n");
        } else {
            body.push('\n');
            for id in moc_ids {
                body.push_str(&format!("- [[{id}]]\n"));
            }
        }
        body.push_str(&format!("\nNodes: {node_count}\n"));

        self.write_and_register(header, &body, &path, rel, "index")
            .await
    }

    // ── Mutators ──────────────────────────────────────────────────────────

    /// Append `body_append` to an existing node's body, separated by a blank
    /// line.  Runs entirely under the registry mutex.
    pub async fn append_to_existing(
        &self,
        id: &str,
        body_append: &str,
        ctx: &WriteContext,
    ) -> Result<Node, GraphError> {
        let id = id.to_string();
        let append = body_append.trim().to_string();
        let root = self.root.clone();
        let now = ctx.now;

        self.registry
            .locked(move |entries| {
                let entry = entries
                    .get_mut(&id)
                    .ok_or(GraphError::NodeNotFound { id: id.clone() })?;
                let path = root.join(&entry.file_path);
                let text = read_optional(&path)?
                    .ok_or(GraphError::NodeNotFound { id: id.clone() })?;
                let (mut header, body) = parse_node_text(&text)
                    .ok_or(GraphError::NodeNotFound { id: id.clone() })?;

                let body = if body.trim().is_empty() {
                    append.clone()
                } else {
                    format!("{}\n\n{append}", body.trim_end())
                };
                header.updated = now;
                let rendered = serialize_node(&header, &body)
                    .map_err(|e| yaml_io_error(&path, e))?;
                atomic_write_creating(&path, &rendered)?;

                entry.updated = now;
                debug!(id = %id, "appended to node body");
                Ok(Node {
                    header,
                    body,
                    path,
                })
            })
            .await
    }

    /// Merge `alias_key` into a node's alias set.
    pub async fn add_alias(
        &self,
        id: &str,
        alias_key: &str,
        ctx: &WriteContext,
    ) -> Result<Node, GraphError> {
        let id = id.to_string();
        let alias = alias_key.to_string();
        let root = self.root.clone();
        let now = ctx.now;

        self.registry
            .locked(move |entries| {
                let entry = entries
                    .get_mut(&id)
                    .ok_or(GraphError::NodeNotFound { id: id.clone() })?;
                let path = root.join(&entry.file_path);
                let text = read_optional(&path)?
                    .ok_or(GraphError::NodeNotFound { id: id.clone() })?;
                let (mut header, body) = parse_node_text(&text)
                    .ok_or(GraphError::NodeNotFound { id: id.clone() })?;

                if header.add_alias(&alias) {
                    header.updated = now;
                    let rendered = serialize_node(&header, &body)
                        .map_err(|e| yaml_io_error(&path, e))?;
                    atomic_write_creating(&path, &rendered)?;
                    entry.aliases = header.aliases.clone();
                    entry.updated = now;
                    debug!(id = %id, alias = %alias, "alias recorded");
                }
                Ok(Node {
                    header,
                    body,
                    path,
                })
            })
            .await
    }

    /// Soft-delete: flag the file and row as archived, optionally recording
    /// the surviving node it merged into.
    pub async fn archive_node(
        &self,
        id: &str,
        merged_into: Option<&str>,
        ctx: &WriteContext,
    ) -> Result<bool, GraphError> {
        let Some(entry) = self.registry.get(id).await? else {
            return Ok(false);
        };
        let path = self.root.join(&entry.file_path);
        let Some(text) = read_optional(&path)? else {
            warn!(id, "archive target file missing — dropping registry row");
            self.registry.remove(id).await?;
            return Ok(false);
        };
        let Some((mut header, body)) = parse_node_text(&text) else {
            warn!(id, "archive target header unparseable — skipped");
            return Ok(false);
        };

        header.archived = Some(true);
        header.merged_into = merged_into.map(str::to_string);
        header.updated = ctx.now;
        let rendered = serialize_node(&header, &body).map_err(|e| yaml_io_error(&path, e))?;
        atomic_write_creating(&path, &rendered)?;

        self.registry
            .update(
                id,
                RegistryPatch {
                    archived: Some(true),
                    merged_into: merged_into.map(str::to_string),
                    updated: Some(ctx.now),
                    ..Default::default()
                },
            )
            .await?;
        Ok(true)
    }

    /// Rewrite a node file from an already-mutated header/body pair and
    /// mirror the change into the registry.
    pub async fn rewrite_node(&self, node: &Node) -> Result<(), GraphError> {
        let rendered =
            serialize_node(&node.header, &node.body).map_err(|e| yaml_io_error(&node.path, e))?;
        atomic_write_creating(&node.path, &rendered)?;

        let rel = node
            .path
            .strip_prefix(&self.root)
            .unwrap_or(&node.path)
            .to_string_lossy()
            .replace('\\', "/");
        let kind = crate::registry::kind_for_rel_path(&rel);
        self.registry
            .register(&node.header.id, RegistryEntry::from_node(node, kind, &rel))
            .await
    }

    // ── Internals ─────────────────────────────────────────────────────────

    async fn write_and_register(
        &self,
        header: NodeHeader,
        body: &str,
        path: &Path,
        rel: &str,
        kind: &str,
    ) -> Result<Node, GraphError> {
        let rendered = serialize_node(&header, body).map_err(|e| yaml_io_error(path, e))?;
        atomic_write_creating(path, &rendered)?;

        let node = Node {
            header,
            body: body.to_string(),
            path: path.to_path_buf(),
        };
        self.registry
            .register(&node.header.id, RegistryEntry::from_node(&node, kind, rel))
            .await?;
        debug!(id = %node.header.id, path = rel, "node written");
        Ok(node)
    }
}

fn yaml_io_error(path: &Path, err: serde_yaml::Error) -> GraphError {
    GraphError::io(
        path,
        std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()),
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
