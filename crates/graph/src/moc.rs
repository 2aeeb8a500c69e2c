//! Map-of-Content maintenance.
//!
//! One MOC per domain at `mocs/moc-<domain>.md`; its body is an ordered
//! bullet list of `[[<id>]]` wikilinks.  Insertion order is preserved,
//! removals are stable, duplicates collapse.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GraphError;
use crate::ids::slugify;
use crate::node::{NodeHeader, NodeType, Priority};
use crate::store::{GraphStore, WriteContext};

static WIKILINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\[\]]+)\]\]").expect("wikilink regex compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MocAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MocUpdate {
    pub domain: String,
    pub node_id: String,
    pub action: MocAction,
}

/// `omg/moc-<domain>` — the single-slash singleton id form.
pub fn moc_id(domain: &str) -> Result<String, GraphError> {
    Ok(format!("omg/moc-{}", slugify(domain)?))
}

/// `mocs/moc-<domain>.md`, relative to the graph root.
pub fn moc_rel_path(domain: &str) -> Result<String, GraphError> {
    Ok(format!("mocs/moc-{}.md", slugify(domain)?))
}

/// Extract the wikilinked member ids from a MOC body, in order, first
/// occurrence wins.
pub fn parse_moc_members(body: &str) -> Vec<String> {
    let mut members = Vec::new();
    for capture in WIKILINK_RE.captures_iter(body) {
        let id = capture[1].trim().to_string();
        if !id.is_empty() && !members.contains(&id) {
            members.push(id);
        }
    }
    members
}

fn render_moc_body(domain: &str, members: &[String]) -> String {
    let mut body = format!("# MOC: {domain}\n\n");
    if members.is_empty() {
        body.push_str("(no members yet)\n");
    } else {
        for id in members {
            body.push_str(&format!("- [[{id}]]\n"));
        }
    }
    body
}

impl GraphStore {
    /// Apply one add/remove to a domain MOC, creating the file on first add.
    /// Returns the member list after the change.
    pub async fn apply_moc_update(
        &self,
        update: &MocUpdate,
        ctx: &WriteContext,
    ) -> Result<Vec<String>, GraphError> {
        let rel = moc_rel_path(&update.domain)?;
        let path = self.root().join(&rel);
        let existing = self.read_node(&path)?;

        let mut members = existing
            .as_ref()
            .map(|n| parse_moc_members(&n.body))
            .unwrap_or_default();

        let changed = match update.action {
            MocAction::Add => {
                if members.contains(&update.node_id) {
                    false
                } else {
                    members.push(update.node_id.clone());
                    true
                }
            }
            MocAction::Remove => {
                let before = members.len();
                members.retain(|m| m != &update.node_id);
                members.len() != before
            }
        };

        // Removing from a MOC that was never created stays a no-op.
        if !changed && existing.is_none() && update.action == MocAction::Remove {
            return Ok(members);
        }
        if !changed && existing.is_some() {
            return Ok(members);
        }

        self.write_moc(&update.domain, &members, existing.map(|n| n.header.created), ctx)
            .await?;
        debug!(domain = %update.domain, node = %update.node_id, action = ?update.action, "moc updated");
        Ok(members)
    }

    /// Full rewrite of a domain MOC with an explicit member list.
    pub async fn regenerate_moc(
        &self,
        domain: &str,
        ids: &[String],
        ctx: &WriteContext,
    ) -> Result<(), GraphError> {
        let rel = moc_rel_path(domain)?;
        let existing = self.read_node(&self.root().join(&rel))?;
        let mut members = Vec::new();
        for id in ids {
            if !members.contains(id) {
                members.push(id.clone());
            }
        }
        self.write_moc(domain, &members, existing.map(|n| n.header.created), ctx)
            .await
    }

    /// Ids of every MOC currently on disk, sorted by file name.
    pub fn list_moc_ids(&self) -> Result<Vec<String>, GraphError> {
        let dir = self.root().join("mocs");
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(&dir)
            .map_err(|e| GraphError::io(&dir, e))?
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            if let Some(node) = self.read_node(&entry.path())? {
                if node.header.node_type == NodeType::Moc {
                    ids.push(node.header.id);
                }
            }
        }
        Ok(ids)
    }

    async fn write_moc(
        &self,
        domain: &str,
        members: &[String],
        created: Option<chrono::DateTime<chrono::Utc>>,
        ctx: &WriteContext,
    ) -> Result<(), GraphError> {
        let rel = moc_rel_path(domain)?;
        let path = self.root().join(&rel);

        let mut header = NodeHeader::new(
            moc_id(domain)?,
            format!("Map of content: {domain}"),
            NodeType::Moc,
            Priority::Medium,
            ctx.now,
        );
        if let Some(created) = created {
            header.created = created;
        }

        let body = render_moc_body(domain, members);
        let rendered = crate::frontmatter::serialize_node(&header, &body).map_err(|e| {
            GraphError::io(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
            )
        })?;
        crate::fsio::atomic_write_creating(&path, &rendered)?;

        let node = crate::node::Node {
            header,
            body,
            path,
        };
        self.registry()
            .register(
                &node.header.id,
                crate::registry::RegistryEntry::from_node(&node, "moc", &rel),
            )
            .await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::registry::Registry;

    fn scratch_store() -> (GraphStore, PathBuf) {
        let root = std::env::temp_dir().join(format!("omg-moc-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        let registry = Arc::new(Registry::new(&root));
        (GraphStore::new(&root, registry), root)
    }

    fn ctx() -> WriteContext {
        WriteContext {
            scope: "test".to_string(),
            session_key: "sess".to_string(),
            source_kind: "chat".to_string(),
            now: Utc::now(),
        }
    }

    fn add(domain: &str, id: &str) -> MocUpdate {
        MocUpdate {
            domain: domain.to_string(),
            node_id: id.to_string(),
            action: MocAction::Add,
        }
    }

    #[tokio::test]
    async fn first_add_creates_the_moc_file() {
        let (store, root) = scratch_store();
        let members = store
            .apply_moc_update(&add("health", "omg/fact/sleep"), &ctx())
            .await
            .unwrap();
        assert_eq!(members, vec!["omg/fact/sleep"]);

        let node = store
            .read_node(&root.join("mocs/moc-health.md"))
            .unwrap()
            .unwrap();
        assert_eq!(node.header.id, "omg/moc-health");
        assert_eq!(node.header.node_type, NodeType::Moc);
        assert_eq!(node.header.priority, Priority::Medium);
        assert!(node.body.contains("[[omg/fact/sleep]]"));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn adds_preserve_insertion_order_and_dedupe() {
        let (store, root) = scratch_store();
        let context = ctx();
        store.apply_moc_update(&add("work", "omg/project/a"), &context).await.unwrap();
        store.apply_moc_update(&add("work", "omg/project/b"), &context).await.unwrap();
        let members = store
            .apply_moc_update(&add("work", "omg/project/a"), &context)
            .await
            .unwrap();
        assert_eq!(members, vec!["omg/project/a", "omg/project/b"]);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn remove_is_stable_for_the_rest() {
        let (store, root) = scratch_store();
        let context = ctx();
        for id in ["omg/fact/a", "omg/fact/b", "omg/fact/c"] {
            store.apply_moc_update(&add("facts", id), &context).await.unwrap();
        }
        let members = store
            .apply_moc_update(
                &MocUpdate {
                    domain: "facts".to_string(),
                    node_id: "omg/fact/b".to_string(),
                    action: MocAction::Remove,
                },
                &context,
            )
            .await
            .unwrap();
        assert_eq!(members, vec!["omg/fact/a", "omg/fact/c"]);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn remove_from_absent_moc_creates_nothing() {
        let (store, root) = scratch_store();
        store
            .apply_moc_update(
                &MocUpdate {
                    domain: "ghost".to_string(),
                    node_id: "omg/fact/a".to_string(),
                    action: MocAction::Remove,
                },
                &ctx(),
            )
            .await
            .unwrap();
        assert!(!root.join("mocs/moc-ghost.md").exists());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn regenerate_replaces_membership_wholesale() {
        let (store, root) = scratch_store();
        let context = ctx();
        store.apply_moc_update(&add("work", "omg/project/old"), &context).await.unwrap();
        store
            .regenerate_moc(
                "work",
                &["omg/project/x".to_string(), "omg/project/y".to_string()],
                &context,
            )
            .await
            .unwrap();

        let node = store.read_node(&root.join("mocs/moc-work.md")).unwrap().unwrap();
        let members = parse_moc_members(&node.body);
        assert_eq!(members, vec!["omg/project/x", "omg/project/y"]);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn member_parsing_ignores_non_link_text() {
        let body = "# MOC: x\n\n- [[omg/fact/a]]\nplain text\n- [[omg/fact/b]] trailing\n- [[omg/fact/a]]\n";
        assert_eq!(parse_moc_members(body), vec!["omg/fact/a", "omg/fact/b"]);
    }
}
