//! The reflection apply phase.
//!
//! Settled semantics throughout: every edit is attempted, failures are
//! collected per item, and no single bad edit cancels its siblings.

use omg_graph::{
    ClusteredReflection, GraphStore, Node, Priority, WriteContext,
};
use tracing::warn;

use crate::cluster::Cluster;
use crate::parser::{NodeFieldUpdate, ReflectionOutput, UpdateAction, UpdateField};

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub nodes_written: Vec<String>,
    pub archived: usize,
    pub moc_applied: usize,
    pub updates_applied: usize,
    pub errors: Vec<String>,
}

/// Apply one cluster's parsed reflection output to the graph.
pub async fn apply_reflection(
    output: &ReflectionOutput,
    cluster: &Cluster,
    store: &GraphStore,
    ctx: &WriteContext,
) -> ApplyReport {
    let mut report = ApplyReport::default();

    // 1. Reflection nodes.  The first node takes the cluster's deterministic
    // path (idempotent re-runs overwrite it); extra nodes, when a model
    // returns several, land at date-suffixed paths.
    for (index, node_out) in output.nodes.iter().enumerate() {
        let result = if index == 0 {
            store
                .write_clustered_reflection(
                    &ClusteredReflection {
                        domain: cluster.domain.clone(),
                        range_start: cluster.range_start,
                        range_end: cluster.range_end,
                        description: node_out.description.clone(),
                        body: node_out.body.clone(),
                        sources: node_out.sources.clone(),
                        tags: node_out.tags.clone(),
                        compression_level: node_out.compression_level,
                    },
                    ctx,
                )
                .await
        } else {
            let title = node_out
                .id
                .rsplit('/')
                .next()
                .unwrap_or(&node_out.id)
                .to_string();
            store
                .write_reflection(&title, &node_out.description, &node_out.body, ctx)
                .await
        };
        match result {
            Ok(node) => report.nodes_written.push(node.header.id),
            Err(err) => report
                .errors
                .push(format!("write {}: {err}", node_out.id)),
        }
    }

    // 2. Archives.
    for id in &output.archives {
        match store.archive_node(id, None, ctx).await {
            Ok(true) => report.archived += 1,
            Ok(false) => warn!(id = %id, "archive target absent or unreadable — skipped"),
            Err(err) => report.errors.push(format!("archive {id}: {err}")),
        }
    }

    // 3. MOC updates.
    for update in &output.moc_updates {
        match store.apply_moc_update(update, ctx).await {
            Ok(_) => report.moc_applied += 1,
            Err(err) => report
                .errors
                .push(format!("moc {}: {err}", update.domain)),
        }
    }

    // 4. Field updates.
    for update in &output.node_updates {
        match apply_field_update(update, store, ctx).await {
            Ok(true) => report.updates_applied += 1,
            Ok(false) => warn!(target = %update.target_id, "update target missing — skipped"),
            Err(err) => report
                .errors
                .push(format!("update {}: {err}", update.target_id)),
        }
    }

    report
}

async fn apply_field_update(
    update: &NodeFieldUpdate,
    store: &GraphStore,
    ctx: &WriteContext,
) -> Result<bool, omg_graph::GraphError> {
    let Some(mut node) = store.read_by_id(&update.target_id).await? else {
        return Ok(false);
    };

    apply_to_node(&mut node, update);
    node.header.updated = ctx.now;
    store.rewrite_node(&node).await?;
    Ok(true)
}

fn apply_to_node(node: &mut Node, update: &NodeFieldUpdate) {
    match update.field {
        UpdateField::Description => {
            node.header.description = update.value.clone();
        }
        UpdateField::Priority => {
            if let Some(priority) = Priority::parse_lenient(&update.value) {
                node.header.priority = priority;
            } else {
                warn!(value = %update.value, "unparseable priority value — ignored");
            }
        }
        UpdateField::Body => match update.action {
            UpdateAction::Set => node.body = update.value.clone(),
            UpdateAction::Add => {
                if node.body.trim().is_empty() {
                    node.body = update.value.clone();
                } else {
                    node.body = format!("{}\n\n{}", node.body.trim_end(), update.value);
                }
            }
            UpdateAction::Remove => {
                node.body = node.body.replace(&update.value, "");
            }
        },
        UpdateField::Tags => {
            let current = node.header.tags.take().unwrap_or_default();
            node.header.tags = apply_set_edit(current, update);
        }
        UpdateField::Links => {
            let current = node.header.links.take().unwrap_or_default();
            node.header.links = apply_set_edit(current, update);
        }
    }
}

/// Set-semantics edit over an ordered list: `set` replaces with the
/// comma-split value, `add` inserts missing items, `remove` deletes them.
fn apply_set_edit(current: Vec<String>, update: &NodeFieldUpdate) -> Option<Vec<String>> {
    let values: Vec<String> = update
        .value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();

    let next = match update.action {
        UpdateAction::Set => {
            let mut out = Vec::new();
            for value in values {
                if !out.contains(&value) {
                    out.push(value);
                }
            }
            out
        }
        UpdateAction::Add => {
            let mut out = current;
            for value in values {
                if !out.contains(&value) {
                    out.push(value);
                }
            }
            out
        }
        UpdateAction::Remove => current
            .into_iter()
            .filter(|item| !values.contains(item))
            .collect(),
    };

    if next.is_empty() { None } else { Some(next) }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
