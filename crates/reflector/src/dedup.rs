//! Semantic dedup: a standalone maintenance job that folds near-duplicate
//! nodes into a single survivor.
//!
//! Cheap lexical blocking first, one model verdict per block after — the
//! model is only consulted for pairs the heuristics already consider close.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use omg_config::SemanticDedupConfig;
use omg_graph::{GraphStore, MetricEvent, MetricsSink, RegistryEntry, WriteContext};
use omg_llm::TextModel;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::ReflectorError;

static VERDICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}").expect("verdict regex compiles"));

#[derive(Debug, Clone, Default)]
pub struct DedupReport {
    pub blocks_processed: usize,
    pub merges_executed: usize,
    pub nodes_archived: usize,
    pub tokens_used: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
struct DedupNode {
    id: String,
    entry: RegistryEntry,
    body_sample: String,
}

/// Run one dedup sweep over the graph.
pub async fn run_semantic_dedup(
    config: &SemanticDedupConfig,
    model: &dyn TextModel,
    store: &GraphStore,
    scope: &str,
    now: DateTime<Utc>,
    metrics: &dyn MetricsSink,
) -> Result<DedupReport, ReflectorError> {
    let mut report = DedupReport::default();
    if !config.enabled {
        return Ok(report);
    }

    // 1. Candidate pool: live content nodes with their body samples.
    let entries = store.registry().list().await?;
    let mut pool: Vec<DedupNode> = Vec::new();
    for (id, entry) in entries {
        if entry.is_archived() || !entry.node_type.is_content() {
            continue;
        }
        let body_sample = match store.read_by_id(&id).await? {
            Some(node) => truncate_chars(&node.body, config.max_body_chars_per_node),
            None => String::new(),
        };
        pool.push(DedupNode {
            id,
            entry,
            body_sample,
        });
    }

    // 2. Blocking: (type, key-prefix) groups → time windows → similarity
    // blocks.
    let blocks = build_blocks(pool, config);
    let capped: Vec<_> = blocks.into_iter().take(config.max_blocks_per_run).collect();

    // 3. One verdict per block.
    let ctx = WriteContext {
        scope: scope.to_string(),
        session_key: "dedup".to_string(),
        source_kind: "dedup".to_string(),
        now,
    };
    for block in capped {
        report.blocks_processed += 1;
        let (system, user) = verdict_prompt(&block);
        let verdict = match model.complete(&system, &user, 256).await {
            Ok(response) => {
                report.tokens_used += response.usage.total();
                parse_verdict(&response.content)
            }
            Err(err) => {
                warn!(error = %err, "dedup verdict call failed — block skipped");
                report.errors.push(format!("block verdict: {err}"));
                continue;
            }
        };

        let Some(verdict) = verdict else {
            report
                .errors
                .push("block verdict: unparseable response".to_string());
            continue;
        };
        if verdict < config.semantic_merge_threshold {
            debug!(verdict, "block below merge threshold — kept apart");
            continue;
        }

        // 4. Merge: survivor keeps the graph position, losers archive into it.
        let survivor = choose_survivor(&block);
        let mut merged_any = false;
        for node in &block {
            if node.id == survivor.id {
                continue;
            }
            match store.archive_node(&node.id, Some(&survivor.id), &ctx).await {
                Ok(true) => {
                    report.nodes_archived += 1;
                    merged_any = true;
                    if let Some(key) = &node.entry.canonical_key {
                        if let Err(err) = store.add_alias(&survivor.id, key, &ctx).await {
                            report
                                .errors
                                .push(format!("alias {key} onto {}: {err}", survivor.id));
                        }
                    }
                }
                Ok(false) => warn!(id = %node.id, "merge loser missing — skipped"),
                Err(err) => report.errors.push(format!("archive {}: {err}", node.id)),
            }
        }
        if merged_any {
            report.merges_executed += 1;
        }
    }

    metrics.emit(MetricEvent::new(
        "dedup.complete",
        json!({
            "blocks": report.blocks_processed,
            "merges": report.merges_executed,
            "archived": report.nodes_archived,
            "tokens": report.tokens_used,
        }),
    ));
    info!(
        blocks = report.blocks_processed,
        merges = report.merges_executed,
        archived = report.nodes_archived,
        "semantic dedup complete"
    );
    Ok(report)
}

// ── Blocking ──────────────────────────────────────────────────────────────────

fn build_blocks(pool: Vec<DedupNode>, config: &SemanticDedupConfig) -> Vec<Vec<DedupNode>> {
    // Group by (type, first key segment).
    let mut groups: BTreeMap<(String, String), Vec<DedupNode>> = BTreeMap::new();
    for node in pool {
        let prefix = node
            .entry
            .canonical_key
            .as_deref()
            .and_then(|k| k.split('.').next())
            .unwrap_or(node.entry.node_type.slug())
            .to_string();
        groups
            .entry((node.entry.node_type.slug().to_string(), prefix))
            .or_default()
            .push(node);
    }

    let window = Duration::days(i64::from(config.time_window_days));
    let mut blocks = Vec::new();

    for (_, mut group) in groups {
        group.sort_by(|a, b| a.entry.updated.cmp(&b.entry.updated));

        // Time buckets inside the group.
        let mut buckets: Vec<Vec<DedupNode>> = Vec::new();
        for node in group {
            let fits = buckets
                .last()
                .and_then(|bucket| bucket.first())
                .is_some_and(|start| node.entry.updated - start.entry.updated <= window);
            if fits {
                buckets.last_mut().expect("fits implies a bucket").push(node);
            } else {
                buckets.push(vec![node]);
            }
        }

        // Similarity blocks inside each bucket.
        for bucket in buckets {
            let mut bucket_blocks: Vec<Vec<DedupNode>> = Vec::new();
            for node in bucket {
                let home = bucket_blocks.iter().position(|block| {
                    block.len() < config.max_block_size
                        && block.iter().any(|member| {
                            heuristic_similarity(member, &node)
                                >= config.heuristic_prefilter_threshold
                        })
                });
                match home {
                    Some(index) => bucket_blocks[index].push(node),
                    None => bucket_blocks.push(vec![node]),
                }
            }
            blocks.extend(bucket_blocks.into_iter().filter(|b| b.len() >= 2));
        }
    }
    blocks
}

/// Best of three lexical signals.
fn heuristic_similarity(a: &DedupNode, b: &DedupNode) -> f64 {
    let desc = token_jaccard(&a.entry.description, &b.entry.description);
    let key = key_segment_jaccard(
        a.entry.canonical_key.as_deref().unwrap_or(""),
        b.entry.canonical_key.as_deref().unwrap_or(""),
    );
    let body = token_jaccard(&a.body_sample, &b.body_sample);
    desc.max(key).max(body)
}

fn key_segment_jaccard(a: &str, b: &str) -> f64 {
    let sa: BTreeSet<&str> = a.split('.').filter(|s| !s.is_empty()).collect();
    let sb: BTreeSet<&str> = b.split('.').filter(|s| !s.is_empty()).collect();
    if sa.is_empty() && sb.is_empty() {
        return 0.0;
    }
    sa.intersection(&sb).count() as f64 / sa.union(&sb).count() as f64
}

fn token_jaccard(a: &str, b: &str) -> f64 {
    let set = |text: &str| -> BTreeSet<String> {
        text.to_lowercase()
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    };
    let sa = set(a);
    let sb = set(b);
    if sa.is_empty() && sb.is_empty() {
        return 0.0;
    }
    sa.intersection(&sb).count() as f64 / sa.union(&sb).count() as f64
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

// ── Verdict ───────────────────────────────────────────────────────────────────

fn verdict_prompt(block: &[DedupNode]) -> (String, String) {
    let mut user = String::from(
        "Do these nodes describe the same underlying knowledge? \
Reply with a single merge confidence 0-100.\n\n",
    );
    for node in block {
        user.push_str(&format!(
            "## {}\nkey: {}\ndescription: {}\nbody: {}\n\n",
            node.id,
            node.entry.canonical_key.as_deref().unwrap_or("-"),
            node.entry.description,
            node.body_sample,
        ));
    }
    (
        "You judge whether knowledge nodes are duplicates.".to_string(),
        user,
    )
}

/// First integer in the response, clamped to 0..=100.
fn parse_verdict(response: &str) -> Option<u8> {
    let m = VERDICT_RE.find(response)?;
    let value: u32 = m.as_str().parse().ok()?;
    Some(value.min(100) as u8)
}

fn choose_survivor<'a>(block: &'a [DedupNode]) -> &'a DedupNode {
    block
        .iter()
        .max_by(|a, b| {
            a.entry
                .priority
                .cmp(&b.entry.priority)
                .then(a.entry.updated.cmp(&b.entry.updated))
        })
        .expect("blocks have at least two members")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
