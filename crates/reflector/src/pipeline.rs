//! The reflection pipeline: eligibility → domains → clusters → progressive
//! compression → apply.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use omg_config::OmgConfig;
use omg_graph::{CompressionLevel, GraphStore, MetricEvent, MetricsSink, WriteContext};
use omg_llm::{estimate_tokens, TextModel};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::apply::apply_reflection;
use crate::cluster::{anchor_split, assign_domain, cluster_domain, eligible_entries, Cluster};
use crate::error::ReflectorError;
use crate::packet::{build_packet, render_packets, CompactPacket};
use crate::parser::{parse_reflection_response, validate_reflection, ReflectionOutput};

/// Fixed completion budget for one reflection call.
const REFLECTION_MAX_TOKENS: u32 = 8192;

/// Builds the prompt pair for one cluster at one compression level.
pub trait ReflectionPrompts: Send + Sync {
    fn build(&self, domain: &str, packets_block: &str, level: CompressionLevel)
        -> (String, String);
}

/// Minimal default: names the domain and the retention directive.
pub struct DefaultReflectionPrompts;

impl ReflectionPrompts for DefaultReflectionPrompts {
    fn build(
        &self,
        domain: &str,
        packets_block: &str,
        level: CompressionLevel,
    ) -> (String, String) {
        let system =
            "Synthesise the node packets into a <reflection> XML response.".to_string();
        let user = format!(
            "Domain: {domain}\nCompression level {} (retain ~{}% of body detail{}).\n\n{packets_block}",
            level.as_u8(),
            level.retention_pct(),
            if level == CompressionLevel::Maximum {
                ", bullet points only"
            } else {
                ""
            },
        );
        (system, user)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReflectionReport {
    pub clusters_formed: usize,
    pub clusters_processed: usize,
    pub clusters_abandoned: usize,
    pub nodes_written: Vec<String>,
    pub archived: usize,
    pub updates_applied: usize,
    pub tokens_used: u64,
    pub errors: Vec<String>,
}

/// Run one full reflection pass over the graph.
///
/// Per-cluster failures (model errors, invariant violations) abandon that
/// cluster and leave the rest of the pass running.
pub async fn run_reflection(
    config: &OmgConfig,
    model: &dyn TextModel,
    prompts: &dyn ReflectionPrompts,
    store: &GraphStore,
    scope: &str,
    session_key: &str,
    now: DateTime<Utc>,
    metrics: &dyn MetricsSink,
) -> Result<ReflectionReport, ReflectorError> {
    let mut report = ReflectionReport::default();
    let reflection_config = &config.reflection;

    // 1. Eligibility.
    let entries = store.registry().list().await?;
    let eligible = eligible_entries(&entries, reflection_config.age_cutoff_days, now);
    if eligible.is_empty() {
        debug!("no nodes old enough to reflect on");
        return Ok(report);
    }

    // 2. Compact packets for every eligible node, keyed by id.
    let mut packets: BTreeMap<String, CompactPacket> = BTreeMap::new();
    for (id, _) in &eligible {
        match store.read_by_id(id).await? {
            Some(node) => {
                packets.insert(id.clone(), build_packet(&node));
            }
            None => warn!(id = %id, "eligible entry has no readable file — skipped"),
        }
    }

    // 3. Domain grouping and time clustering.
    let mut domains: BTreeMap<String, Vec<(String, omg_graph::RegistryEntry)>> = BTreeMap::new();
    for (id, entry) in eligible {
        if !packets.contains_key(&id) {
            continue;
        }
        domains.entry(assign_domain(&entry)).or_default().push((id, entry));
    }

    let clustering = &reflection_config.clustering;
    let mut clusters: Vec<Cluster> = Vec::new();
    for (domain, domain_entries) in domains {
        if !clustering.enabled {
            // Clustering off: the whole domain is one unit.
            let mut sorted = domain_entries;
            sorted.sort_by(|a, b| a.1.updated.cmp(&b.1.updated));
            let range_start = sorted.first().map(|(_, e)| e.updated).unwrap_or(now);
            let range_end = sorted.last().map(|(_, e)| e.updated).unwrap_or(now);
            clusters.push(Cluster {
                domain,
                ids: sorted.into_iter().map(|(id, _)| id).collect(),
                range_start,
                range_end,
            });
            continue;
        }
        // With anchor-split enabled, the window and token budget shape the
        // clusters and the node cap is enforced afterwards by splitting
        // around the best-linked anchor.
        let effective = if clustering.enable_anchor_split {
            let mut relaxed = clustering.clone();
            relaxed.max_nodes_per_cluster = usize::MAX;
            relaxed
        } else {
            clustering.clone()
        };
        let domain_clusters = cluster_domain(&domain, domain_entries, &effective, |id| {
            packets.get(id).map(|p| p.estimated_tokens()).unwrap_or(0)
        });
        for cluster in domain_clusters {
            if clustering.enable_anchor_split && cluster.ids.len() > clustering.max_nodes_per_cluster
            {
                let link_counts: BTreeMap<String, usize> = cluster
                    .ids
                    .iter()
                    .map(|id| {
                        let count = packets.get(id).map(|p| p.key_links.len()).unwrap_or(0);
                        (id.clone(), count)
                    })
                    .collect();
                clusters.extend(anchor_split(
                    cluster,
                    |id| link_counts.get(id).copied().unwrap_or(0),
                    clustering.max_nodes_per_cluster,
                ));
            } else {
                clusters.push(cluster);
            }
        }
    }
    report.clusters_formed = clusters.len();

    // 4. Per-cluster progressive compression, then apply.
    let ctx = WriteContext {
        scope: scope.to_string(),
        session_key: session_key.to_string(),
        source_kind: "reflection".to_string(),
        now,
    };
    for cluster in clusters {
        match reflect_cluster(&cluster, &packets, config, model, prompts).await {
            Ok((output, tokens)) => {
                report.tokens_used += tokens;
                let apply = apply_reflection(&output, &cluster, store, &ctx).await;
                report.nodes_written.extend(apply.nodes_written);
                report.archived += apply.archived;
                report.updates_applied += apply.updates_applied;
                report.errors.extend(apply.errors);
                report.clusters_processed += 1;
            }
            Err(err) => {
                warn!(domain = %cluster.domain, error = %err, "cluster abandoned");
                report.clusters_abandoned += 1;
                report.errors.push(format!("{}: {err}", cluster.domain));
            }
        }
    }

    metrics.emit(MetricEvent::new(
        "reflection.complete",
        json!({
            "clusters": report.clusters_processed,
            "abandoned": report.clusters_abandoned,
            "nodes_written": report.nodes_written.len(),
            "archived": report.archived,
            "tokens": report.tokens_used,
        }),
    ));
    info!(
        clusters = report.clusters_processed,
        abandoned = report.clusters_abandoned,
        written = report.nodes_written.len(),
        "reflection pass complete"
    );
    Ok(report)
}

/// Escalate compression until the output fits the injection budget or the
/// maximum level is reached.  Any model error abandons the cluster.
async fn reflect_cluster(
    cluster: &Cluster,
    packets: &BTreeMap<String, CompactPacket>,
    config: &OmgConfig,
    model: &dyn TextModel,
    prompts: &dyn ReflectionPrompts,
) -> Result<(ReflectionOutput, u64), ReflectorError> {
    let cluster_packets: Vec<CompactPacket> = cluster
        .ids
        .iter()
        .filter_map(|id| packets.get(id).cloned())
        .collect();
    let packets_block = render_packets(&cluster_packets);

    let max_level = CompressionLevel::from_u8(config.reflection.max_compression_level)
        .unwrap_or(CompressionLevel::MAX);
    let mut tokens_used = 0u64;
    let mut level = CompressionLevel::None;

    loop {
        let (system, user) = prompts.build(&cluster.domain, &packets_block, level);
        let response = model.complete(&system, &user, REFLECTION_MAX_TOKENS).await?;
        tokens_used += response.usage.total();

        let output = parse_reflection_response(&response.content);
        validate_reflection(&output, tokens_used as i64)?;

        let body_tokens: u64 = output.nodes.iter().map(|n| estimate_tokens(&n.body)).sum();
        if body_tokens <= config.injection.max_context_tokens || level >= max_level {
            debug!(
                domain = %cluster.domain,
                level = level.as_u8(),
                body_tokens,
                "cluster output accepted"
            );
            let output = stamp_level(output, level);
            return Ok((output, tokens_used));
        }

        let Some(next) = level.next() else {
            let output = stamp_level(output, level);
            return Ok((output, tokens_used));
        };
        debug!(
            domain = %cluster.domain,
            from = level.as_u8(),
            to = next.as_u8(),
            body_tokens,
            budget = config.injection.max_context_tokens,
            "output over budget — escalating compression"
        );
        level = next;
    }
}

/// The accepted level is authoritative for every node in the batch, even
/// when the model echoed a different attribute.
fn stamp_level(mut output: ReflectionOutput, level: CompressionLevel) -> ReflectionOutput {
    for node in &mut output.nodes {
        node.compression_level = level;
    }
    output
}

// ── Tests ─────────────────────────────────────────────────────────────────────
