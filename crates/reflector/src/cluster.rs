//! Reflection eligibility, domain assignment, and time-window clustering.

use chrono::{DateTime, Duration, Utc};
use omg_config::ClusteringConfig;
use omg_graph::RegistryEntry;
use tracing::debug;

/// One reflection work unit: ids plus their shared time range.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub domain: String,
    pub ids: Vec<String>,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
}

/// Registry entries that reflection may touch: non-archived content nodes
/// whose last update is at least `age_cutoff_days` old.
pub fn eligible_entries(
    entries: &[(String, RegistryEntry)],
    age_cutoff_days: u32,
    now: DateTime<Utc>,
) -> Vec<(String, RegistryEntry)> {
    let cutoff = now - Duration::days(i64::from(age_cutoff_days));
    entries
        .iter()
        .filter(|(_, entry)| !entry.is_archived())
        .filter(|(_, entry)| entry.node_type.is_content())
        .filter(|(_, entry)| entry.updated <= cutoff)
        .cloned()
        .collect()
}

/// Domain = canonical-key prefix before the first dot, falling back to the
/// node type.
pub fn assign_domain(entry: &RegistryEntry) -> String {
    entry
        .canonical_key
        .as_deref()
        .and_then(|key| key.split('.').next())
        .filter(|prefix| !prefix.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| entry.node_type.slug().to_string())
}

/// Greedy time clustering within one domain.
///
/// Entries are processed oldest-first; a new cluster starts whenever adding
/// the next node would exceed the window span, the node cap, or the token
/// budget.  `token_estimate` maps a node id to its compact-packet estimate.
pub fn cluster_domain(
    domain: &str,
    mut entries: Vec<(String, RegistryEntry)>,
    config: &ClusteringConfig,
    token_estimate: impl Fn(&str) -> u64,
) -> Vec<Cluster> {
    entries.sort_by(|a, b| a.1.updated.cmp(&b.1.updated));

    let max_span = Duration::days(i64::from(config.window_span_days));
    let mut clusters: Vec<Cluster> = Vec::new();
    let mut current: Option<(Cluster, u64)> = None;

    for (id, entry) in entries {
        let tokens = token_estimate(&id);
        let fits = current.as_ref().is_some_and(|(cluster, used)| {
            entry.updated - cluster.range_start <= max_span
                && cluster.ids.len() < config.max_nodes_per_cluster
                && used + tokens <= config.max_input_tokens_per_cluster
        });

        if fits {
            let (cluster, used) = current.as_mut().expect("fits implies current");
            cluster.ids.push(id);
            cluster.range_end = entry.updated;
            *used += tokens;
        } else {
            if let Some((done, _)) = current.take() {
                clusters.push(done);
            }
            current = Some((
                Cluster {
                    domain: domain.to_string(),
                    ids: vec![id],
                    range_start: entry.updated,
                    range_end: entry.updated,
                },
                tokens,
            ));
        }
    }
    if let Some((done, _)) = current.take() {
        clusters.push(done);
    }

    debug!(domain, clusters = clusters.len(), "domain clustered");
    clusters
}

/// Split an oversized cluster around its most-linked anchor node: every
/// subcluster carries the anchor plus a bounded slice of the rest.
pub fn anchor_split(
    cluster: Cluster,
    links_of: impl Fn(&str) -> usize,
    max_nodes: usize,
) -> Vec<Cluster> {
    let max_nodes = max_nodes.max(2);
    if cluster.ids.len() <= max_nodes {
        return vec![cluster];
    }

    let anchor = cluster
        .ids
        .iter()
        .max_by_key(|id| links_of(id))
        .cloned()
        .expect("oversized cluster is non-empty");

    let rest: Vec<String> = cluster
        .ids
        .iter()
        .filter(|id| **id != anchor)
        .cloned()
        .collect();

    rest.chunks(max_nodes - 1)
        .map(|chunk| {
            let mut ids = vec![anchor.clone()];
            ids.extend(chunk.iter().cloned());
            Cluster {
                domain: cluster.domain.clone(),
                ids,
                range_start: cluster.range_start,
                range_end: cluster.range_end,
            }
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use omg_graph::{NodeType, Priority};

    use super::*;

    fn entry(key: Option<&str>, node_type: NodeType, updated_days_ago: i64) -> RegistryEntry {
        let now = Utc::now();
        RegistryEntry {
            node_type,
            kind: "node".to_string(),
            description: "d".to_string(),
            priority: Priority::Medium,
            created: now - Duration::days(updated_days_ago + 1),
            updated: now - Duration::days(updated_days_ago),
            file_path: "nodes/x.md".to_string(),
            canonical_key: key.map(str::to_string),
            aliases: None,
            links: None,
            tags: None,
            archived: None,
            merged_into: None,
        }
    }

    fn config() -> ClusteringConfig {
        ClusteringConfig {
            enabled: true,
            window_span_days: 14,
            max_nodes_per_cluster: 30,
            max_input_tokens_per_cluster: 8000,
            enable_anchor_split: false,
        }
    }

    #[test]
    fn eligibility_excludes_young_archived_and_structural() {
        let entries = vec![
            ("omg/fact/old".to_string(), entry(Some("facts.old"), NodeType::Fact, 10)),
            ("omg/fact/young".to_string(), entry(Some("facts.young"), NodeType::Fact, 0)),
            ("omg/now".to_string(), entry(None, NodeType::Now, 10)),
            ("omg/reflection/r".to_string(), entry(None, NodeType::Reflection, 10)),
            ("omg/fact/archived".to_string(), {
                let mut e = entry(Some("facts.archived"), NodeType::Fact, 10);
                e.archived = Some(true);
                e
            }),
        ];
        let eligible = eligible_entries(&entries, 3, Utc::now());
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].0, "omg/fact/old");
    }

    #[test]
    fn domain_prefers_key_prefix_over_type() {
        assert_eq!(assign_domain(&entry(Some("health.sleep"), NodeType::Fact, 0)), "health");
        assert_eq!(assign_domain(&entry(None, NodeType::Decision, 0)), "decision");
    }

    #[test]
    fn clustering_respects_the_window_span() {
        let entries = vec![
            ("a".to_string(), entry(Some("h.a"), NodeType::Fact, 40)),
            ("b".to_string(), entry(Some("h.b"), NodeType::Fact, 35)),
            ("c".to_string(), entry(Some("h.c"), NodeType::Fact, 5)),
        ];
        let clusters = cluster_domain("h", entries, &config(), |_| 100);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].ids, vec!["a", "b"]);
        assert_eq!(clusters[1].ids, vec!["c"]);
        assert!(clusters[0].range_start <= clusters[0].range_end);
    }

    #[test]
    fn clustering_respects_the_node_cap() {
        let mut cfg = config();
        cfg.max_nodes_per_cluster = 2;
        let entries: Vec<_> = (0..5)
            .map(|i| (format!("n{i}"), entry(Some("h.x"), NodeType::Fact, 10)))
            .collect();
        let clusters = cluster_domain("h", entries, &cfg, |_| 1);
        assert_eq!(clusters.len(), 3);
        assert!(clusters.iter().all(|c| c.ids.len() <= 2));
    }

    #[test]
    fn clustering_respects_the_token_budget() {
        let mut cfg = config();
        cfg.max_input_tokens_per_cluster = 1000;
        let entries: Vec<_> = (0..4)
            .map(|i| (format!("n{i}"), entry(Some("h.x"), NodeType::Fact, 10)))
            .collect();
        // 400 tokens each: two per cluster.
        let clusters = cluster_domain("h", entries, &cfg, |_| 400);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].ids.len(), 2);
    }

    #[test]
    fn entries_sort_oldest_first_inside_clusters() {
        let entries = vec![
            ("new".to_string(), entry(Some("h.n"), NodeType::Fact, 4)),
            ("old".to_string(), entry(Some("h.o"), NodeType::Fact, 9)),
        ];
        let clusters = cluster_domain("h", entries, &config(), |_| 1);
        assert_eq!(clusters[0].ids, vec!["old", "new"]);
    }

    #[test]
    fn anchor_split_replicates_the_anchor() {
        let cluster = Cluster {
            domain: "h".to_string(),
            ids: (0..7).map(|i| format!("n{i}")).collect(),
            range_start: Utc::now() - Duration::days(10),
            range_end: Utc::now(),
        };
        // n3 is the best-linked node.
        let splits = anchor_split(cluster, |id| if id == "n3" { 9 } else { 1 }, 3);
        assert_eq!(splits.len(), 3);
        for split in &splits {
            assert!(split.ids.contains(&"n3".to_string()));
            assert!(split.ids.len() <= 3);
        }
        // Every non-anchor id appears exactly once across the splits.
        let mut non_anchor: Vec<&String> = splits
            .iter()
            .flat_map(|c| c.ids.iter())
            .filter(|id| *id != "n3")
            .collect();
        non_anchor.sort();
        non_anchor.dedup();
        assert_eq!(non_anchor.len(), 6);
    }

    #[test]
    fn small_clusters_are_not_split() {
        let cluster = Cluster {
            domain: "h".to_string(),
            ids: vec!["a".to_string(), "b".to_string()],
            range_start: Utc::now(),
            range_end: Utc::now(),
        };
        let splits = anchor_split(cluster, |_| 1, 5);
        assert_eq!(splits.len(), 1);
    }
}
