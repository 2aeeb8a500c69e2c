//! Merge decisions: does a surviving candidate become a new node, fold into
//! an existing one, or just leave an alias behind?

use std::collections::BTreeMap;

use async_trait::async_trait;
use omg_config::MergeConfig;
use omg_graph::RegistryEntry;
use tracing::debug;

use crate::guardrails::{key_similarity, token_jaccard};
use crate::parser::ObservationOp;

/// Host-provided semantic search.  Optional: when the host has no search
/// tool, merge scoring runs on lexical signals alone.
#[async_trait]
pub trait SemanticSearch: Send + Sync {
    /// Node ids similar to `query`, scored 0..=1, best first.
    async fn similar_nodes(&self, query: &str, top: usize) -> Vec<(String, f64)>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    /// No neighbour — write a fresh node.
    WriteNew,
    /// The content-addressed neighbour exists; fold the candidate into it
    /// (append when the body adds something, no-op otherwise).
    MergeExact { target_id: String },
    /// A similar-but-distinct neighbour wins; record the candidate's key as
    /// an alias on it and write nothing.
    Alias { target_id: String },
}

/// Decide what to do with one candidate against a registry snapshot.
///
/// `semantic_scores` maps node id → host search score for this candidate's
/// description, already truncated to `merge.semantic_top_s` by the caller.
pub fn decide_merge(
    candidate: &ObservationOp,
    entries: &BTreeMap<String, RegistryEntry>,
    semantic_scores: &BTreeMap<String, f64>,
    config: &MergeConfig,
) -> MergeDecision {
    // Exact neighbour: the candidate's own content address, or a node that
    // already carries the key as canonical or alias.
    if let Some(id) = exact_neighbour(candidate, entries) {
        return MergeDecision::MergeExact { target_id: id };
    }

    // Ranked lexical neighbours of the same type.
    let mut scored: Vec<(&String, f64)> = entries
        .iter()
        .filter(|(_, entry)| entry.node_type == candidate.node_type && !entry.is_archived())
        .map(|(id, entry)| {
            let local = local_similarity(candidate, entry);
            (id, local)
        })
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(config.local_top_m.max(config.final_top_k));

    // A host search score boosts the lexical signal; without one, the
    // lexical score stands alone rather than being dragged down by a zero
    // semantic term.
    let best = scored
        .into_iter()
        .take(config.final_top_k.max(1))
        .map(|(id, local)| {
            let combined = match semantic_scores.get(id) {
                Some(semantic) => {
                    config.local_weight * local + config.semantic_weight * semantic
                }
                None => local,
            };
            (id.clone(), combined)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1));

    match best {
        Some((id, score)) if score >= config.merge_threshold => {
            debug!(target = %id, score, key = %candidate.canonical_key, "aliasing candidate to neighbour");
            MergeDecision::Alias { target_id: id }
        }
        _ => MergeDecision::WriteNew,
    }
}

fn exact_neighbour(
    candidate: &ObservationOp,
    entries: &BTreeMap<String, RegistryEntry>,
) -> Option<String> {
    if entries.contains_key(&candidate.id) {
        return Some(candidate.id.clone());
    }
    entries
        .iter()
        .find(|(_, entry)| {
            entry.node_type == candidate.node_type
                && (entry.canonical_key.as_deref() == Some(candidate.canonical_key.as_str())
                    || entry
                        .aliases
                        .as_ref()
                        .is_some_and(|aliases| aliases.iter().any(|a| a == &candidate.canonical_key)))
        })
        .map(|(id, _)| id.clone())
}

/// Lexical similarity: description Jaccard, lifted by key-prefix agreement.
fn local_similarity(candidate: &ObservationOp, entry: &RegistryEntry) -> f64 {
    let desc = token_jaccard(&candidate.description, &entry.description);
    let key = entry
        .canonical_key
        .as_deref()
        .map(|key| key_similarity(&candidate.canonical_key, key))
        .unwrap_or(0.0);
    desc.max(0.7 * key + 0.3 * desc)
}

/// True when the candidate's body contributes text the node does not
/// already contain.  Whitespace-normalised containment, not equality: the
/// model frequently restates an existing body with fresh phrasing around it.
pub fn body_adds_content(candidate_body: &str, existing_body: &str) -> bool {
    let candidate = normalize(candidate_body);
    if candidate.is_empty() {
        return false;
    }
    !normalize(existing_body).contains(&candidate)
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use omg_graph::{NodeType, Priority};

    use super::*;
    use crate::parser::ObservationAction;

    fn config() -> MergeConfig {
        MergeConfig {
            local_top_m: 8,
            semantic_top_s: 5,
            final_top_k: 5,
            local_weight: 0.6,
            semantic_weight: 0.4,
            merge_threshold: 0.75,
        }
    }

    fn candidate(key: &str, description: &str) -> ObservationOp {
        ObservationOp {
            action: ObservationAction::Upsert,
            node_type: NodeType::Preference,
            id: format!(
                "omg/preference/{}",
                key.replace('.', "-")
            ),
            canonical_key: key.to_string(),
            title: description.to_string(),
            description: description.to_string(),
            priority: Priority::Medium,
            body: "body".to_string(),
            links: Vec::new(),
            tags: Vec::new(),
            moc_hints: Vec::new(),
            target_id: None,
            applies_to: None,
        }
    }

    fn entry(key: &str, description: &str) -> RegistryEntry {
        let now = Utc::now();
        RegistryEntry {
            node_type: NodeType::Preference,
            kind: "node".to_string(),
            description: description.to_string(),
            priority: Priority::Medium,
            created: now,
            updated: now,
            file_path: "nodes/preference/x.md".to_string(),
            canonical_key: Some(key.to_string()),
            aliases: None,
            links: None,
            tags: None,
            archived: None,
            merged_into: None,
        }
    }

    #[test]
    fn empty_registry_writes_new() {
        let decision = decide_merge(
            &candidate("preferences.editor-theme", "dark themes"),
            &BTreeMap::new(),
            &BTreeMap::new(),
            &config(),
        );
        assert_eq!(decision, MergeDecision::WriteNew);
    }

    #[test]
    fn identical_key_merges_exact() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "omg/preference/editor-theme".to_string(),
            entry("preferences.editor-theme", "prefers dark editor themes"),
        );
        let decision = decide_merge(
            &candidate("preferences.editor-theme", "prefers dark editor themes"),
            &entries,
            &BTreeMap::new(),
            &config(),
        );
        assert_eq!(
            decision,
            MergeDecision::MergeExact {
                target_id: "omg/preference/editor-theme".to_string()
            }
        );
    }

    #[test]
    fn alias_key_counts_as_exact() {
        let mut neighbour = entry("preferences.editor-theme", "prefers dark themes");
        neighbour.aliases = Some(vec!["preferences.theme".to_string()]);
        let mut entries = BTreeMap::new();
        entries.insert("omg/preference/editor-theme".to_string(), neighbour);

        let decision = decide_merge(
            &candidate("preferences.theme", "prefers dark themes"),
            &entries,
            &BTreeMap::new(),
            &config(),
        );
        assert_eq!(
            decision,
            MergeDecision::MergeExact {
                target_id: "omg/preference/editor-theme".to_string()
            }
        );
    }

    #[test]
    fn similar_key_and_description_alias_to_survivor() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "omg/preference/editor-theme".to_string(),
            entry(
                "preferences.editor-theme",
                "the user prefers a dark editor theme",
            ),
        );
        let decision = decide_merge(
            &candidate("preferences.theme", "the user prefers a dark theme"),
            &entries,
            &BTreeMap::new(),
            &config(),
        );
        assert_eq!(
            decision,
            MergeDecision::Alias {
                target_id: "omg/preference/editor-theme".to_string()
            }
        );
    }

    #[test]
    fn semantic_score_can_tip_the_decision() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "omg/preference/editor-theme".to_string(),
            entry("preferences.editor-theme", "colour scheme choice for coding"),
        );
        let mut cfg = config();
        cfg.merge_threshold = 0.6;

        let without = decide_merge(
            &candidate("preferences.ide-colors", "prefers dim colour scheme while coding"),
            &entries,
            &BTreeMap::new(),
            &cfg,
        );
        assert_eq!(without, MergeDecision::WriteNew);

        let mut scores = BTreeMap::new();
        scores.insert("omg/preference/editor-theme".to_string(), 0.95);
        let with = decide_merge(
            &candidate("preferences.ide-colors", "prefers dim colour scheme while coding"),
            &entries,
            &scores,
            &cfg,
        );
        assert!(matches!(with, MergeDecision::Alias { .. }));
    }

    #[test]
    fn unrelated_candidate_writes_new() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "omg/preference/editor-theme".to_string(),
            entry("preferences.editor-theme", "prefers dark themes"),
        );
        let decision = decide_merge(
            &candidate("preferences.coffee", "drinks oat milk lattes"),
            &entries,
            &BTreeMap::new(),
            &config(),
        );
        assert_eq!(decision, MergeDecision::WriteNew);
    }

    #[test]
    fn body_containment_detection() {
        assert!(body_adds_content("new detail", "old body"));
        assert!(!body_adds_content("old body", "some old body here"));
        assert!(!body_adds_content("  OLD   body ", "the old body text"));
        assert!(!body_adds_content("", "anything"));
    }
}
