//! Extraction guardrails: skip/truncate decisions before the model is
//! called, and candidate suppression after it answers.

use chrono::{DateTime, Utc};
use omg_config::GuardrailConfig;
use omg_graph::RegistryEntry;
use std::collections::BTreeMap;
use tracing::debug;

use crate::fingerprint::{fingerprint_messages, jaccard, SourceFingerprint};
use crate::parser::ObservationOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapDecision {
    Proceed,
    Truncate,
    Skip,
}

#[derive(Debug, Clone)]
pub struct OverlapCheck {
    pub decision: OverlapDecision,
    pub max_overlap: f64,
    pub fingerprint: SourceFingerprint,
}

/// Compare this turn's fingerprint against the session's recent window.
pub fn check_source_overlap(
    messages: &[String],
    recent: &[SourceFingerprint],
    config: &GuardrailConfig,
    now: DateTime<Utc>,
) -> OverlapCheck {
    let fingerprint = fingerprint_messages(messages, now);

    if !config.enabled || recent.is_empty() {
        return OverlapCheck {
            decision: OverlapDecision::Proceed,
            max_overlap: 0.0,
            fingerprint,
        };
    }

    let max_overlap = recent
        .iter()
        .map(|r| jaccard(&fingerprint.shingle_hashes, &r.shingle_hashes))
        .fold(0.0_f64, f64::max);

    let decision = if max_overlap >= config.skip_overlap_threshold {
        OverlapDecision::Skip
    } else if max_overlap >= config.truncate_overlap_threshold {
        OverlapDecision::Truncate
    } else {
        OverlapDecision::Proceed
    };

    debug!(max_overlap, ?decision, "source overlap checked");
    OverlapCheck {
        decision,
        max_overlap,
        fingerprint,
    }
}

/// Drop the messages whose own fingerprint already overlaps the recent
/// window past the truncate threshold; the remainder proceeds.
pub fn truncate_overlapping(
    messages: &[String],
    recent: &[SourceFingerprint],
    config: &GuardrailConfig,
    now: DateTime<Utc>,
) -> Vec<String> {
    messages
        .iter()
        .filter(|message| {
            let fp = fingerprint_messages(std::slice::from_ref(*message), now);
            let overlap = recent
                .iter()
                .map(|r| jaccard(&fp.shingle_hashes, &r.shingle_hashes))
                .fold(0.0_f64, f64::max);
            overlap < config.truncate_overlap_threshold
        })
        .cloned()
        .collect()
}

// ── Candidate suppression ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SuppressionResult {
    pub survivors: Vec<ObservationOp>,
    pub suppressed: Vec<ObservationOp>,
}

/// Score each candidate against the nodes written on recent turns and
/// suppress the ones that look like re-extractions.
///
/// The score is a convex combination of canonical-key similarity and
/// description token Jaccard, with an optional host-provided semantic score
/// folded in when present.
pub fn suppress_duplicate_candidates(
    candidates: Vec<ObservationOp>,
    recent_ids: &[String],
    registry: &BTreeMap<String, RegistryEntry>,
    semantic_scores: &BTreeMap<String, f64>,
    config: &GuardrailConfig,
) -> SuppressionResult {
    if !config.enabled || recent_ids.is_empty() {
        return SuppressionResult {
            survivors: candidates,
            suppressed: Vec::new(),
        };
    }

    let mut result = SuppressionResult::default();
    for candidate in candidates {
        let best = recent_ids
            .iter()
            .filter_map(|id| registry.get(id).map(|entry| (id, entry)))
            .map(|(id, entry)| {
                candidate_similarity(&candidate, entry, semantic_scores.get(id).copied())
            })
            .fold(0.0_f64, f64::max);

        if best >= config.candidate_suppression_threshold {
            debug!(
                key = %candidate.canonical_key,
                score = best,
                "candidate suppressed against recent nodes"
            );
            result.suppressed.push(candidate);
        } else {
            result.survivors.push(candidate);
        }
    }
    result
}

fn candidate_similarity(
    candidate: &ObservationOp,
    entry: &RegistryEntry,
    semantic: Option<f64>,
) -> f64 {
    let key_score = entry
        .canonical_key
        .as_deref()
        .map(|key| key_similarity(&candidate.canonical_key, key))
        .unwrap_or(0.0);
    let desc_score = token_jaccard(&candidate.description, &entry.description);

    match semantic {
        Some(sem) => 0.4 * key_score + 0.4 * desc_score + 0.2 * sem.clamp(0.0, 1.0),
        None => 0.5 * key_score + 0.5 * desc_score,
    }
}

/// 1.0 for identical keys, otherwise the fraction of leading dot-segments
/// shared.
pub fn key_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a_segments: Vec<&str> = a.split('.').collect();
    let b_segments: Vec<&str> = b.split('.').collect();
    let shared = a_segments
        .iter()
        .zip(&b_segments)
        .take_while(|(x, y)| x == y)
        .count();
    shared as f64 / a_segments.len().max(b_segments.len()) as f64
}

/// Jaccard over lowercase word sets.
pub fn token_jaccard(a: &str, b: &str) -> f64 {
    let set = |text: &str| -> std::collections::BTreeSet<String> {
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
    let intersection = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    intersection as f64 / union as f64
}

// ── Tests ─────────────────────────────────────────────────────────────────────
