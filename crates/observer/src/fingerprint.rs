//! Lexical fingerprints over conversation windows.
//!
//! A fingerprint is the deduplicated, sorted set of 32-bit hashes of every
//! 5-word shingle in the concatenated message text.  Jaccard overlap between
//! fingerprints is the guardrail signal for "we have already observed this".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SHINGLE_SIZE: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    /// Sorted, deduplicated shingle hashes.
    #[serde(rename = "shingleHashes")]
    pub shingle_hashes: Vec<u32>,
    #[serde(rename = "messageCount")]
    pub message_count: usize,
    #[serde(rename = "totalChars")]
    pub total_chars: usize,
    pub timestamp: DateTime<Utc>,
}

/// FNV-1a, 32-bit.  Fixed and non-cryptographic: fingerprints must be
/// stable across builds and platforms.
fn fnv1a32(text: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in text.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric() && ch != '_')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fingerprint the concatenation of `messages`.
pub fn fingerprint_messages(messages: &[String], now: DateTime<Utc>) -> SourceFingerprint {
    let total_chars = messages.iter().map(|m| m.chars().count()).sum();

    let tokens: Vec<String> = messages.iter().flat_map(|m| tokenize(m)).collect();
    let mut hashes: Vec<u32> = if tokens.is_empty() {
        Vec::new()
    } else if tokens.len() <= SHINGLE_SIZE {
        // Short inputs still produce one shingle so tiny turns are
        // comparable at all.
        vec![fnv1a32(&tokens.join(" "))]
    } else {
        tokens
            .windows(SHINGLE_SIZE)
            .map(|window| fnv1a32(&window.join(" ")))
            .collect()
    };

    hashes.sort_unstable();
    hashes.dedup();

    SourceFingerprint {
        shingle_hashes: hashes,
        message_count: messages.len(),
        total_chars,
        timestamp: now,
    }
}

/// Jaccard similarity over two sorted hash sets.  Both empty → 0.
pub fn jaccard(a: &[u32], b: &[u32]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let mut i = 0;
    let mut j = 0;
    let mut intersection = 0usize;
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                intersection += 1;
                i += 1;
                j += 1;
            }
        }
    }
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Append `new` and trim the front so at most `window` fingerprints remain.
pub fn update_recent_fingerprints(
    list: &mut Vec<SourceFingerprint>,
    new: SourceFingerprint,
    window: usize,
) {
    list.push(new);
    let window = window.max(1);
    if list.len() > window {
        let excess = list.len() - window;
        list.drain(..excess);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    fn fp(texts: &[&str]) -> SourceFingerprint {
        fingerprint_messages(&msgs(texts), Utc::now())
    }

    #[test]
    fn identical_text_overlaps_fully() {
        let a = fp(&["the user prefers dark mode in every editor they use"]);
        let b = fp(&["the user prefers dark mode in every editor they use"]);
        assert_eq!(jaccard(&a.shingle_hashes, &b.shingle_hashes), 1.0);
    }

    #[test]
    fn overlap_is_symmetric_and_bounded() {
        let a = fp(&["rust borrow checker lifetimes are tricky at first"]);
        let b = fp(&["rust borrow checker lifetimes are natural with practice"]);
        let ab = jaccard(&a.shingle_hashes, &b.shingle_hashes);
        let ba = jaccard(&b.shingle_hashes, &a.shingle_hashes);
        assert_eq!(ab, ba);
        assert!((0.0..=1.0).contains(&ab));
        assert!(ab > 0.0, "shared prefix shingles must intersect");
    }

    #[test]
    fn empty_against_anything_is_zero() {
        let a = fp(&["some real content with enough words here"]);
        let empty = fp(&[]);
        assert_eq!(jaccard(&a.shingle_hashes, &empty.shingle_hashes), 0.0);
        assert_eq!(jaccard(&empty.shingle_hashes, &empty.shingle_hashes), 0.0);
    }

    #[test]
    fn disjoint_text_has_zero_overlap() {
        let a = fp(&["alpha beta gamma delta epsilon zeta"]);
        let b = fp(&["one two three four five six"]);
        assert_eq!(jaccard(&a.shingle_hashes, &b.shingle_hashes), 0.0);
    }

    #[test]
    fn short_input_still_produces_one_shingle() {
        let a = fp(&["just three words"]);
        assert_eq!(a.shingle_hashes.len(), 1);
        let b = fp(&["just three words"]);
        assert_eq!(jaccard(&a.shingle_hashes, &b.shingle_hashes), 1.0);
    }

    #[test]
    fn shingle_count_matches_window_formula() {
        // 8 tokens → 8-4 = 4 shingles (before dedup).
        let a = fp(&["one two three four five six seven eight"]);
        assert_eq!(a.shingle_hashes.len(), 4);
    }

    #[test]
    fn hashes_are_sorted_and_deduped() {
        let a = fp(&["repeat repeat repeat repeat repeat repeat repeat repeat repeat"]);
        assert!(a.shingle_hashes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn normalisation_ignores_case_and_punctuation() {
        let a = fp(&["The User PREFERS: dark-mode, everywhere!"]);
        let b = fp(&["the user prefers dark mode everywhere"]);
        assert_eq!(jaccard(&a.shingle_hashes, &b.shingle_hashes), 1.0);
    }

    #[test]
    fn recent_window_trims_from_the_front() {
        let mut list = Vec::new();
        for i in 0..6 {
            let fp = fingerprint_messages(
                &msgs(&[&format!("message number {i} padded with extra words")]),
                Utc::now(),
            );
            update_recent_fingerprints(&mut list, fp, 4);
        }
        assert_eq!(list.len(), 4);
        assert!(list[0].total_chars > 0);
        // The oldest two were dropped.
        assert_eq!(list.last().unwrap().message_count, 1);
    }

    #[test]
    fn fingerprint_counts_messages_and_chars() {
        let a = fp(&["abc", "defg"]);
        assert_eq!(a.message_count, 2);
        assert_eq!(a.total_chars, 7);
    }
}
