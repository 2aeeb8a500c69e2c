//! Deterministic identifiers: slugs, canonical keys, node ids, UIDs, paths.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::error::GraphError;
use crate::node::NodeType;

static CANONICAL_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9]*(\.[a-z][a-z0-9_-]*)+$").expect("canonical key regex compiles")
});

/// Lowercase, fold diacritics (NFKD, combining marks dropped), replace every
/// non-`[a-z0-9]` run with a single `-`, trim leading/trailing dashes.
pub fn slugify(input: &str) -> Result<String, GraphError> {
    let folded: String = input
        .nfkd()
        .filter(|ch| !unicode_normalization::char::is_combining_mark(*ch))
        .collect();

    let mut slug = String::with_capacity(folded.len());
    let mut last_dash = true; // suppress a leading dash
    for ch in folded.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }

    if slug.is_empty() {
        return Err(GraphError::EmptySlug {
            input: input.to_string(),
        });
    }
    Ok(slug)
}

/// True when `key` matches the dotted lowercase canonical-key grammar.
pub fn canonical_key_is_valid(key: &str) -> bool {
    CANONICAL_KEY_RE.is_match(key)
}

/// The slug a node's id and path are built from.  When the key's first
/// segment is the type itself (the regenerated-key shape), that segment is
/// dropped so the type never appears twice in the path.
pub fn key_slug(node_type: NodeType, canonical_key: &str) -> Result<String, GraphError> {
    let stripped = canonical_key
        .split_once('.')
        .filter(|(head, _)| *head == node_type.slug())
        .map(|(_, rest)| rest)
        .unwrap_or(canonical_key);
    slugify(stripped)
}

/// `omg/<type>/<slug(key)>`.
pub fn node_id(node_type: NodeType, canonical_key: &str) -> Result<String, GraphError> {
    Ok(format!(
        "omg/{}/{}",
        node_type.slug(),
        key_slug(node_type, canonical_key)?
    ))
}

/// `nodes/<type>/<slug(key)>.md`, relative to the graph root.
pub fn node_rel_path(node_type: NodeType, canonical_key: &str) -> Result<String, GraphError> {
    Ok(format!(
        "nodes/{}/{}.md",
        node_type.slug(),
        key_slug(node_type, canonical_key)?
    ))
}

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// 26-character scope-qualified hash, stable across renames: sha-256 over
/// `scope\0type\0canonicalKey`, first 128 bits, base32.
pub fn uid(scope: &str, node_type: NodeType, canonical_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update([0u8]);
    hasher.update(node_type.slug().as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_key.as_bytes());
    let digest = hasher.finalize();
    base32_encode(&digest[..16])
}

/// Unpadded base32 over the input bytes.  16 bytes → 26 characters.
fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let index = ((buffer >> bits) & 0x1f) as usize;
            out.push(BASE32_ALPHABET[index] as char);
        }
    }
    if bits > 0 {
        let index = ((buffer << (5 - bits)) & 0x1f) as usize;
        out.push(BASE32_ALPHABET[index] as char);
    }
    out
}

/// Fall back to `type + "." + slug(title)` when the extractor omitted the
/// canonical key.  Dots inside the slug would break the key grammar, so the
/// slug becomes the single trailing segment.
pub fn regenerate_canonical_key(node_type: NodeType, title: &str) -> Result<String, GraphError> {
    let slug = slugify(title)?;
    Ok(format!("{}.{slug}", node_type.slug()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("Dark Mode Everywhere").unwrap(), "dark-mode-everywhere");
        assert_eq!(slugify("  spaced   out  ").unwrap(), "spaced-out");
        assert_eq!(slugify("already-slugged").unwrap(), "already-slugged");
    }

    #[test]
    fn slugify_folds_diacritics() {
        assert_eq!(slugify("Crème Brûlée").unwrap(), "creme-brulee");
        assert_eq!(slugify("Ångström").unwrap(), "angstrom");
    }

    #[test]
    fn slugify_collapses_symbol_runs() {
        assert_eq!(slugify("a !!! b???c").unwrap(), "a-b-c");
    }

    #[test]
    fn slugify_rejects_empty_results() {
        let err = slugify("!!!").unwrap_err();
        assert!(matches!(err, GraphError::EmptySlug { .. }));
        assert!(slugify("").is_err());
    }

    #[test]
    fn canonical_key_grammar() {
        assert!(canonical_key_is_valid("preferences.editor-theme"));
        assert!(canonical_key_is_valid("projects.omg.rollout_plan"));
        assert!(!canonical_key_is_valid("single"));
        assert!(!canonical_key_is_valid("Upper.case"));
        assert!(!canonical_key_is_valid(".leading.dot"));
        assert!(!canonical_key_is_valid("trailing.dot."));
        assert!(!canonical_key_is_valid("9start.num"));
    }

    #[test]
    fn node_id_and_path_are_pure() {
        let a = node_id(NodeType::Preference, "preferences.editor-theme").unwrap();
        let b = node_id(NodeType::Preference, "preferences.editor-theme").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "omg/preference/preferences-editor-theme");
        assert_eq!(
            node_rel_path(NodeType::Preference, "preferences.editor-theme").unwrap(),
            "nodes/preference/preferences-editor-theme.md"
        );
    }

    #[test]
    fn regenerated_keys_do_not_double_the_type_segment() {
        // A key regenerated from type + slug(title) keeps the type out of the
        // file stem.
        assert_eq!(
            node_id(NodeType::Preference, "preference.dark-mode-everywhere").unwrap(),
            "omg/preference/dark-mode-everywhere"
        );
        assert_eq!(
            node_rel_path(NodeType::Preference, "preference.dark-mode-everywhere").unwrap(),
            "nodes/preference/dark-mode-everywhere.md"
        );
    }

    #[test]
    fn uid_is_deterministic_and_26_chars() {
        let a = uid("workspace-a", NodeType::Fact, "facts.birthday");
        let b = uid("workspace-a", NodeType::Fact, "facts.birthday");
        assert_eq!(a, b);
        assert_eq!(a.len(), 26);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn uid_varies_with_every_component() {
        let base = uid("s", NodeType::Fact, "facts.a");
        assert_ne!(base, uid("t", NodeType::Fact, "facts.a"));
        assert_ne!(base, uid("s", NodeType::Preference, "facts.a"));
        assert_ne!(base, uid("s", NodeType::Fact, "facts.b"));
    }

    #[test]
    fn regenerated_key_is_valid() {
        let key = regenerate_canonical_key(NodeType::Preference, "Dark Mode Everywhere").unwrap();
        assert_eq!(key, "preference.dark-mode-everywhere");
        assert!(canonical_key_is_valid(&key));
    }
}
