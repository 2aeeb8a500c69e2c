//! Markdown-with-YAML-header codec.
//!
//! A node file is an optional `---`-delimited YAML block followed by a
//! markdown body.  Parsing is tolerant: a malformed header degrades to an
//! empty map and the original text, never an error — corrupt files must not
//! take the whole graph down.

use serde_yaml::Mapping;
use tracing::warn;

use crate::node::NodeHeader;

/// Split `text` into `(yaml mapping, body)`.
///
/// Returns an empty mapping and the *original* text when there is no header
/// or the header fails to parse as a YAML mapping.
pub fn parse_frontmatter(text: &str) -> (Mapping, String) {
    let Some((raw_header, body)) = split_frontmatter(text) else {
        return (Mapping::new(), text.to_string());
    };

    match serde_yaml::from_str::<Mapping>(raw_header) {
        Ok(mapping) => (mapping, body.to_string()),
        Err(err) => {
            warn!(error = %err, "malformed YAML frontmatter — treating file as headerless");
            (Mapping::new(), text.to_string())
        }
    }
}

/// Typed variant: parse the header block into a [`NodeHeader`].
///
/// `None` means the file has no usable header (absent or malformed); the
/// caller decides whether that is a warning or a hard failure.
pub fn parse_node_text(text: &str) -> Option<(NodeHeader, String)> {
    let (raw_header, body) = split_frontmatter(text)?;
    match serde_yaml::from_str::<NodeHeader>(raw_header) {
        Ok(header) => Some((header, body.to_string())),
        Err(err) => {
            warn!(error = %err, "node header failed typed parse");
            None
        }
    }
}

/// Emit the canonical file text: `---`, header YAML in declaration order,
/// `---`, then the body.
pub fn serialize_node(header: &NodeHeader, body: &str) -> Result<String, serde_yaml::Error> {
    let yaml = serde_yaml::to_string(header)?;
    let body = body.trim_end();
    if body.is_empty() {
        Ok(format!("---\n{yaml}---\n"))
    } else {
        Ok(format!("---\n{yaml}---\n\n{body}\n"))
    }
}

/// Locate the leading `---` fence pair.  Returns `(header, body)` slices.
fn split_frontmatter(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix("---")?;
    // The opening fence must be a whole line.
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;

    for (idx, line) in line_spans(rest) {
        if line.trim_end() == "---" {
            let header = &rest[..idx];
            let after = &rest[idx + line.len()..];
            let body = after.strip_prefix('\n').unwrap_or(after);
            let body = body.strip_prefix('\n').unwrap_or(body);
            return Some((header, body));
        }
    }
    None
}

/// Iterate `(byte offset, line-with-terminator)` pairs.
fn line_spans(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    std::iter::from_fn(move || {
        if offset >= text.len() {
            return None;
        }
        let rest = &text[offset..];
        let len = rest.find('\n').map(|i| i + 1).unwrap_or(rest.len());
        let span = (offset, &rest[..len]);
        offset += len;
        Some(span)
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
