//! Parsing and validation of `<reflection>` responses.
//!
//! Same contract as the observation parser: forgiving input handling, a
//! well-formed result for any string, per-record drops with diagnostics.
//! Structural invariants are checked separately by [`validate_reflection`]
//! so the orchestrator can classify violations.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use omg_graph::{CompressionLevel, MocAction, MocUpdate};

use crate::error::{ReflectorError, ReflectorInvariant};

/// Below this tag count the model is under-labelling; the parser warns but
/// keeps the node.
const EXPECTED_MIN_TAGS: usize = 10;

// ── Output types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReflectionNodeOut {
    pub id: String,
    pub description: String,
    pub sources: Vec<String>,
    pub tags: Vec<String>,
    pub body: String,
    pub compression_level: CompressionLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateField {
    Description,
    Priority,
    Body,
    Tags,
    Links,
}

impl UpdateField {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "description" => Some(Self::Description),
            "priority" => Some(Self::Priority),
            "body" => Some(Self::Body),
            "tags" => Some(Self::Tags),
            "links" => Some(Self::Links),
            _ => None,
        }
    }

    /// `description` and `priority` are scalar: only `set` applies.
    pub fn allows(self, action: UpdateAction) -> bool {
        match self {
            Self::Description | Self::Priority => action == UpdateAction::Set,
            Self::Body | Self::Tags | Self::Links => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    Set,
    Add,
    Remove,
}

impl UpdateAction {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "set" => Some(Self::Set),
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeFieldUpdate {
    pub target_id: String,
    pub field: UpdateField,
    pub action: UpdateAction,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReflectionOutput {
    pub nodes: Vec<ReflectionNodeOut>,
    pub archives: Vec<String>,
    pub moc_updates: Vec<MocUpdate>,
    pub node_updates: Vec<NodeFieldUpdate>,
    pub diagnostics: Vec<String>,
}

impl ReflectionOutput {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.archives.is_empty()
            && self.moc_updates.is_empty()
            && self.node_updates.is_empty()
    }
}

// ── Regexes ───────────────────────────────────────────────────────────────────

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[a-zA-Z]*\s*\n(.*?)```").expect("fence regex compiles")
});

static REFLECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<reflection\b[^>]*>(.*?)</reflection>").expect("reflection regex compiles")
});

static NODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<node\b([^>]*)>(.*?)</node>").expect("node regex compiles")
});

static NODES_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<reflection-nodes\b[^>]*>(.*?)</reflection-nodes>")
        .expect("nodes block regex compiles")
});

static ARCHIVE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<archive-nodes\b[^>]*>(.*?)</archive-nodes>")
        .expect("archive block regex compiles")
});

static NODE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<node-id>(.*?)</node-id>").expect("node-id regex compiles")
});

static MOC_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<moc-updates\b[^>]*>(.*?)</moc-updates>").expect("moc block regex compiles")
});

static MOC_ENTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<moc\b([^>]*?)/?>").expect("moc entry regex compiles"));

static UPDATES_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<node-updates\b[^>]*>(.*?)</node-updates>")
        .expect("updates block regex compiles")
});

static UPDATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<update\b([^>]*)>(.*?)</update>").expect("update regex compiles")
});

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([\w-]+)\s*=\s*"([^"]*)""#).expect("attribute regex compiles")
});

// ── Parse ─────────────────────────────────────────────────────────────────────

pub fn parse_reflection_response(raw: &str) -> ReflectionOutput {
    let mut output = ReflectionOutput::default();

    let unfenced = strip_fences(raw);
    let Some(scope) = REFLECTION_RE
        .captures(&unfenced)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
    else {
        warn!("response contained no <reflection> block");
        output
            .diagnostics
            .push("no <reflection> block".to_string());
        return output;
    };

    if let Some(block) = NODES_BLOCK_RE.captures(&scope).and_then(|c| c.get(1)) {
        for captures in NODE_RE.captures_iter(block.as_str()) {
            let attrs = parse_attributes(captures.get(1).map_or("", |m| m.as_str()));
            let inner = captures.get(2).map_or("", |m| m.as_str());
            match parse_reflection_node(&attrs, inner) {
                Ok((node, warnings)) => {
                    output.diagnostics.extend(warnings);
                    output.nodes.push(node);
                }
                Err(reason) => output.diagnostics.push(reason),
            }
        }
    }

    if let Some(block) = ARCHIVE_BLOCK_RE.captures(&scope).and_then(|c| c.get(1)) {
        let mut seen = BTreeSet::new();
        for captures in NODE_ID_RE.captures_iter(block.as_str()) {
            let id = captures[1].trim().to_string();
            if !id.starts_with("omg/") {
                output
                    .diagnostics
                    .push(format!("dropped archive target: invalid id {id:?}"));
                continue;
            }
            if seen.insert(id.clone()) {
                output.archives.push(id);
            }
        }
    }

    if let Some(block) = MOC_BLOCK_RE.captures(&scope).and_then(|c| c.get(1)) {
        for entry in MOC_ENTRY_RE.captures_iter(block.as_str()) {
            let attrs = parse_attributes(entry.get(1).map_or("", |m| m.as_str()));
            match parse_moc_entry(&attrs) {
                Ok(update) => output.moc_updates.push(update),
                Err(reason) => output.diagnostics.push(reason),
            }
        }
    }

    if let Some(block) = UPDATES_BLOCK_RE.captures(&scope).and_then(|c| c.get(1)) {
        for captures in UPDATE_RE.captures_iter(block.as_str()) {
            let attrs = parse_attributes(captures.get(1).map_or("", |m| m.as_str()));
            let value = decode_entities(captures.get(2).map_or("", |m| m.as_str()))
                .trim()
                .to_string();
            match parse_node_update(&attrs, value) {
                Ok(update) => output.node_updates.push(update),
                Err(reason) => output.diagnostics.push(reason),
            }
        }
    }

    output
}

fn parse_reflection_node(
    attrs: &[(String, String)],
    inner: &str,
) -> Result<(ReflectionNodeOut, Vec<String>), String> {
    let id = child_element(inner, "id").unwrap_or_default();
    if id.is_empty() {
        return Err("dropped reflection node: missing id".to_string());
    }
    let description = child_element(inner, "description").unwrap_or_default();
    if description.is_empty() {
        return Err(format!("dropped reflection node {id}: missing description"));
    }

    let compression_level = attr(attrs, "compression-level")
        .and_then(|v| v.trim().parse::<u8>().ok())
        .and_then(CompressionLevel::from_u8)
        .unwrap_or(CompressionLevel::None);

    let sources = child_element(inner, "sources")
        .map(|raw| split_commas(&raw))
        .unwrap_or_default();
    let tags = child_element(inner, "tags")
        .map(|raw| split_commas(&raw))
        .unwrap_or_default();

    let mut warnings = Vec::new();
    if tags.len() < EXPECTED_MIN_TAGS {
        warnings.push(format!(
            "reflection node {id}: only {} tags (expected ≥ {EXPECTED_MIN_TAGS})",
            tags.len()
        ));
    }

    let body = child_element(inner, "body").unwrap_or_default();

    Ok((
        ReflectionNodeOut {
            id,
            description,
            sources,
            tags,
            body,
            compression_level,
        },
        warnings,
    ))
}

fn parse_moc_entry(attrs: &[(String, String)]) -> Result<MocUpdate, String> {
    let domain = attr(attrs, "domain").unwrap_or_default().to_string();
    let node_id = attr(attrs, "nodeid")
        .or_else(|| attr(attrs, "node-id"))
        .unwrap_or_default()
        .to_string();
    let action = match attr(attrs, "action").unwrap_or("add").trim().to_lowercase().as_str() {
        "add" => MocAction::Add,
        "remove" => MocAction::Remove,
        other => return Err(format!("dropped moc update: unknown action {other:?}")),
    };
    if domain.is_empty() || node_id.is_empty() {
        return Err("dropped moc update: missing domain or node id".to_string());
    }
    Ok(MocUpdate {
        domain,
        node_id,
        action,
    })
}

fn parse_node_update(attrs: &[(String, String)], value: String) -> Result<NodeFieldUpdate, String> {
    let target_id = attr(attrs, "targetid")
        .or_else(|| attr(attrs, "target-id"))
        .unwrap_or_default()
        .to_string();
    if target_id.is_empty() {
        return Err("dropped node update: missing targetId".to_string());
    }
    let field_raw = attr(attrs, "field").unwrap_or_default();
    let Some(field) = UpdateField::parse(field_raw) else {
        return Err(format!("dropped node update on {target_id}: unknown field {field_raw:?}"));
    };
    let action_raw = attr(attrs, "action").unwrap_or("set");
    let Some(action) = UpdateAction::parse(action_raw) else {
        return Err(format!(
            "dropped node update on {target_id}: unknown action {action_raw:?}"
        ));
    };
    if !field.allows(action) {
        return Err(format!(
            "dropped node update on {target_id}: {field:?} does not support {action:?}"
        ));
    }
    Ok(NodeFieldUpdate {
        target_id,
        field,
        action,
        value,
    })
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Structural invariants over a parsed output.
///
/// - no id may be both edited (written or field-updated) and archived;
/// - every reflection node id must live under `omg/reflection/`;
/// - reported usage must be non-negative.
pub fn validate_reflection(output: &ReflectionOutput, tokens_used: i64) -> Result<(), ReflectorError> {
    if tokens_used < 0 {
        return Err(ReflectorError::invariant(
            ReflectorInvariant::NegativeTokens,
            format!("tokensUsed = {tokens_used}"),
        ));
    }

    for node in &output.nodes {
        if !node.id.starts_with("omg/reflection/") {
            return Err(ReflectorError::invariant(
                ReflectorInvariant::IdMismatch,
                format!("reflection node id {:?} outside omg/reflection/", node.id),
            ));
        }
    }

    let archived: BTreeSet<&str> = output.archives.iter().map(String::as_str).collect();
    for node in &output.nodes {
        if archived.contains(node.id.as_str()) {
            return Err(ReflectorError::invariant(
                ReflectorInvariant::Overlap,
                format!("{} is both written and archived", node.id),
            ));
        }
    }
    for update in &output.node_updates {
        if archived.contains(update.target_id.as_str()) {
            return Err(ReflectorError::invariant(
                ReflectorInvariant::Overlap,
                format!("{} is both edited and archived", update.target_id),
            ));
        }
    }
    Ok(())
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn strip_fences(raw: &str) -> String {
    for captures in FENCE_RE.captures_iter(raw) {
        let inner = captures.get(1).map_or("", |m| m.as_str());
        if inner.contains('<') {
            return inner.to_string();
        }
    }
    raw.to_string()
}

fn parse_attributes(raw: &str) -> Vec<(String, String)> {
    ATTR_RE
        .captures_iter(raw)
        .map(|c| (c[1].to_lowercase(), decode_entities(&c[2])))
        .collect()
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

fn child_element(inner: &str, name: &str) -> Option<String> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = inner.find(&open)? + open.len();
    let end = inner[start..].find(&close)? + start;
    Some(decode_entities(&inner[start..end]).trim().to_string())
}

fn split_commas(raw: &str) -> Vec<String> {
    let mut items = Vec::new();
    for token in raw.split(',') {
        let token = token.trim().to_string();
        if !token.is_empty() && !items.contains(&token) {
            items.push(token);
        }
    }
    items
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"<reflection>
  <reflection-nodes>
    <node compression-level="1">
      <id>omg/reflection/health-2024</id>
      <description>Health patterns across the spring</description>
      <sources>omg/fact/sleep, omg/fact/running</sources>
      <tags>health, sleep, running, habits, spring, energy, routine, morning, recovery, progress</tags>
      <body>Sleep stabilised once morning runs became routine.</body>
    </node>
  </reflection-nodes>
  <archive-nodes>
    <node-id>omg/fact/outdated-sleep-schedule</node-id>
    <node-id>omg/fact/outdated-sleep-schedule</node-id>
  </archive-nodes>
  <moc-updates>
    <moc domain="health" nodeId="omg/reflection/health-2024" action="add"/>
  </moc-updates>
  <node-updates>
    <update targetId="omg/fact/running" field="priority" action="set">high</update>
    <update targetId="omg/fact/running" field="tags" action="add">endurance</update>
  </node-updates>
</reflection>"#;

    #[test]
    fn parses_all_four_sections() {
        let output = parse_reflection_response(RESPONSE);
        assert_eq!(output.nodes.len(), 1);
        assert_eq!(output.nodes[0].compression_level, CompressionLevel::Light);
        assert_eq!(output.nodes[0].sources.len(), 2);
        assert_eq!(output.nodes[0].tags.len(), 10);
        // Archive list deduplicated.
        assert_eq!(output.archives, vec!["omg/fact/outdated-sleep-schedule"]);
        assert_eq!(output.moc_updates.len(), 1);
        assert_eq!(output.node_updates.len(), 2);
        assert!(output.diagnostics.is_empty());
    }

    #[test]
    fn warns_on_sparse_tags_but_keeps_the_node() {
        let text = r#"<reflection><reflection-nodes>
<node><id>omg/reflection/x</id><description>d</description><tags>one, two</tags><body>b</body></node>
</reflection-nodes></reflection>"#;
        let output = parse_reflection_response(text);
        assert_eq!(output.nodes.len(), 1);
        assert!(output.diagnostics.iter().any(|d| d.contains("tags")));
    }

    #[test]
    fn drops_nodes_without_id_or_description() {
        let text = r#"<reflection><reflection-nodes>
<node><description>no id</description></node>
<node><id>omg/reflection/y</id></node>
</reflection-nodes></reflection>"#;
        let output = parse_reflection_response(text);
        assert!(output.nodes.is_empty());
        assert_eq!(output.diagnostics.len(), 2);
    }

    #[test]
    fn scalar_fields_reject_add_remove() {
        let text = r#"<reflection><node-updates>
<update targetId="omg/fact/a" field="description" action="add">nope</update>
<update targetId="omg/fact/a" field="description" action="set">fine</update>
<update targetId="omg/fact/a" field="priority" action="remove">nope</update>
</node-updates></reflection>"#;
        let output = parse_reflection_response(text);
        assert_eq!(output.node_updates.len(), 1);
        assert_eq!(output.node_updates[0].action, UpdateAction::Set);
        assert_eq!(output.diagnostics.len(), 2);
    }

    #[test]
    fn invalid_archive_ids_are_dropped() {
        let text = r#"<reflection><archive-nodes>
<node-id>not-a-node-id</node-id>
<node-id>omg/fact/real</node-id>
</archive-nodes></reflection>"#;
        let output = parse_reflection_response(text);
        assert_eq!(output.archives, vec!["omg/fact/real"]);
        assert_eq!(output.diagnostics.len(), 1);
    }

    #[test]
    fn garbage_never_panics() {
        for garbage in ["", "prose", "<reflection>", "<reflection><node></reflection>", "\u{0}"] {
            let output = parse_reflection_response(garbage);
            assert!(output.nodes.is_empty(), "garbage: {garbage:?}");
        }
    }

    #[test]
    fn fenced_responses_are_unwrapped() {
        let fenced = format!("```xml\n{RESPONSE}\n```");
        let output = parse_reflection_response(&fenced);
        assert_eq!(output.nodes.len(), 1);
    }

    #[test]
    fn overlap_between_edits_and_archives_is_an_invariant_error() {
        let mut output = parse_reflection_response(RESPONSE);
        output.archives.push("omg/fact/running".to_string());
        let err = validate_reflection(&output, 100).unwrap_err();
        match err {
            ReflectorError::Invariant { kind, .. } => {
                assert_eq!(kind, ReflectorInvariant::Overlap)
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn reflection_id_outside_namespace_is_an_invariant_error() {
        let text = r#"<reflection><reflection-nodes>
<node><id>omg/fact/not-a-reflection</id><description>d</description><body>b</body></node>
</reflection-nodes></reflection>"#;
        let output = parse_reflection_response(text);
        let err = validate_reflection(&output, 0).unwrap_err();
        match err {
            ReflectorError::Invariant { kind, .. } => {
                assert_eq!(kind, ReflectorInvariant::IdMismatch)
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn negative_usage_is_an_invariant_error() {
        let output = ReflectionOutput::default();
        let err = validate_reflection(&output, -1).unwrap_err();
        match err {
            ReflectorError::Invariant { kind, .. } => {
                assert_eq!(kind, ReflectorInvariant::NegativeTokens)
            }
            other => panic!("unexpected {other}"),
        }
        assert!(validate_reflection(&output, 0).is_ok());
    }
}
