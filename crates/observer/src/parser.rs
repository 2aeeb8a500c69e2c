//! Recovery-tolerant parsing of observation responses.
//!
//! Models wrap, rename, pluralise, fence, and entity-encode their output.
//! The parser's contract is strict about what it *returns* and forgiving
//! about what it *accepts*: any input yields a well-formed
//! [`ObservationOutput`]; records that cannot be salvaged are dropped with a
//! diagnostic, and total garbage yields an empty output.  It never panics
//! and never returns an error.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use omg_graph::{
    node_id, regenerate_canonical_key, canonical_key_is_valid, MocAction, MocUpdate, NodeType,
    Priority,
};

// ── Output types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationAction {
    Upsert,
    Create,
    Update,
    Supersede,
}

impl ObservationAction {
    fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "upsert" => Some(Self::Upsert),
            "create" | "new" => Some(Self::Create),
            "update" | "append" => Some(Self::Update),
            "supersede" | "replace" => Some(Self::Supersede),
            _ => None,
        }
    }

    pub fn requires_target(self) -> bool {
        matches!(self, Self::Update | Self::Supersede)
    }
}

#[derive(Debug, Clone)]
pub struct ObservationOp {
    pub action: ObservationAction,
    pub node_type: NodeType,
    pub id: String,
    pub canonical_key: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub body: String,
    pub links: Vec<String>,
    pub tags: Vec<String>,
    pub moc_hints: Vec<String>,
    pub target_id: Option<String>,
    /// Scope hint (`sessionScope` or `identityKey` form); recorded, not
    /// enforced.
    pub applies_to: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ObservationOutput {
    pub operations: Vec<ObservationOp>,
    pub now_update: Option<String>,
    pub moc_updates: Vec<MocUpdate>,
    /// One entry per dropped record or recovered anomaly.
    pub diagnostics: Vec<String>,
}

impl ObservationOutput {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.now_update.is_none() && self.moc_updates.is_empty()
    }
}

// ── Regexes ───────────────────────────────────────────────────────────────────

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[a-zA-Z]*\s*\n(.*?)```").expect("fence regex compiles")
});

static WRAPPER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(observations|operations|output|response)\b[^>]*>(.*?)</(observations|operations|output|response)>")
        .expect("wrapper regex compiles")
});

static OPERATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<operation\b([^>]*)>(.*?)</operation>").expect("operation regex compiles")
});

static NOW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<now-update\b[^>]*>(.*?)</now-update>").expect("now regex compiles")
});

static MOC_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<moc-updates\b[^>]*>(.*?)</moc-updates>").expect("moc block regex compiles")
});

static MOC_ENTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<moc\b([^>]*?)/?>").expect("moc entry regex compiles"));

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([\w-]+)\s*=\s*"([^"]*)""#).expect("attribute regex compiles")
});

// ── Entry point ───────────────────────────────────────────────────────────────

/// Parse a raw model response.  Infallible by contract.
pub fn parse_observation_response(raw: &str) -> ObservationOutput {
    let mut output = ObservationOutput::default();

    let unfenced = strip_fences(raw);
    let scope = match WRAPPER_RE.captures(&unfenced) {
        Some(captures) => captures.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        None if unfenced.contains("<operation") => {
            output
                .diagnostics
                .push("no wrapper element — scanning whole response".to_string());
            unfenced.clone()
        }
        None => {
            warn!("observation response contained no recognisable structure");
            output
                .diagnostics
                .push("no <observations> block and no <operation> elements".to_string());
            return output;
        }
    };

    for captures in OPERATION_RE.captures_iter(&scope) {
        let attrs = parse_attributes(captures.get(1).map_or("", |m| m.as_str()));
        let inner = captures.get(2).map_or("", |m| m.as_str());
        match parse_operation(&attrs, inner) {
            Ok(op) => output.operations.push(op),
            Err(reason) => output.diagnostics.push(reason),
        }
    }

    if let Some(captures) = NOW_RE.captures(&scope) {
        let content = decode_entities(captures.get(1).map_or("", |m| m.as_str())).trim().to_string();
        if !content.is_empty() {
            output.now_update = Some(content);
        }
    }

    if let Some(captures) = MOC_BLOCK_RE.captures(&scope) {
        let block = captures.get(1).map_or("", |m| m.as_str());
        for entry in MOC_ENTRY_RE.captures_iter(block) {
            let attrs = parse_attributes(entry.get(1).map_or("", |m| m.as_str()));
            match parse_moc_entry(&attrs) {
                Ok(update) => output.moc_updates.push(update),
                Err(reason) => output.diagnostics.push(reason),
            }
        }
    }

    if output.operations.is_empty() && output.now_update.is_none() && !output.diagnostics.is_empty()
    {
        warn!(
            diagnostics = output.diagnostics.len(),
            "observation parse salvaged nothing"
        );
    }
    output
}

// ── Pieces ────────────────────────────────────────────────────────────────────

/// If the payload is fenced, use the first fence whose contents hold the
/// structure; otherwise pass the text through untouched.
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
    attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// First `<name>…</name>` child of `inner`, entity-decoded and trimmed.
fn child_element(inner: &str, name: &str) -> Option<String> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = inner.find(&open)? + open.len();
    let end = inner[start..].find(&close)? + start;
    Some(decode_entities(&inner[start..end]).trim().to_string())
}

fn parse_operation(attrs: &[(String, String)], inner: &str) -> Result<ObservationOp, String> {
    let type_raw = attr(attrs, "type")
        .map(str::to_string)
        .or_else(|| child_element(inner, "type"))
        .unwrap_or_default();
    let Some(node_type) = NodeType::parse_lenient(&type_raw) else {
        return Err(format!("dropped operation: unknown type {type_raw:?}"));
    };
    if !node_type.is_content() {
        return Err(format!(
            "dropped operation: structural type {type_raw:?} cannot be extracted"
        ));
    }

    let action_raw = attr(attrs, "action").unwrap_or_default();
    let Some(action) = ObservationAction::parse_lenient(action_raw) else {
        return Err(format!("dropped operation: unknown action {action_raw:?}"));
    };

    let title = child_element(inner, "title").unwrap_or_default();
    let description = child_element(inner, "description").unwrap_or_default();
    if description.is_empty() {
        return Err(format!(
            "dropped {} operation: missing description",
            node_type.slug()
        ));
    }

    let canonical_key = match child_element(inner, "canonical-key")
        .filter(|k| !k.is_empty())
        .map(|k| k.to_lowercase())
    {
        Some(key) if canonical_key_is_valid(&key) => key,
        Some(bad) => {
            // Salvage an invalid key the same way an absent one is handled.
            match regenerate_from_title(node_type, &title, &description) {
                Some(key) => {
                    warn!(bad_key = %bad, regenerated = %key, "invalid canonical key replaced");
                    key
                }
                None => return Err(format!("dropped operation: unusable canonical key {bad:?}")),
            }
        }
        None => match regenerate_from_title(node_type, &title, &description) {
            Some(key) => key,
            None => {
                return Err(format!(
                    "dropped {} operation: no canonical key and no title to regenerate one",
                    node_type.slug()
                ));
            }
        },
    };

    let id = match child_element(inner, "id").filter(|v| !v.is_empty()) {
        Some(explicit) => explicit,
        None => node_id(node_type, &canonical_key)
            .map_err(|e| format!("dropped operation: id derivation failed ({e})"))?,
    };
    if id.is_empty() {
        return Err("dropped operation: empty id".to_string());
    }

    let target_id = child_element(inner, "target-id").filter(|v| !v.is_empty());
    if action.requires_target() && target_id.is_none() {
        return Err(format!(
            "dropped {:?} operation on {id}: missing target-id",
            action
        ));
    }

    let priority = child_element(inner, "priority")
        .and_then(|p| Priority::parse_lenient(&p))
        .unwrap_or_default();
    let body = child_element(inner, "body").unwrap_or_default();
    let links = child_element(inner, "links")
        .map(|raw| parse_wikilinks(&raw))
        .unwrap_or_default();
    let tags = child_element(inner, "tags")
        .map(|raw| split_commas(&raw))
        .unwrap_or_default();
    let moc_hints = child_element(inner, "moc")
        .or_else(|| child_element(inner, "moc-hints"))
        .map(|raw| split_commas(&raw))
        .unwrap_or_default();
    let applies_to = child_element(inner, "applies-to").filter(|v| !v.is_empty());

    Ok(ObservationOp {
        action,
        node_type,
        id,
        canonical_key,
        title,
        description,
        priority,
        body,
        links,
        tags,
        moc_hints,
        target_id,
        applies_to,
    })
}

fn regenerate_from_title(
    node_type: NodeType,
    title: &str,
    description: &str,
) -> Option<String> {
    let source = if title.is_empty() { description } else { title };
    regenerate_canonical_key(node_type, source).ok()
}

fn parse_moc_entry(attrs: &[(String, String)]) -> Result<MocUpdate, String> {
    let domain = attr(attrs, "domain").unwrap_or_default().to_string();
    let node_id = attr(attrs, "nodeid")
        .or_else(|| attr(attrs, "node-id"))
        .unwrap_or_default()
        .to_string();
    let action_raw = attr(attrs, "action").unwrap_or("add");
    let action = match action_raw.trim().to_lowercase().as_str() {
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

/// `[[id]]` tokens, whitespace-separated; bare ids pass through too.
pub fn parse_wikilinks(raw: &str) -> Vec<String> {
    let mut links = Vec::new();
    for token in raw.split_whitespace() {
        let id = token
            .trim_start_matches("[[")
            .trim_end_matches("]]")
            .trim()
            .to_string();
        if !id.is_empty() && !links.contains(&id) {
            links.push(id);
        }
    }
    links
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

/// The handful of entities models actually emit.
pub fn decode_entities(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
