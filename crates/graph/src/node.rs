//! Node schema: the typed view of one knowledge file.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Node type ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Identity,
    Preference,
    Project,
    Decision,
    Fact,
    Episode,
    Reflection,
    Moc,
    Index,
    Now,
}

impl NodeType {
    pub fn slug(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Preference => "preference",
            Self::Project => "project",
            Self::Decision => "decision",
            Self::Fact => "fact",
            Self::Episode => "episode",
            Self::Reflection => "reflection",
            Self::Moc => "moc",
            Self::Index => "index",
            Self::Now => "now",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "identity" => Some(Self::Identity),
            "preference" => Some(Self::Preference),
            "project" => Some(Self::Project),
            "decision" => Some(Self::Decision),
            "fact" => Some(Self::Fact),
            "episode" => Some(Self::Episode),
            "reflection" => Some(Self::Reflection),
            "moc" => Some(Self::Moc),
            "index" => Some(Self::Index),
            "now" => Some(Self::Now),
            _ => None,
        }
    }

    /// Lenient variant used at parse boundaries: case-folds and maps the
    /// plural/variant spellings models emit back onto the canonical set.
    pub fn parse_lenient(s: &str) -> Option<Self> {
        let lower = s.trim().to_lowercase();
        let singular = match lower.as_str() {
            "identities" => "identity",
            "preferences" | "pref" | "prefs" => "preference",
            "projects" => "project",
            "decisions" => "decision",
            "facts" => "fact",
            "episodes" | "episodic" => "episode",
            "reflections" => "reflection",
            "mocs" => "moc",
            other => other,
        };
        Self::parse(singular)
    }

    /// Types that participate in observation/merge/reflection as content.
    /// The structural singletons are excluded.
    pub fn is_content(self) -> bool {
        !matches!(self, Self::Reflection | Self::Moc | Self::Index | Self::Now)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

// ── Priority ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" | "med" | "normal" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

// ── Compression level ─────────────────────────────────────────────────────────

/// How aggressively a reflection pass compressed its inputs.  Level 0
/// reorganises without shrinking; level 3 is bullet-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CompressionLevel {
    None,
    Light,
    Medium,
    Maximum,
}

impl CompressionLevel {
    pub const MAX: Self = Self::Maximum;

    pub fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Light => 1,
            Self::Medium => 2,
            Self::Maximum => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Light),
            2 => Some(Self::Medium),
            3 => Some(Self::Maximum),
            _ => None,
        }
    }

    pub fn next(self) -> Option<Self> {
        Self::from_u8(self.as_u8() + 1)
    }

    /// Approximate body retention the prompt directive asks for.
    pub fn retention_pct(self) -> u8 {
        match self {
            Self::None => 100,
            Self::Light => 70,
            Self::Medium => 50,
            Self::Maximum => 40,
        }
    }
}

impl From<CompressionLevel> for u8 {
    fn from(level: CompressionLevel) -> u8 {
        level.as_u8()
    }
}

impl TryFrom<u8> for CompressionLevel {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Self::from_u8(v).ok_or_else(|| format!("compression level {v} outside 0..=3"))
    }
}

// ── Provenance ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    pub kind: String,
    /// Unix milliseconds.
    pub timestamp: i64,
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Frontmatter fields in their canonical emission order.  serde_yaml emits
/// struct fields in declaration order, so reordering these changes the
/// on-disk format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeader {
    pub id: String,
    pub description: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub priority: Priority,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub uid: Option<String>,
    #[serde(
        rename = "canonicalKey",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub canonical_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub aliases: Option<Vec<String>>,
    #[serde(
        rename = "appliesTo",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub applies_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sources: Option<Vec<SourceRef>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub links: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub supersedes: Option<Vec<String>>,
    #[serde(
        rename = "compressionLevel",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub compression_level: Option<CompressionLevel>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub archived: Option<bool>,
    #[serde(
        rename = "mergedInto",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub merged_into: Option<String>,
}

impl NodeHeader {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        node_type: NodeType,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            node_type,
            priority,
            created: now,
            updated: now,
            uid: None,
            canonical_key: None,
            aliases: None,
            applies_to: None,
            sources: None,
            links: None,
            tags: None,
            supersedes: None,
            compression_level: None,
            archived: None,
            merged_into: None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived.unwrap_or(false)
    }

    /// Merge `alias` into the alias set, preserving first-seen order.
    pub fn add_alias(&mut self, alias: &str) -> bool {
        let aliases = self.aliases.get_or_insert_with(Vec::new);
        if aliases.iter().any(|a| a == alias) {
            return false;
        }
        aliases.push(alias.to_string());
        true
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

/// One knowledge file: parsed header, markdown body, and its on-disk home.
#[derive(Debug, Clone)]
pub struct Node {
    pub header: NodeHeader,
    pub body: String,
    /// Absolute path of the backing file.
    pub path: PathBuf,
}

impl Node {
    pub fn id(&self) -> &str {
        &self.header.id
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
