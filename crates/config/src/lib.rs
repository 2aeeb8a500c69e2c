use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialise failed: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ── Observation ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerMode {
    Threshold,
    EveryTurn,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationConfig {
    /// Minimum unobserved message tokens before a threshold-mode observation
    /// fires.  Values below 1000 are clamped up at load time.
    pub message_token_threshold: u64,
    pub trigger_mode: TriggerMode,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            message_token_threshold: 4000,
            trigger_mode: TriggerMode::Threshold,
        }
    }
}

// ── Reflection ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub enabled: bool,
    pub window_span_days: u32,
    pub max_nodes_per_cluster: usize,
    pub max_input_tokens_per_cluster: u64,
    pub enable_anchor_split: bool,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_span_days: 14,
            max_nodes_per_cluster: 30,
            max_input_tokens_per_cluster: 8000,
            enable_anchor_split: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    /// Observation tokens accumulated since the last reflection pass before
    /// a new pass is scheduled.
    pub observation_token_threshold: u64,
    /// Only nodes whose `updated` timestamp is at least this many days old
    /// are eligible for reflection.
    pub age_cutoff_days: u32,
    pub clustering: ClusteringConfig,
    /// Maximum compression level the progressive loop may escalate to (0–3).
    pub max_compression_level: u8,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            observation_token_threshold: 50_000,
            age_cutoff_days: 3,
            clustering: ClusteringConfig::default(),
            max_compression_level: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    /// Acceptance budget for reflection output, in estimated tokens.
    pub max_context_tokens: u64,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 4000,
        }
    }
}

// ── Guardrails ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub enabled: bool,
    /// Jaccard overlap with a recent fingerprint at or above which the whole
    /// turn is skipped.
    pub skip_overlap_threshold: f64,
    /// Overlap at or above which the overlapping region is truncated away.
    pub truncate_overlap_threshold: f64,
    /// Similarity score at or above which an extracted candidate is
    /// suppressed against recently written nodes.
    pub candidate_suppression_threshold: f64,
    /// Number of recent fingerprints retained per session (1–20).
    pub recent_window_size: usize,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            skip_overlap_threshold: 0.85,
            truncate_overlap_threshold: 0.60,
            candidate_suppression_threshold: 0.80,
            recent_window_size: 5,
        }
    }
}

// ── Semantic dedup ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticDedupConfig {
    pub enabled: bool,
    pub heuristic_prefilter_threshold: f64,
    /// LLM merge verdict acceptance threshold, 50–100.
    pub semantic_merge_threshold: u8,
    pub max_block_size: usize,
    pub max_blocks_per_run: usize,
    pub max_body_chars_per_node: usize,
    pub time_window_days: u32,
}

impl Default for SemanticDedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heuristic_prefilter_threshold: 0.35,
            semantic_merge_threshold: 80,
            max_block_size: 5,
            max_blocks_per_run: 10,
            max_body_chars_per_node: 800,
            time_window_days: 30,
        }
    }
}

// ── Merge scoring ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Lexical neighbours considered per candidate.
    pub local_top_m: usize,
    /// Semantic (host search) neighbours considered per candidate.
    pub semantic_top_s: usize,
    /// Combined neighbours scored per candidate.
    pub final_top_k: usize,
    pub local_weight: f64,
    pub semantic_weight: f64,
    /// Combined similarity at or above which a candidate merges into its
    /// neighbour instead of becoming a new node.
    pub merge_threshold: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            local_top_m: 8,
            semantic_top_s: 5,
            final_top_k: 5,
            local_weight: 0.6,
            semantic_weight: 0.4,
            merge_threshold: 0.75,
        }
    }
}

// ── Bootstrap ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSourcesConfig {
    /// Ingest markdown memory files from the workspace tree.
    pub workspace_memory: bool,
    /// Ingest historical session chunks supplied by the host.
    pub host_sessions: bool,
    /// Ingest host log chunks supplied by the host.
    pub host_logs: bool,
}

impl Default for BootstrapSourcesConfig {
    fn default() -> Self {
        Self {
            workspace_memory: true,
            host_sessions: true,
            host_logs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub sources: BootstrapSourcesConfig,
    /// Concatenated character budget per batch; 0 disables packing (one
    /// chunk per batch).
    pub batch_char_budget: usize,
    /// Maximum batches processed per tick.
    pub batch_budget_per_run: usize,
    /// Cron expression the host uses to schedule ticks.  Opaque to the core.
    pub cron_schedule: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            sources: BootstrapSourcesConfig::default(),
            batch_char_budget: 24_000,
            batch_budget_per_run: 10,
            cron_schedule: "0 4 * * *".to_string(),
        }
    }
}

// ── Metrics ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Append pipeline metrics to `.metrics.jsonl` under the graph root.
    pub file_output: bool,
}

// ── Top-level config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OmgConfig {
    /// Graph root, relative to the workspace, forward slashes only.
    pub storage_path: String,
    pub observation: ObservationConfig,
    pub reflection: ReflectionConfig,
    pub injection: InjectionConfig,
    pub extraction_guardrails: GuardrailConfig,
    pub semantic_dedup: SemanticDedupConfig,
    pub merge: MergeConfig,
    pub bootstrap: BootstrapConfig,
    pub metrics: MetricsConfig,
}

impl Default for OmgConfig {
    fn default() -> Self {
        Self {
            storage_path: "memory/omg".to_string(),
            observation: ObservationConfig::default(),
            reflection: ReflectionConfig::default(),
            injection: InjectionConfig::default(),
            extraction_guardrails: GuardrailConfig::default(),
            semantic_dedup: SemanticDedupConfig::default(),
            merge: MergeConfig::default(),
            bootstrap: BootstrapConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl OmgConfig {
    /// Load from a TOML file, falling back to defaults when the file is
    /// absent.  The loaded value is validated and clamped before return.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.validate()?;
        config.clamp();
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Apply clamping floors that are tolerated rather than rejected.
    pub fn clamp(&mut self) {
        if self.observation.message_token_threshold < 1000 {
            self.observation.message_token_threshold = 1000;
        }
        if self.reflection.max_compression_level > 3 {
            self.reflection.max_compression_level = 3;
        }
    }

    /// Collect every out-of-range field as a path-qualified message.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let c = &self.reflection.clustering;
        if !(1..=30).contains(&c.window_span_days) {
            errors.push(format!(
                "reflection.clustering.window_span_days: {} outside 1..=30",
                c.window_span_days
            ));
        }
        if !(5..=100).contains(&c.max_nodes_per_cluster) {
            errors.push(format!(
                "reflection.clustering.max_nodes_per_cluster: {} outside 5..=100",
                c.max_nodes_per_cluster
            ));
        }
        if !(1000..=20_000).contains(&c.max_input_tokens_per_cluster) {
            errors.push(format!(
                "reflection.clustering.max_input_tokens_per_cluster: {} outside 1000..=20000",
                c.max_input_tokens_per_cluster
            ));
        }

        let g = &self.extraction_guardrails;
        if !(1..=20).contains(&g.recent_window_size) {
            errors.push(format!(
                "extraction_guardrails.recent_window_size: {} outside 1..=20",
                g.recent_window_size
            ));
        }
        for (name, value) in [
            ("skip_overlap_threshold", g.skip_overlap_threshold),
            ("truncate_overlap_threshold", g.truncate_overlap_threshold),
            (
                "candidate_suppression_threshold",
                g.candidate_suppression_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!(
                    "extraction_guardrails.{name}: {value} outside 0.0..=1.0"
                ));
            }
        }
        if g.truncate_overlap_threshold > g.skip_overlap_threshold {
            errors.push(format!(
                "extraction_guardrails.truncate_overlap_threshold: {} exceeds skip_overlap_threshold {}",
                g.truncate_overlap_threshold, g.skip_overlap_threshold
            ));
        }

        let d = &self.semantic_dedup;
        if !(50..=100).contains(&d.semantic_merge_threshold) {
            errors.push(format!(
                "semantic_dedup.semantic_merge_threshold: {} outside 50..=100",
                d.semantic_merge_threshold
            ));
        }
        if !(2..=10).contains(&d.max_block_size) {
            errors.push(format!(
                "semantic_dedup.max_block_size: {} outside 2..=10",
                d.max_block_size
            ));
        }
        if !(1..=50).contains(&d.max_blocks_per_run) {
            errors.push(format!(
                "semantic_dedup.max_blocks_per_run: {} outside 1..=50",
                d.max_blocks_per_run
            ));
        }
        if !(100..=2000).contains(&d.max_body_chars_per_node) {
            errors.push(format!(
                "semantic_dedup.max_body_chars_per_node: {} outside 100..=2000",
                d.max_body_chars_per_node
            ));
        }
        if !(1..=90).contains(&d.time_window_days) {
            errors.push(format!(
                "semantic_dedup.time_window_days: {} outside 1..=90",
                d.time_window_days
            ));
        }

        let m = &self.merge;
        if m.local_weight < 0.0 || m.semantic_weight < 0.0 {
            errors.push(format!(
                "merge.local_weight/semantic_weight: {}/{} must be non-negative",
                m.local_weight, m.semantic_weight
            ));
        }
        if m.local_weight + m.semantic_weight > 1.0 + f64::EPSILON {
            errors.push(format!(
                "merge.local_weight + merge.semantic_weight: {} exceeds 1.0",
                m.local_weight + m.semantic_weight
            ));
        }
        if !(0.0..=1.0).contains(&m.merge_threshold) {
            errors.push(format!(
                "merge.merge_threshold: {} outside 0.0..=1.0",
                m.merge_threshold
            ));
        }

        errors.extend(validate_storage_path(&self.storage_path));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// The storage path must stay inside the workspace: relative, forward
/// slashes, no traversal segments.
fn validate_storage_path(path: &str) -> Vec<String> {
    let mut errors = Vec::new();
    if path.is_empty() {
        errors.push("storage_path: must not be empty".to_string());
        return errors;
    }
    if path.starts_with('/') || path.contains(':') {
        errors.push(format!("storage_path: {path:?} must be relative"));
    }
    if path.contains('\\') {
        errors.push(format!("storage_path: {path:?} must use forward slashes"));
    }
    if path.split('/').any(|seg| seg == ".." || seg == ".") {
        errors.push(format!(
            "storage_path: {path:?} must not contain traversal segments"
        ));
    }
    errors
}

// ── Tests ─────────────────────────────────────────────────────────────────────
