//! Per-session state: thresholds, watermarks, counters, fingerprints.
//!
//! One JSON document per `(workspace, sessionKey)` under
//! `<graph>/.sessions/`.  Load-modify-save; concurrent turns on the same
//! key are serialised by the caller through `CoreHandle::session_lock`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use omg_config::{ObservationConfig, ReflectionConfig, TriggerMode};
use omg_graph::fsio::{atomic_write_creating, read_optional};
use omg_llm::estimate_tokens;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{InvariantKind, ObserverError};
use crate::fingerprint::{update_recent_fingerprints, SourceFingerprint};

pub const SESSIONS_DIR: &str = ".sessions";

/// How many recently written node ids to keep for candidate suppression.
const RECENT_NODE_IDS_CAP: usize = 64;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    #[serde(rename = "lastObservedAtMs")]
    pub last_observed_at_ms: i64,
    #[serde(rename = "pendingMessageTokens")]
    pub pending_message_tokens: u64,
    #[serde(rename = "totalObservationTokens")]
    pub total_observation_tokens: u64,
    #[serde(rename = "lastReflectionTotalTokens")]
    pub last_reflection_total_tokens: u64,
    #[serde(rename = "observationBoundaryMessageIndex")]
    pub observation_boundary_message_index: usize,
    #[serde(rename = "nodeCount")]
    pub node_count: usize,
    #[serde(rename = "lastObservationNodeIds")]
    pub last_observation_node_ids: Vec<String>,
    #[serde(rename = "recentFingerprints")]
    pub recent_fingerprints: Vec<SourceFingerprint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Run the observation pipeline over the unobserved tail.
    Observe,
    /// Accumulate and wait for the threshold.
    Accumulate { pending_tokens: u64 },
    /// Manual mode: the host triggers explicitly.
    Manual,
}

impl SessionState {
    /// Estimated tokens in `messages[boundary..]`.
    pub fn unobserved_tokens(&self, messages: &[String]) -> u64 {
        messages
            .iter()
            .skip(self.observation_boundary_message_index)
            .map(|m| estimate_tokens(m))
            .sum()
    }

    /// Turn-end transition: decide whether observation fires.
    pub fn decide_trigger(
        &self,
        messages: &[String],
        config: &ObservationConfig,
    ) -> TriggerDecision {
        let new_tokens = self.unobserved_tokens(messages);
        match config.trigger_mode {
            TriggerMode::Manual => TriggerDecision::Manual,
            TriggerMode::EveryTurn => TriggerDecision::Observe,
            TriggerMode::Threshold => {
                let pending = self.pending_message_tokens + new_tokens;
                if pending >= config.message_token_threshold {
                    TriggerDecision::Observe
                } else {
                    TriggerDecision::Accumulate {
                        pending_tokens: pending,
                    }
                }
            }
        }
    }

    /// Commit a successful observation: boundary advances, pending resets,
    /// usage accrues monotonically, fingerprint and written ids recorded.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_observation(
        &mut self,
        message_count: usize,
        usage_tokens: u64,
        fingerprint: SourceFingerprint,
        window: usize,
        written_ids: Vec<String>,
        node_count: usize,
        now: DateTime<Utc>,
    ) -> Result<(), ObserverError> {
        if message_count < self.observation_boundary_message_index {
            return Err(ObserverError::invariant(
                InvariantKind::SessionStateNegative,
                format!(
                    "message count {message_count} behind boundary {}",
                    self.observation_boundary_message_index
                ),
            ));
        }
        let new_total = self
            .total_observation_tokens
            .checked_add(usage_tokens)
            .ok_or_else(|| {
                ObserverError::invariant(
                    InvariantKind::SessionStateDecreasingTotal,
                    "total observation tokens overflowed",
                )
            })?;
        debug_assert!(new_total >= self.total_observation_tokens);

        self.observation_boundary_message_index = message_count;
        self.pending_message_tokens = 0;
        self.total_observation_tokens = new_total;
        self.last_observed_at_ms = now.timestamp_millis();
        update_recent_fingerprints(&mut self.recent_fingerprints, fingerprint, window);

        if !written_ids.is_empty() {
            self.last_observation_node_ids = written_ids;
            if self.last_observation_node_ids.len() > RECENT_NODE_IDS_CAP {
                let excess = self.last_observation_node_ids.len() - RECENT_NODE_IDS_CAP;
                self.last_observation_node_ids.drain(..excess);
            }
        }
        self.node_count = node_count;
        Ok(())
    }

    /// A guardrail skip drops the messages on purpose: the boundary still
    /// advances so the same text is not re-counted next turn.
    pub fn apply_skip(
        &mut self,
        message_count: usize,
        fingerprint: SourceFingerprint,
        window: usize,
        now: DateTime<Utc>,
    ) {
        self.observation_boundary_message_index =
            self.observation_boundary_message_index.max(message_count);
        self.pending_message_tokens = 0;
        self.last_observed_at_ms = now.timestamp_millis();
        update_recent_fingerprints(&mut self.recent_fingerprints, fingerprint, window);
    }

    /// Accumulate pending tokens without observing.
    pub fn apply_accumulate(&mut self, pending_tokens: u64) {
        self.pending_message_tokens = pending_tokens;
    }

    pub fn reflection_due(&self, config: &ReflectionConfig) -> bool {
        self.total_observation_tokens
            .saturating_sub(self.last_reflection_total_tokens)
            >= config.observation_token_threshold
    }

    /// Advance the watermark after a reflection pass finished.  A failed
    /// pass must not call this, so the next threshold-crossing retries.
    pub fn advance_reflection_watermark(&mut self) {
        self.last_reflection_total_tokens = self.total_observation_tokens;
    }

    /// State-level invariants; violations carry their classification.
    pub fn check_invariants(&self) -> Result<(), ObserverError> {
        if self.last_reflection_total_tokens > self.total_observation_tokens {
            return Err(ObserverError::invariant(
                InvariantKind::SessionStateDecreasingTotal,
                format!(
                    "reflection watermark {} ahead of total {}",
                    self.last_reflection_total_tokens, self.total_observation_tokens
                ),
            ));
        }
        Ok(())
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionStore {
    graph_root: PathBuf,
}

impl SessionStore {
    pub fn new(graph_root: impl Into<PathBuf>) -> Self {
        Self {
            graph_root: graph_root.into(),
        }
    }

    pub fn state_path(&self, session_key: &str) -> PathBuf {
        let file = sanitize_session_key(session_key);
        self.graph_root.join(SESSIONS_DIR).join(format!("{file}.json"))
    }

    /// Load the session's state, starting fresh when absent.  A corrupt
    /// file is warned about and replaced with defaults rather than blocking
    /// every future turn.
    pub fn load(&self, session_key: &str) -> Result<SessionState, ObserverError> {
        let path = self.state_path(session_key);
        match read_optional(&path)? {
            None => Ok(SessionState::default()),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(state) => Ok(state),
                Err(err) => {
                    warn!(
                        session = session_key,
                        error = %err,
                        "session state unparseable — starting fresh"
                    );
                    Ok(SessionState::default())
                }
            },
        }
    }

    pub fn save(&self, session_key: &str, state: &SessionState) -> Result<(), ObserverError> {
        state.check_invariants()?;
        let path = self.state_path(session_key);
        let rendered = serde_json::to_string_pretty(state)
            .map_err(|e| ObserverError::SessionState(e.to_string()))?;
        atomic_write_creating(&path, &rendered)?;
        debug!(session = session_key, path = %path.display(), "session state saved");
        Ok(())
    }
}

fn sanitize_session_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

pub fn sessions_dir(graph_root: &Path) -> PathBuf {
    graph_root.join(SESSIONS_DIR)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
