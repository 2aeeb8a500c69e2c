//! Crash-safe bootstrap state (v2) plus the legacy sentinel migration.
//!
//! State is persisted after every batch attempt, not only on success, so a
//! crash never loses more than the in-flight batch.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use omg_graph::fsio::{atomic_write_creating, read_optional};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BootstrapError;

pub const STATE_FILE: &str = ".bootstrap-state.json";
pub const LEGACY_SENTINEL: &str = ".bootstrap-done";
pub const STATE_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapState {
    pub version: u32,
    pub status: BootstrapStatus,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    /// Next batch index a fresh scan would start from: `1 + max(done)`.
    pub cursor: usize,
    pub total: usize,
    pub ok: usize,
    pub fail: usize,
    pub done: BTreeSet<usize>,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<String>,
    #[serde(rename = "maintenanceDone", default)]
    pub maintenance_done: bool,
}

impl BootstrapState {
    pub fn fresh(total: usize, now: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION,
            status: BootstrapStatus::Running,
            started_at: now,
            updated_at: now,
            cursor: 0,
            total,
            ok: 0,
            fail: 0,
            done: BTreeSet::new(),
            last_error: None,
            maintenance_done: false,
        }
    }

    /// Record a finished batch and restore the cursor invariant.
    pub fn record_done(&mut self, index: usize, now: DateTime<Utc>) {
        self.done.insert(index);
        self.ok += 1;
        self.sync_cursor();
        self.updated_at = now;
    }

    pub fn record_fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.fail += 1;
        self.last_error = Some(error.into());
        self.updated_at = now;
    }

    /// `cursor = 1 + max(done)`, 0 when nothing is done.  The cursor never
    /// rewinds even if `done` was trimmed externally.
    pub fn sync_cursor(&mut self) {
        let next = self.done.iter().next_back().map(|i| i + 1).unwrap_or(0);
        self.cursor = self.cursor.max(next);
    }

    pub fn all_accounted(&self) -> bool {
        self.ok + self.fail >= self.total
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.done.len())
    }
}

// ── Persistence ───────────────────────────────────────────────────────────────

pub fn state_path(graph_root: &Path) -> PathBuf {
    graph_root.join(STATE_FILE)
}

/// Load v2 state, migrating the legacy sentinel in place when present.
/// Returns `None` on a fresh graph.
pub fn load_state(
    graph_root: &Path,
    now: DateTime<Utc>,
) -> Result<Option<BootstrapState>, BootstrapError> {
    let path = state_path(graph_root);
    if let Some(raw) = read_optional(&path)? {
        match serde_json::from_str::<BootstrapState>(&raw) {
            Ok(mut state) => {
                if state.version != STATE_VERSION {
                    warn!(version = state.version, "unexpected state version — upgrading in place");
                    state.version = STATE_VERSION;
                }
                state.sync_cursor();
                return Ok(Some(state));
            }
            Err(err) => {
                warn!(error = %err, "bootstrap state unparseable — starting over");
                return Ok(None);
            }
        }
    }

    // Pre-v2 installs marked completion with a bare sentinel file.
    let sentinel = graph_root.join(LEGACY_SENTINEL);
    if sentinel.exists() {
        info!("migrating legacy bootstrap sentinel to v2 state");
        let state = BootstrapState {
            status: BootstrapStatus::Completed,
            ok: 1,
            total: 1,
            maintenance_done: true,
            ..BootstrapState::fresh(1, now)
        };
        save_state(graph_root, &state)?;
        let _ = std::fs::remove_file(&sentinel);
        return Ok(Some(state));
    }

    Ok(None)
}

pub fn save_state(graph_root: &Path, state: &BootstrapState) -> Result<(), BootstrapError> {
    let rendered = serde_json::to_string_pretty(state)
        .map_err(|e| BootstrapError::State(e.to_string()))?;
    atomic_write_creating(&state_path(graph_root), &rendered)?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
