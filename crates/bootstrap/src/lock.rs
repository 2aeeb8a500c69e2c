//! Cross-process bootstrap lock.
//!
//! A JSON file naming the owning pid.  Liveness is checked with a signal-0
//! probe; a lock whose pid is dead is stolen with a log line.  The lock
//! marks *active processing*, not pause — every tick releases it on the way
//! out, pass or fail.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use omg_graph::fsio::{atomic_write_creating, read_optional};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BootstrapError;

pub const LOCK_FILE: &str = ".bootstrap-lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapLock {
    pub pid: u32,
    pub token: String,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

pub fn lock_path(graph_root: &Path) -> PathBuf {
    graph_root.join(LOCK_FILE)
}

/// Held while a tick runs.  Not RAII: release is an explicit step of the
/// tick so the "unconditionally delete at exit" rule is visible in the
/// executor, not hidden in a destructor.
pub struct LockGuard {
    path: PathBuf,
    token: String,
}

impl LockGuard {
    /// Refresh `updatedAt` at a batch boundary.
    pub fn heartbeat(&self, now: DateTime<Utc>) -> Result<(), BootstrapError> {
        let lock = BootstrapLock {
            pid: std::process::id(),
            token: self.token.clone(),
            started_at: now, // overwritten below when the old value is readable
            updated_at: now,
        };
        let lock = match read_optional(&self.path)? {
            Some(raw) => match serde_json::from_str::<BootstrapLock>(&raw) {
                Ok(existing) => BootstrapLock {
                    started_at: existing.started_at,
                    ..lock
                },
                Err(_) => lock,
            },
            None => lock,
        };
        write_lock(&self.path, &lock)
    }

    /// Delete the lock file, whatever state the tick ended in.
    pub fn release(self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %err, path = %self.path.display(), "lock release failed");
            }
        } else {
            debug!(path = %self.path.display(), "bootstrap lock released");
        }
    }
}

/// Try to take the lock.  `None` means another live process owns it.
pub fn claim(graph_root: &Path, now: DateTime<Utc>) -> Result<Option<LockGuard>, BootstrapError> {
    let path = lock_path(graph_root);

    if let Some(raw) = read_optional(&path)? {
        match serde_json::from_str::<BootstrapLock>(&raw) {
            Ok(existing) => {
                if pid_alive(existing.pid) {
                    debug!(owner = existing.pid, "bootstrap lock busy");
                    return Ok(None);
                }
                info!(
                    dead_pid = existing.pid,
                    age_secs = (now - existing.updated_at).num_seconds(),
                    "stealing bootstrap lock from dead process"
                );
            }
            Err(err) => {
                warn!(error = %err, "lock file unparseable — overwriting");
            }
        }
    }

    let token = Uuid::new_v4().to_string();
    let lock = BootstrapLock {
        pid: std::process::id(),
        token: token.clone(),
        started_at: now,
        updated_at: now,
    };
    write_lock(&path, &lock)?;
    Ok(Some(LockGuard { path, token }))
}

fn write_lock(path: &Path, lock: &BootstrapLock) -> Result<(), BootstrapError> {
    let rendered =
        serde_json::to_string_pretty(lock).map_err(|e| BootstrapError::State(e.to_string()))?;
    atomic_write_creating(path, &rendered)?;
    Ok(())
}

/// Signal-0 liveness probe.  EPERM means the pid exists under another user.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a probe, assume alive: never steal a lock we cannot verify.
#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("omg-lock-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn claim_writes_own_pid_and_release_deletes() {
        let root = scratch();
        let guard = claim(&root, Utc::now()).unwrap().expect("lock free");

        let raw = std::fs::read_to_string(lock_path(&root)).unwrap();
        let lock: BootstrapLock = serde_json::from_str(&raw).unwrap();
        assert_eq!(lock.pid, std::process::id());

        guard.release();
        assert!(!lock_path(&root).exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn live_owner_blocks_a_second_claim() {
        let root = scratch();
        // Our own pid is certainly alive.
        let guard = claim(&root, Utc::now()).unwrap().expect("lock free");
        assert!(claim(&root, Utc::now()).unwrap().is_none());
        guard.release();
        let _ = std::fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_lock_is_stolen() {
        let root = scratch();
        let stale = BootstrapLock {
            // Positive in pid_t but far past the kernel's pid_max.
            pid: 999_999_999,
            token: "stale".to_string(),
            started_at: Utc::now(),
            updated_at: Utc::now(),
        };
        write_lock(&lock_path(&root), &stale).unwrap();

        let guard = claim(&root, Utc::now()).unwrap();
        assert!(guard.is_some(), "dead owner must be stealable");
        guard.unwrap().release();
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn garbage_lock_file_is_overwritten() {
        let root = scratch();
        std::fs::write(lock_path(&root), "not json at all").unwrap();
        let guard = claim(&root, Utc::now()).unwrap();
        assert!(guard.is_some());
        guard.unwrap().release();
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn heartbeat_advances_updated_at_only() {
        let root = scratch();
        let start = Utc::now();
        let guard = claim(&root, start).unwrap().unwrap();

        let later = start + chrono::Duration::minutes(5);
        guard.heartbeat(later).unwrap();

        let raw = std::fs::read_to_string(lock_path(&root)).unwrap();
        let lock: BootstrapLock = serde_json::from_str(&raw).unwrap();
        assert_eq!(lock.updated_at, later);
        assert_eq!(lock.started_at, start);

        guard.release();
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn release_tolerates_an_already_missing_file() {
        let root = scratch();
        let guard = claim(&root, Utc::now()).unwrap().unwrap();
        std::fs::remove_file(lock_path(&root)).unwrap();
        guard.release(); // must not panic
        let _ = std::fs::remove_dir_all(root);
    }
}
