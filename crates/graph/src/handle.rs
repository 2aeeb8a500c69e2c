//! Process-wide state, owned explicitly.
//!
//! The handle owns one registry per graph root and a keyed mutex table used
//! to serialise concurrent turns on the same session.  Anything that would
//! otherwise live in module-scope statics lives here and is injected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::registry::Registry;
use crate::store::GraphStore;

#[derive(Default)]
pub struct CoreHandle {
    registries: Mutex<HashMap<PathBuf, Arc<Registry>>>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Graph roots with a reflection pass currently in flight.
    reflections_in_flight: Mutex<HashMap<PathBuf, ()>>,
}

impl CoreHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry for `graph_root`, shared across every caller in this
    /// process.  One registry per root keeps its mutex meaningful.
    pub async fn registry(&self, graph_root: &Path) -> Arc<Registry> {
        let mut registries = self.registries.lock().await;
        registries
            .entry(graph_root.to_path_buf())
            .or_insert_with(|| Arc::new(Registry::new(graph_root)))
            .clone()
    }

    /// A store bound to the shared registry for `graph_root`.
    pub async fn store(&self, graph_root: &Path) -> GraphStore {
        let registry = self.registry(graph_root).await;
        GraphStore::new(graph_root, registry)
    }

    /// Per-session mutex: concurrent turns with the same key serialise.
    pub async fn session_lock(&self, session_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Mark a reflection pass as started for `graph_root`.  Returns `false`
    /// when one is already running there.
    pub async fn begin_reflection(&self, graph_root: &Path) -> bool {
        let mut in_flight = self.reflections_in_flight.lock().await;
        if in_flight.contains_key(graph_root) {
            return false;
        }
        in_flight.insert(graph_root.to_path_buf(), ());
        true
    }

    pub async fn end_reflection(&self, graph_root: &Path) {
        self.reflections_in_flight.lock().await.remove(graph_root);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn same_root_yields_the_same_registry() {
        let handle = CoreHandle::new();
        let root = std::env::temp_dir().join(format!("omg-handle-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();

        let a = handle.registry(&root).await;
        let b = handle.registry(&root).await;
        assert!(Arc::ptr_eq(&a, &b));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn session_locks_serialise_same_key() {
        let handle = CoreHandle::new();
        let lock = handle.session_lock("sess-1").await;
        let guard = lock.lock().await;

        let same = handle.session_lock("sess-1").await;
        assert!(same.try_lock().is_err(), "same key must contend");

        let other = handle.session_lock("sess-2").await;
        assert!(other.try_lock().is_ok(), "different key must not contend");
        drop(guard);
    }

    #[tokio::test]
    async fn reflection_flag_is_exclusive_per_root() {
        let handle = CoreHandle::new();
        let root = std::env::temp_dir().join("omg-handle-reflect");
        assert!(handle.begin_reflection(&root).await);
        assert!(!handle.begin_reflection(&root).await);
        handle.end_reflection(&root).await;
        assert!(handle.begin_reflection(&root).await);
        handle.end_reflection(&root).await;
    }
}
