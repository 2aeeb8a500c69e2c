use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("slug is empty after normalisation: {input:?}")]
    EmptySlug { input: String },

    #[error("invalid canonical key: {key:?}")]
    InvalidCanonicalKey { key: String },

    #[error("no free collision suffix for {path} (2..=99 exhausted)")]
    CollisionSuffixExhausted { path: PathBuf },

    #[error("node not found: {id}")]
    NodeNotFound { id: String },

    #[error("registry serialise failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl GraphError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the underlying cause is a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        ) || matches!(self, Self::NodeNotFound { .. })
    }
}
