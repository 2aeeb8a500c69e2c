use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("graph error: {0}")]
    Graph(#[from] omg_graph::GraphError),

    #[error("observation failed: {0}")]
    Observer(#[from] omg_observer::ObserverError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bootstrap state unusable: {0}")]
    State(String),
}

impl BootstrapError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
