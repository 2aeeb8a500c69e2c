use thiserror::Error;

/// Machine-readable tags for invariant violations, matched by callers that
/// log-and-replace rather than propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantKind {
    Overlap,
    IdMismatch,
    NegativeTokens,
    SessionStateNegative,
    SessionStateDecreasingTotal,
}

impl InvariantKind {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Overlap => "overlap",
            Self::IdMismatch => "id-mismatch",
            Self::NegativeTokens => "negative-tokens",
            Self::SessionStateNegative => "session-state-negative",
            Self::SessionStateDecreasingTotal => "session-state-decreasing-total",
        }
    }
}

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("graph error: {0}")]
    Graph(#[from] omg_graph::GraphError),

    #[error("model call failed: {0}")]
    Llm(#[from] omg_llm::LlmError),

    #[error("session state unreadable: {0}")]
    SessionState(String),

    #[error("invariant violated [{}]: {message}", kind.tag())]
    Invariant {
        kind: InvariantKind,
        message: String,
    },
}

impl ObserverError {
    pub fn invariant(kind: InvariantKind, message: impl Into<String>) -> Self {
        Self::Invariant {
            kind,
            message: message.into(),
        }
    }
}
