use thiserror::Error;

/// Classification of reflection-output invariant violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectorInvariant {
    /// A node id appears in both the edit set and the archive set.
    Overlap,
    /// A reflection node's declared id disagrees with its frontmatter id.
    IdMismatch,
    /// Reported token usage went negative.
    NegativeTokens,
}

impl ReflectorInvariant {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Overlap => "overlap",
            Self::IdMismatch => "id-mismatch",
            Self::NegativeTokens => "negative-tokens",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReflectorError {
    #[error("graph error: {0}")]
    Graph(#[from] omg_graph::GraphError),

    #[error("model call failed: {0}")]
    Llm(#[from] omg_llm::LlmError),

    #[error("reflection invariant violated [{}]: {message}", kind.tag())]
    Invariant {
        kind: ReflectorInvariant,
        message: String,
    },
}

impl ReflectorError {
    pub fn invariant(kind: ReflectorInvariant, message: impl Into<String>) -> Self {
        Self::Invariant {
            kind,
            message: message.into(),
        }
    }
}
