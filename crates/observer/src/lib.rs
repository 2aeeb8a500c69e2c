pub mod error;
pub mod fingerprint;
pub mod guardrails;
pub mod merge;
pub mod parser;
pub mod pipeline;
pub mod session;

pub use error::{InvariantKind, ObserverError};
pub use fingerprint::{fingerprint_messages, jaccard, update_recent_fingerprints, SourceFingerprint};
pub use guardrails::{
    check_source_overlap, suppress_duplicate_candidates, OverlapCheck, OverlapDecision,
};
pub use merge::{body_adds_content, decide_merge, MergeDecision, SemanticSearch};
pub use parser::{parse_observation_response, ObservationAction, ObservationOp, ObservationOutput};
pub use pipeline::{
    run_observation, run_turn_end, JoinedPrompts, ObservationOutcome, ObservationPrompts,
    ObservationRequest,
};
pub use session::{SessionState, SessionStore, TriggerDecision};
