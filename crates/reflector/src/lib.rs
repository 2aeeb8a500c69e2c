pub mod apply;
pub mod cluster;
pub mod dedup;
pub mod error;
pub mod packet;
pub mod parser;
pub mod pipeline;

pub use apply::{apply_reflection, ApplyReport};
pub use cluster::{assign_domain, cluster_domain, eligible_entries, Cluster};
pub use dedup::{run_semantic_dedup, DedupReport};
pub use error::{ReflectorError, ReflectorInvariant};
pub use packet::{build_packet, render_packets, CompactPacket};
pub use parser::{
    parse_reflection_response, validate_reflection, NodeFieldUpdate, ReflectionNodeOut,
    ReflectionOutput, UpdateAction, UpdateField,
};
pub use pipeline::{run_reflection, DefaultReflectionPrompts, ReflectionPrompts, ReflectionReport};
