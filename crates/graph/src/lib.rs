pub mod error;
pub mod frontmatter;
pub mod fsio;
pub mod handle;
pub mod ids;
pub mod metrics;
pub mod moc;
pub mod node;
pub mod registry;
pub mod store;

pub use error::GraphError;
pub use handle::CoreHandle;
pub use ids::{
    canonical_key_is_valid, key_slug, node_id, node_rel_path, regenerate_canonical_key, slugify,
    uid,
};
pub use metrics::{sink_for, JsonlSink, MetricEvent, MetricsSink, NullSink};
pub use moc::{moc_id, moc_rel_path, parse_moc_members, MocAction, MocUpdate};
pub use node::{
    CompressionLevel, Node, NodeHeader, NodeType, Priority, SourceRef,
};
pub use registry::{Registry, RegistryEntry, RegistryPatch, RegistryStats};
pub use store::{ClusteredReflection, GraphStore, NodeDraft, WriteContext};
