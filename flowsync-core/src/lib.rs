//! # flowsync-core: Shared workflow document
//!
//! CRDT document for a multi-graph workflow editor. Any number of replicas
//! apply local [`Mutation`]s, exchange the resulting deltas in any order (with
//! duplicates) and converge to the same [`WorkflowSnapshot`].
//!
//! ## Merge rules
//!
//! | Data | Rule |
//! |------|------|
//! | Node position / metadata, group fields, graph flags, workflow metadata | last-writer-wins by `(timestamp, actor id)` |
//! | Nodes, groups, graphs | add/remove set of elements; re-adding an id creates a new element |
//! | Connections | immutable add/remove set |
//! | Group membership | add-wins set per `(group, node)` pair |
//!
//! References between entities (connection endpoints, group members, node
//! group back-references) are soft: snapshots filter ids that no longer
//! exist.

pub mod clock;
pub mod delta;
pub mod document;
pub mod error;
pub mod model;
pub mod mutation;
pub mod register;

pub use clock::LogicalClock;
pub use document::{LocalChange, WorkflowDocument};
pub use error::DocumentError;
pub use model::{
    new_id, Connection, Endpoint, GraphSnapshot, Group, Node, NodeMetadata, Position, Size,
    WorkflowMetadata, WorkflowSnapshot, DEFAULT_GROUP_COLOR, MAIN_GRAPH_ID,
};
pub use mutation::Mutation;
