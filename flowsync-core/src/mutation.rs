use serde::{Deserialize, Serialize};

use crate::model::{Connection, Group, Node, NodeMetadata, Position, Size};

/// A structural change to a workflow document.
///
/// Every mutation is validated against the current state before any write,
/// then applied in a single transaction that yields one delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Mutation {
    CreateGraph {
        graph_id: String,
        name: String,
        namespace: String,
        #[serde(default)]
        is_main: bool,
    },
    UpdateGraph {
        graph_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        namespace: Option<String>,
    },
    SetMainGraph {
        graph_id: String,
    },
    RemoveGraph {
        graph_id: String,
    },
    UpdateMetadata {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        active_graph_id: Option<String>,
        #[serde(default)]
        is_draft: Option<bool>,
        #[serde(default)]
        is_published: Option<bool>,
    },
    AddNode {
        graph_id: String,
        node: Node,
    },
    UpdateNode {
        graph_id: String,
        node_id: String,
        #[serde(default)]
        position: Option<Position>,
        #[serde(default)]
        metadata: Option<NodeMetadata>,
    },
    RemoveNode {
        graph_id: String,
        node_id: String,
    },
    AddConnection {
        graph_id: String,
        connection: Connection,
    },
    RemoveConnection {
        graph_id: String,
        connection_id: String,
    },
    CreateGroup {
        graph_id: String,
        group: Group,
    },
    UpdateGroup {
        graph_id: String,
        group_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        color: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        position: Option<Position>,
        #[serde(default)]
        size: Option<Size>,
        #[serde(default)]
        collapsed: Option<bool>,
        /// Replacement member set, diffed against the current one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_ids: Option<Vec<String>>,
    },
    RemoveGroup {
        graph_id: String,
        group_id: String,
    },
    AddGroupMember {
        graph_id: String,
        group_id: String,
        node_id: String,
    },
    RemoveGroupMember {
        graph_id: String,
        group_id: String,
        node_id: String,
    },
}

impl Mutation {
    /// Graph the mutation targets, if it is graph-scoped.
    pub fn graph_id(&self) -> Option<&str> {
        match self {
            Mutation::UpdateMetadata { .. } => None,
            Mutation::CreateGraph { graph_id, .. }
            | Mutation::UpdateGraph { graph_id, .. }
            | Mutation::SetMainGraph { graph_id }
            | Mutation::RemoveGraph { graph_id }
            | Mutation::AddNode { graph_id, .. }
            | Mutation::UpdateNode { graph_id, .. }
            | Mutation::RemoveNode { graph_id, .. }
            | Mutation::AddConnection { graph_id, .. }
            | Mutation::RemoveConnection { graph_id, .. }
            | Mutation::CreateGroup { graph_id, .. }
            | Mutation::UpdateGroup { graph_id, .. }
            | Mutation::RemoveGroup { graph_id, .. }
            | Mutation::AddGroupMember { graph_id, .. }
            | Mutation::RemoveGroupMember { graph_id, .. } => Some(graph_id.as_str()),
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::CreateGraph { .. } => "createGraph",
            Mutation::UpdateGraph { .. } => "updateGraph",
            Mutation::SetMainGraph { .. } => "setMainGraph",
            Mutation::RemoveGraph { .. } => "removeGraph",
            Mutation::UpdateMetadata { .. } => "updateMetadata",
            Mutation::AddNode { .. } => "addNode",
            Mutation::UpdateNode { .. } => "updateNode",
            Mutation::RemoveNode { .. } => "removeNode",
            Mutation::AddConnection { .. } => "addConnection",
            Mutation::RemoveConnection { .. } => "removeConnection",
            Mutation::CreateGroup { .. } => "createGroup",
            Mutation::UpdateGroup { .. } => "updateGroup",
            Mutation::RemoveGroup { .. } => "removeGroup",
            Mutation::AddGroupMember { .. } => "addGroupMember",
            Mutation::RemoveGroupMember { .. } => "removeGroupMember",
        }
    }
}
