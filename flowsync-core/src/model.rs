//! Materialized workflow data model.
//!
//! These are plain values read out of a [`crate::WorkflowDocument`]; the
//! CRDT state itself lives in yrs maps. Collections are ordered maps so two
//! converged replicas produce equal snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Well-known id of the graph every workflow starts with.
pub const MAIN_GRAPH_ID: &str = "main";

/// Generate a collision-resistant entity id, e.g. `node_4f1c...`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Default for Size {
    fn default() -> Self {
        Self {
            width: 400.0,
            height: 300.0,
        }
    }
}

/// Node metadata blob. Always written as a whole.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    #[serde(rename = "type")]
    pub node_type: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub property_values: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub position: Position,
    pub metadata: NodeMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub node_id: String,
    pub port_id: String,
}

impl Endpoint {
    pub fn new(node_id: impl Into<String>, port_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            port_id: port_id.into(),
        }
    }
}

/// Immutable edge between two node ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source: Endpoint,
    pub target: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub title: String,
    pub color: String,
    #[serde(default)]
    pub description: String,
    pub node_ids: Vec<String>,
    pub position: Position,
    pub size: Size,
    #[serde(default)]
    pub collapsed: bool,
}

pub const DEFAULT_GROUP_COLOR: &str = "#3b82f6";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub is_main: bool,
    pub nodes: BTreeMap<String, Node>,
    pub connections: BTreeMap<String, Connection>,
    pub groups: BTreeMap<String, Group>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_graph_id: Option<String>,
    pub is_draft: bool,
    pub is_published: bool,
}

impl Default for WorkflowMetadata {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            active_graph_id: None,
            is_draft: true,
            is_published: false,
        }
    }
}

/// Full serializable copy of a workflow document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    pub metadata: WorkflowMetadata,
    pub graphs: BTreeMap<String, GraphSnapshot>,
}

impl WorkflowSnapshot {
    pub fn graph(&self, graph_id: &str) -> Option<&GraphSnapshot> {
        self.graphs.get(graph_id)
    }

    pub fn node(&self, graph_id: &str, node_id: &str) -> Option<&Node> {
        self.graph(graph_id).and_then(|g| g.nodes.get(node_id))
    }

    pub fn group(&self, graph_id: &str, group_id: &str) -> Option<&Group> {
        self.graph(graph_id).and_then(|g| g.groups.get(group_id))
    }

    /// The main graph. When concurrent edits left more than one flagged,
    /// the smallest id wins so every replica picks the same one.
    pub fn main_graph(&self) -> Option<&GraphSnapshot> {
        self.graphs.values().find(|g| g.is_main)
    }
}
