//! Yrs-backed workflow document.
//!
//! Layout of the shared yrs state:
//! ```text
//! metadata (root map)      name@actor, description@actor, activeGraphId@actor, ...
//! graphs   (root map)
//!   └─ <graphId> (map)     name@actor, namespace@actor, isMain@actor
//!        ├─ nodes (map)
//!        │    └─ <nodeId> (map)      position@actor, metadata@actor, groupId@actor
//!        ├─ connections (map)
//!        │    └─ <connectionId>      JSON Connection (immutable)
//!        └─ groups (map)
//!             └─ <groupId> (map)     title@actor, color@actor, ..., members (map)
//!                                                                  └─ <nodeId> → true
//! ```
//!
//! Entities are nested maps keyed by id, so removing the key deletes the
//! element and re-inserting the id creates a fresh one. Scalar fields are
//! [`register`] entries. Group membership is a map of node id → `true`;
//! a concurrent add survives a remove that did not observe it.

use std::collections::BTreeSet;

use serde::Serialize;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Map, MapPrelim, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::clock::LogicalClock;
use crate::delta::check_update;
use crate::error::DocumentError;
use crate::model::{
    Connection, GraphSnapshot, Group, Node, NodeMetadata, Position, Size, WorkflowMetadata,
    WorkflowSnapshot, DEFAULT_GROUP_COLOR, MAIN_GRAPH_ID,
};
use crate::mutation::Mutation;
use crate::register::{self, out_str};

const ROOT_METADATA: &str = "metadata";
const ROOT_GRAPHS: &str = "graphs";
const NODES: &str = "nodes";
const CONNECTIONS: &str = "connections";
const GROUPS: &str = "groups";
const MEMBERS: &str = "members";

/// Result of applying a local mutation.
#[derive(Debug, Clone)]
pub struct LocalChange {
    /// Encoded update to hand to other replicas.
    pub delta: Vec<u8>,
    /// State summary after the change.
    pub state_summary: Vec<u8>,
}

/// Handles to the per-graph collections.
struct GraphRefs {
    root: MapRef,
    nodes: MapRef,
    connections: MapRef,
    groups: MapRef,
}

/// Stamps register writes for one mutation with a shared timestamp.
struct Stamper<'a> {
    actor: &'a str,
    ts: u64,
    issued: u64,
}

impl Stamper<'_> {
    fn set<V: Serialize>(
        &mut self,
        map: &MapRef,
        txn: &mut TransactionMut,
        field: &str,
        value: &V,
    ) -> Result<(), DocumentError> {
        let value = serde_json::to_value(value)?;
        let used = register::write(map, txn, field, self.actor, self.ts, value)?;
        self.issued = self.issued.max(used);
        Ok(())
    }
}

/// One replica of a workflow document.
pub struct WorkflowDocument {
    doc: yrs::Doc,
    actor: String,
    clock: LogicalClock,
    metadata: MapRef,
    graphs: MapRef,
}

impl WorkflowDocument {
    /// Create an empty replica for `actor`. Actor ids must be unique per
    /// replica; they break timestamp ties.
    pub fn new(actor: impl Into<String>) -> Self {
        Self::with_clock(actor, LogicalClock::hybrid())
    }

    pub fn with_clock(actor: impl Into<String>, clock: LogicalClock) -> Self {
        let doc = yrs::Doc::new();
        // Root types are resolved up front; fetching them later would need a
        // transaction while another may be open.
        let metadata = doc.get_or_insert_map(ROOT_METADATA);
        let graphs = doc.get_or_insert_map(ROOT_GRAPHS);
        Self {
            doc,
            actor: actor.into(),
            clock,
            metadata,
            graphs,
        }
    }

    /// Rebuild a replica from a full state encoding.
    pub fn from_state(actor: impl Into<String>, state: &[u8]) -> Result<Self, DocumentError> {
        let mut document = Self::new(actor);
        document.apply_remote(state)?;
        Ok(document)
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut LogicalClock {
        &mut self.clock
    }

    /// Create the well-known main graph. Only the authority replica does
    /// this, once, when a workflow is first created.
    pub fn seed_main_graph(&mut self) -> Result<LocalChange, DocumentError> {
        self.apply_local(&Mutation::CreateGraph {
            graph_id: MAIN_GRAPH_ID.to_string(),
            name: "Main".to_string(),
            namespace: MAIN_GRAPH_ID.to_string(),
            is_main: true,
        })
    }

    // ─── Local changes ───────────────────────────────────────────────

    /// Validate and apply a mutation, returning the delta to broadcast.
    ///
    /// Validation runs against a read transaction first; on error nothing is
    /// written.
    pub fn apply_local(&mut self, mutation: &Mutation) -> Result<LocalChange, DocumentError> {
        self.validate(mutation)?;

        let ts = self.clock.tick();
        let mut stamper = Stamper {
            actor: &self.actor,
            ts,
            issued: ts,
        };
        let delta = {
            let mut txn = self.doc.transact_mut();
            self.write(&mut txn, &mut stamper, mutation)?;
            txn.encode_update_v1()
        };
        let issued = stamper.issued;
        self.clock.observe(issued);

        log::trace!(
            "{} applied {} at ts {issued} ({} bytes)",
            self.actor,
            mutation.kind(),
            delta.len()
        );

        Ok(LocalChange {
            delta,
            state_summary: self.state_summary(),
        })
    }

    fn validate(&self, mutation: &Mutation) -> Result<(), DocumentError> {
        let txn = self.doc.transact();
        match mutation {
            Mutation::CreateGraph { graph_id, .. } => {
                if graph_id.is_empty() {
                    return Err(DocumentError::InvalidField("graph id is empty".into()));
                }
                if self.graph(&txn, graph_id).is_some() {
                    return Err(DocumentError::GraphExists(graph_id.clone()));
                }
            }
            Mutation::UpdateGraph { graph_id, .. } | Mutation::SetMainGraph { graph_id } => {
                self.require_graph(&txn, graph_id)?;
            }
            Mutation::RemoveGraph { graph_id } => {
                let graph = self.require_graph(&txn, graph_id)?;
                let is_main: bool = register::read(&graph.root, &txn, "isMain").unwrap_or(false);
                if is_main {
                    return Err(DocumentError::LastMainGraph(graph_id.clone()));
                }
            }
            Mutation::UpdateMetadata {
                active_graph_id, ..
            } => {
                if let Some(graph_id) = active_graph_id {
                    self.require_graph(&txn, graph_id)?;
                }
            }
            Mutation::AddNode { graph_id, node } => {
                let graph = self.require_graph(&txn, graph_id)?;
                if node.id.is_empty() {
                    return Err(DocumentError::InvalidField("node id is empty".into()));
                }
                if graph.nodes.contains_key(&txn, &node.id) {
                    return Err(DocumentError::NodeExists {
                        graph_id: graph_id.clone(),
                        node_id: node.id.clone(),
                    });
                }
                if let Some(group_id) = &node.group_id {
                    require_group(&graph, &txn, graph_id, group_id)?;
                }
            }
            Mutation::UpdateNode {
                graph_id, node_id, ..
            }
            | Mutation::RemoveNode { graph_id, node_id } => {
                let graph = self.require_graph(&txn, graph_id)?;
                require_node(&graph, &txn, graph_id, node_id)?;
            }
            Mutation::AddConnection {
                graph_id,
                connection,
            } => {
                let graph = self.require_graph(&txn, graph_id)?;
                if connection.id.is_empty() {
                    return Err(DocumentError::InvalidField("connection id is empty".into()));
                }
                if graph.connections.contains_key(&txn, &connection.id) {
                    return Err(DocumentError::ConnectionExists {
                        graph_id: graph_id.clone(),
                        connection_id: connection.id.clone(),
                    });
                }
                for endpoint in [&connection.source, &connection.target] {
                    if !graph.nodes.contains_key(&txn, &endpoint.node_id) {
                        return Err(DocumentError::MissingEndpoint {
                            graph_id: graph_id.clone(),
                            node_id: endpoint.node_id.clone(),
                        });
                    }
                }
            }
            Mutation::RemoveConnection {
                graph_id,
                connection_id,
            } => {
                let graph = self.require_graph(&txn, graph_id)?;
                if !graph.connections.contains_key(&txn, connection_id) {
                    return Err(DocumentError::ConnectionNotFound {
                        graph_id: graph_id.clone(),
                        connection_id: connection_id.clone(),
                    });
                }
            }
            Mutation::CreateGroup { graph_id, group } => {
                let graph = self.require_graph(&txn, graph_id)?;
                if group.id.is_empty() {
                    return Err(DocumentError::InvalidField("group id is empty".into()));
                }
                if graph.groups.contains_key(&txn, &group.id) {
                    return Err(DocumentError::GroupExists {
                        graph_id: graph_id.clone(),
                        group_id: group.id.clone(),
                    });
                }
                for node_id in &group.node_ids {
                    require_node(&graph, &txn, graph_id, node_id)?;
                }
            }
            Mutation::UpdateGroup {
                graph_id,
                group_id,
                node_ids,
                ..
            } => {
                let graph = self.require_graph(&txn, graph_id)?;
                require_group(&graph, &txn, graph_id, group_id)?;
                for node_id in node_ids.iter().flatten() {
                    require_node(&graph, &txn, graph_id, node_id)?;
                }
            }
            Mutation::RemoveGroup { graph_id, group_id }
            | Mutation::RemoveGroupMember {
                graph_id, group_id, ..
            } => {
                let graph = self.require_graph(&txn, graph_id)?;
                require_group(&graph, &txn, graph_id, group_id)?;
            }
            Mutation::AddGroupMember {
                graph_id,
                group_id,
                node_id,
            } => {
                let graph = self.require_graph(&txn, graph_id)?;
                require_group(&graph, &txn, graph_id, group_id)?;
                require_node(&graph, &txn, graph_id, node_id)?;
            }
        }
        Ok(())
    }

    fn write(
        &self,
        txn: &mut TransactionMut,
        stamper: &mut Stamper<'_>,
        mutation: &Mutation,
    ) -> Result<(), DocumentError> {
        match mutation {
            Mutation::CreateGraph {
                graph_id,
                name,
                namespace,
                is_main,
            } => {
                let others = self.graph_roots(txn);
                let root = self.graphs.insert(txn, graph_id.clone(), MapPrelim::default());
                root.insert(txn, NODES, MapPrelim::default());
                root.insert(txn, CONNECTIONS, MapPrelim::default());
                root.insert(txn, GROUPS, MapPrelim::default());
                stamper.set(&root, txn, "name", name)?;
                stamper.set(&root, txn, "namespace", namespace)?;
                stamper.set(&root, txn, "isMain", is_main)?;
                if *is_main {
                    for (_, other) in others {
                        stamper.set(&other, txn, "isMain", &false)?;
                    }
                }
            }
            Mutation::UpdateGraph {
                graph_id,
                name,
                namespace,
            } => {
                let graph = self.expect_graph(txn, graph_id)?;
                if let Some(name) = name {
                    stamper.set(&graph.root, txn, "name", name)?;
                }
                if let Some(namespace) = namespace {
                    stamper.set(&graph.root, txn, "namespace", namespace)?;
                }
            }
            Mutation::SetMainGraph { graph_id } => {
                for (id, root) in self.graph_roots(txn) {
                    stamper.set(&root, txn, "isMain", &(id == *graph_id))?;
                }
            }
            Mutation::RemoveGraph { graph_id } => {
                self.graphs.remove(txn, graph_id);
            }
            Mutation::UpdateMetadata {
                name,
                description,
                active_graph_id,
                is_draft,
                is_published,
            } => {
                let meta = &self.metadata;
                if let Some(v) = name {
                    stamper.set(meta, txn, "name", v)?;
                }
                if let Some(v) = description {
                    stamper.set(meta, txn, "description", v)?;
                }
                if let Some(v) = active_graph_id {
                    stamper.set(meta, txn, "activeGraphId", v)?;
                }
                if let Some(v) = is_draft {
                    stamper.set(meta, txn, "isDraft", v)?;
                }
                if let Some(v) = is_published {
                    stamper.set(meta, txn, "isPublished", v)?;
                }
            }
            Mutation::AddNode { graph_id, node } => {
                let graph = self.expect_graph(txn, graph_id)?;
                let element = graph.nodes.insert(txn, node.id.clone(), MapPrelim::default());
                stamper.set(&element, txn, "position", &node.position)?;
                stamper.set(&element, txn, "metadata", &node.metadata)?;
                if let Some(group_id) = &node.group_id {
                    join_group(&graph, txn, stamper, group_id, &node.id)?;
                }
            }
            Mutation::UpdateNode {
                graph_id,
                node_id,
                position,
                metadata,
            } => {
                let graph = self.expect_graph(txn, graph_id)?;
                let element = expect_nested(&graph.nodes, txn, node_id)?;
                if let Some(position) = position {
                    stamper.set(&element, txn, "position", position)?;
                }
                if let Some(metadata) = metadata {
                    stamper.set(&element, txn, "metadata", metadata)?;
                }
            }
            Mutation::RemoveNode { graph_id, node_id } => {
                let graph = self.expect_graph(txn, graph_id)?;
                graph.nodes.remove(txn, node_id);

                let attached: Vec<String> = graph
                    .connections
                    .iter(&*txn)
                    .filter_map(|(id, out)| {
                        let conn = parse_connection(&out)?;
                        let touches =
                            conn.source.node_id == *node_id || conn.target.node_id == *node_id;
                        touches.then(|| id.to_string())
                    })
                    .collect();
                for id in attached {
                    graph.connections.remove(txn, &id);
                }

                // Stale memberships would re-attach a later node with the same id.
                for (_, group) in nested_entries(&graph.groups, &*txn) {
                    if let Some(members) = nested(&group, &*txn, MEMBERS) {
                        members.remove(txn, node_id);
                    }
                }
            }
            Mutation::AddConnection {
                graph_id,
                connection,
            } => {
                let graph = self.expect_graph(txn, graph_id)?;
                let encoded = serde_json::to_string(connection)?;
                graph.connections.insert(txn, connection.id.clone(), encoded);
            }
            Mutation::RemoveConnection {
                graph_id,
                connection_id,
            } => {
                let graph = self.expect_graph(txn, graph_id)?;
                graph.connections.remove(txn, connection_id);
            }
            Mutation::CreateGroup { graph_id, group } => {
                let graph = self.expect_graph(txn, graph_id)?;
                let element = graph.groups.insert(txn, group.id.clone(), MapPrelim::default());
                element.insert(txn, MEMBERS, MapPrelim::default());
                stamper.set(&element, txn, "title", &group.title)?;
                stamper.set(&element, txn, "color", &group.color)?;
                stamper.set(&element, txn, "description", &group.description)?;
                stamper.set(&element, txn, "position", &group.position)?;
                stamper.set(&element, txn, "size", &group.size)?;
                stamper.set(&element, txn, "collapsed", &group.collapsed)?;
                for node_id in &group.node_ids {
                    join_group(&graph, txn, stamper, &group.id, node_id)?;
                }
            }
            Mutation::UpdateGroup {
                graph_id,
                group_id,
                title,
                color,
                description,
                position,
                size,
                collapsed,
                node_ids,
            } => {
                let graph = self.expect_graph(txn, graph_id)?;
                let element = expect_nested(&graph.groups, txn, group_id)?;
                if let Some(v) = title {
                    stamper.set(&element, txn, "title", v)?;
                }
                if let Some(v) = color {
                    stamper.set(&element, txn, "color", v)?;
                }
                if let Some(v) = description {
                    stamper.set(&element, txn, "description", v)?;
                }
                if let Some(v) = position {
                    stamper.set(&element, txn, "position", v)?;
                }
                if let Some(v) = size {
                    stamper.set(&element, txn, "size", v)?;
                }
                if let Some(v) = collapsed {
                    stamper.set(&element, txn, "collapsed", v)?;
                }
                if let Some(node_ids) = node_ids {
                    let wanted: BTreeSet<&str> = node_ids.iter().map(String::as_str).collect();
                    let current: BTreeSet<String> = nested(&element, &*txn, MEMBERS)
                        .map(|members| members.keys(&*txn).map(str::to_string).collect())
                        .unwrap_or_default();
                    for node_id in current.iter().filter(|id| !wanted.contains(id.as_str())) {
                        leave_group(&graph, txn, stamper, &element, group_id, node_id)?;
                    }
                    for node_id in wanted.iter().filter(|id| !current.contains(**id)) {
                        join_group(&graph, txn, stamper, group_id, node_id)?;
                    }
                }
            }
            Mutation::RemoveGroup { graph_id, group_id } => {
                let graph = self.expect_graph(txn, graph_id)?;
                graph.groups.remove(txn, group_id);
            }
            Mutation::AddGroupMember {
                graph_id,
                group_id,
                node_id,
            } => {
                let graph = self.expect_graph(txn, graph_id)?;
                join_group(&graph, txn, stamper, group_id, node_id)?;
            }
            Mutation::RemoveGroupMember {
                graph_id,
                group_id,
                node_id,
            } => {
                let graph = self.expect_graph(txn, graph_id)?;
                let group = expect_nested(&graph.groups, txn, group_id)?;
                leave_group(&graph, txn, stamper, &group, group_id, node_id)?;
            }
        }
        Ok(())
    }

    // ─── Remote changes ──────────────────────────────────────────────

    /// Merge a delta produced by another replica.
    ///
    /// Corrupt payloads are rejected before anything is integrated; see
    /// [`check_update`]. Applying the same delta again is a no-op.
    pub fn apply_remote(&mut self, delta: &[u8]) -> Result<(), DocumentError> {
        check_update(delta)?;
        let update =
            Update::decode_v1(delta).map_err(|e| DocumentError::MalformedDelta(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::MalformedDelta(e.to_string()))?;
        Ok(())
    }

    /// Compact description of everything this replica has incorporated.
    pub fn state_summary(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Minimal delta bringing a replica with `summary` up to date.
    pub fn diff_since(&self, summary: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote = StateVector::decode_v1(summary)
            .map_err(|e| DocumentError::MalformedSummary(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&remote))
    }

    /// Full state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    // ─── Reads ───────────────────────────────────────────────────────

    /// Materialize the whole document.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        let txn = self.doc.transact();
        let entries = register::read_all(&self.metadata, &txn);
        let mut metadata = WorkflowMetadata::default();
        if let Some(v) = register::decode(&entries, "name") {
            metadata.name = v;
        }
        if let Some(v) = register::decode(&entries, "description") {
            metadata.description = v;
        }
        if let Some(v) = register::decode(&entries, "isDraft") {
            metadata.is_draft = v;
        }
        if let Some(v) = register::decode(&entries, "isPublished") {
            metadata.is_published = v;
        }

        let mut snapshot = WorkflowSnapshot {
            metadata,
            graphs: Default::default(),
        };
        for (graph_id, root) in nested_entries(&self.graphs, &txn) {
            if let Some(graph) = graph_refs_in(root, &txn) {
                let materialized = read_graph(&graph, &txn, &graph_id);
                snapshot.graphs.insert(graph_id, materialized);
            }
        }

        let active: Option<String> = register::decode(&entries, "activeGraphId");
        snapshot.metadata.active_graph_id = active.filter(|id| snapshot.graphs.contains_key(id));
        snapshot
    }

    pub fn has_graph(&self, graph_id: &str) -> bool {
        let txn = self.doc.transact();
        self.graph(&txn, graph_id).is_some()
    }

    /// Read a single node without materializing the whole document.
    pub fn node(&self, graph_id: &str, node_id: &str) -> Option<Node> {
        let txn = self.doc.transact();
        let graph = self.graph(&txn, graph_id)?;
        let element = nested(&graph.nodes, &txn, node_id)?;
        let mut node = read_node(&element, &txn, node_id);
        if let Some(group_id) = &node.group_id {
            if !graph.groups.contains_key(&txn, group_id) {
                node.group_id = None;
            }
        }
        Some(node)
    }

    pub fn group(&self, graph_id: &str, group_id: &str) -> Option<Group> {
        let txn = self.doc.transact();
        let graph = self.graph(&txn, graph_id)?;
        let element = nested(&graph.groups, &txn, group_id)?;
        Some(read_group(&graph, &element, &txn, group_id))
    }

    // ─── Helpers ─────────────────────────────────────────────────────

    fn graph<T: ReadTxn>(&self, txn: &T, graph_id: &str) -> Option<GraphRefs> {
        nested(&self.graphs, txn, graph_id).and_then(|root| graph_refs_in(root, txn))
    }

    fn require_graph<T: ReadTxn>(&self, txn: &T, graph_id: &str) -> Result<GraphRefs, DocumentError> {
        self.graph(txn, graph_id)
            .ok_or_else(|| DocumentError::GraphNotFound(graph_id.to_string()))
    }

    fn expect_graph(&self, txn: &TransactionMut, graph_id: &str) -> Result<GraphRefs, DocumentError> {
        self.require_graph(txn, graph_id)
    }

    fn graph_roots(&self, txn: &TransactionMut) -> Vec<(String, MapRef)> {
        nested_entries(&self.graphs, txn)
    }
}

fn nested<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<MapRef> {
    match map.get(txn, key) {
        Some(Out::YMap(inner)) => Some(inner),
        _ => None,
    }
}

fn nested_entries<T: ReadTxn>(map: &MapRef, txn: &T) -> Vec<(String, MapRef)> {
    map.iter(txn)
        .filter_map(|(key, out)| match out {
            Out::YMap(inner) => Some((key.to_string(), inner)),
            _ => None,
        })
        .collect()
}

fn expect_nested(map: &MapRef, txn: &TransactionMut, key: &str) -> Result<MapRef, DocumentError> {
    nested(map, txn, key).ok_or_else(|| DocumentError::InvalidField(format!("missing element {key}")))
}

fn graph_refs_in<T: ReadTxn>(root: MapRef, txn: &T) -> Option<GraphRefs> {
    Some(GraphRefs {
        nodes: nested(&root, txn, NODES)?,
        connections: nested(&root, txn, CONNECTIONS)?,
        groups: nested(&root, txn, GROUPS)?,
        root,
    })
}

fn require_node<T: ReadTxn>(
    graph: &GraphRefs,
    txn: &T,
    graph_id: &str,
    node_id: &str,
) -> Result<(), DocumentError> {
    if graph.nodes.contains_key(txn, node_id) {
        Ok(())
    } else {
        Err(DocumentError::NodeNotFound {
            graph_id: graph_id.to_string(),
            node_id: node_id.to_string(),
        })
    }
}

fn require_group<T: ReadTxn>(
    graph: &GraphRefs,
    txn: &T,
    graph_id: &str,
    group_id: &str,
) -> Result<(), DocumentError> {
    if graph.groups.contains_key(txn, group_id) {
        Ok(())
    } else {
        Err(DocumentError::GroupNotFound {
            graph_id: graph_id.to_string(),
            group_id: group_id.to_string(),
        })
    }
}

/// Put `node_id` into `group_id`, leaving whatever group it was in before.
fn join_group(
    graph: &GraphRefs,
    txn: &mut TransactionMut,
    stamper: &mut Stamper<'_>,
    group_id: &str,
    node_id: &str,
) -> Result<(), DocumentError> {
    let Some(node) = nested(&graph.nodes, &*txn, node_id) else {
        return Ok(());
    };
    let previous: Option<String> =
        register::read::<_, Option<String>>(&node, &*txn, "groupId").flatten();
    if let Some(previous) = previous.filter(|p| p != group_id) {
        if let Some(old) = nested(&graph.groups, &*txn, &previous) {
            if let Some(members) = nested(&old, &*txn, MEMBERS) {
                members.remove(txn, node_id);
            }
        }
    }
    if let Some(group) = nested(&graph.groups, &*txn, group_id) {
        if let Some(members) = nested(&group, &*txn, MEMBERS) {
            members.insert(txn, node_id.to_string(), true);
        }
    }
    stamper.set(&node, txn, "groupId", &Some(group_id))
}

/// Drop `node_id` from `group`, clearing its back-reference if it still
/// points there.
fn leave_group(
    graph: &GraphRefs,
    txn: &mut TransactionMut,
    stamper: &mut Stamper<'_>,
    group: &MapRef,
    group_id: &str,
    node_id: &str,
) -> Result<(), DocumentError> {
    if let Some(members) = nested(group, &*txn, MEMBERS) {
        members.remove(txn, node_id);
    }
    if let Some(element) = nested(&graph.nodes, &*txn, node_id) {
        let current: Option<String> =
            register::read::<_, Option<String>>(&element, &*txn, "groupId").flatten();
        if current.as_deref() == Some(group_id) {
            stamper.set(&element, txn, "groupId", &Option::<String>::None)?;
        }
    }
    Ok(())
}

fn parse_connection(out: &Out) -> Option<Connection> {
    let raw = out_str(out)?;
    match serde_json::from_str(raw) {
        Ok(conn) => Some(conn),
        Err(e) => {
            log::warn!("Ignoring unreadable connection entry: {e}");
            None
        }
    }
}

fn read_node<T: ReadTxn>(element: &MapRef, txn: &T, node_id: &str) -> Node {
    let entries = register::read_all(element, txn);
    Node {
        id: node_id.to_string(),
        position: register::decode::<Position>(&entries, "position").unwrap_or_default(),
        metadata: register::decode::<NodeMetadata>(&entries, "metadata").unwrap_or_default(),
        group_id: register::decode::<Option<String>>(&entries, "groupId").flatten(),
    }
}

fn read_group<T: ReadTxn>(graph: &GraphRefs, element: &MapRef, txn: &T, group_id: &str) -> Group {
    let entries = register::read_all(element, txn);
    let mut node_ids: Vec<String> = nested(element, txn, MEMBERS)
        .map(|members| {
            members
                .keys(txn)
                .filter(|id| graph.nodes.contains_key(txn, id))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    node_ids.sort();
    Group {
        id: group_id.to_string(),
        title: register::decode(&entries, "title").unwrap_or_default(),
        color: register::decode(&entries, "color").unwrap_or_else(|| DEFAULT_GROUP_COLOR.to_string()),
        description: register::decode(&entries, "description").unwrap_or_default(),
        node_ids,
        position: register::decode(&entries, "position").unwrap_or_default(),
        size: register::decode::<Size>(&entries, "size").unwrap_or_default(),
        collapsed: register::decode(&entries, "collapsed").unwrap_or(false),
    }
}

fn read_graph<T: ReadTxn>(graph: &GraphRefs, txn: &T, graph_id: &str) -> GraphSnapshot {
    let entries = register::read_all(&graph.root, txn);

    let mut groups = std::collections::BTreeMap::new();
    for (group_id, element) in nested_entries(&graph.groups, txn) {
        let group = read_group(graph, &element, txn, &group_id);
        groups.insert(group_id, group);
    }

    let mut nodes = std::collections::BTreeMap::new();
    for (node_id, element) in nested_entries(&graph.nodes, txn) {
        let mut node = read_node(&element, txn, &node_id);
        if node.group_id.as_ref().is_some_and(|g| !groups.contains_key(g)) {
            node.group_id = None;
        }
        nodes.insert(node_id, node);
    }

    let mut connections = std::collections::BTreeMap::new();
    for (connection_id, out) in graph.connections.iter(txn) {
        let Some(conn) = parse_connection(&out) else {
            continue;
        };
        if nodes.contains_key(&conn.source.node_id) && nodes.contains_key(&conn.target.node_id) {
            connections.insert(connection_id.to_string(), conn);
        }
    }

    GraphSnapshot {
        id: graph_id.to_string(),
        name: register::decode(&entries, "name").unwrap_or_else(|| graph_id.to_string()),
        namespace: register::decode(&entries, "namespace").unwrap_or_else(|| graph_id.to_string()),
        is_main: register::decode(&entries, "isMain").unwrap_or(false),
        nodes,
        connections,
        groups,
    }
}

impl std::fmt::Debug for WorkflowDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDocument")
            .field("actor", &self.actor)
            .field("clock", &self.clock.now())
            .finish()
    }
}
