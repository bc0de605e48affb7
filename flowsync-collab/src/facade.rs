//! Server operation facade.
//!
//! Automation callers describe discrete intents (add a node from a
//! template, connect two ports, group nodes) and the facade turns each into
//! the equivalent [`Mutation`], published through [`Relay::publish_local`]
//! so live viewers of the room see it immediately. Every request is
//! validated against the current document before anything is written.
//!
//! [`OperationFacade::dispatch`] is the JSON entry point:
//!
//! ```text
//! dispatch("addNode", {"workflowId": "wf_1", "templateId": "tpl_http", ...})
//!   -> {"success": true, "data": {...node...}}
//!   -> {"success": false, "error": {"code": "NODE_NOT_FOUND", "message": "..."}}
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use flowsync_core::{
    new_id, Connection, DocumentError, Endpoint, Group, Mutation, Node, NodeMetadata, Position,
    Size, WorkflowDocument, WorkflowSnapshot, DEFAULT_GROUP_COLOR, MAIN_GRAPH_ID,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::error::CollabError;
use crate::registry::DocumentHandle;
use crate::relay::Relay;
use crate::templates::{PortDirection, TemplateCatalog};

/// Footprint assumed for a node when sizing a group around it.
pub const NODE_WIDTH: f64 = 200.0;
pub const NODE_HEIGHT: f64 = 100.0;
/// Margin between a group's border and its outermost members.
pub const GROUP_PADDING: f64 = 40.0;

#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("workflow already exists: {0}")]
    WorkflowExists(String),
    #[error("graph not found: {0}")]
    GraphNotFound(String),
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),
    #[error("group not found: {0}")]
    GroupNotFound(String),
    #[error("template not found: {0}")]
    TemplateNotFound(String),
    #[error("node {node_id} has no {direction:?} port {port_id}")]
    InvalidPort {
        node_id: String,
        port_id: String,
        direction: PortDirection,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error(transparent)]
    Internal(CollabError),
}

impl FacadeError {
    /// Stable code reported in the JSON envelope.
    pub fn code(&self) -> &'static str {
        match self {
            FacadeError::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            FacadeError::WorkflowExists(_) => "WORKFLOW_EXISTS",
            FacadeError::GraphNotFound(_) => "GRAPH_NOT_FOUND",
            FacadeError::NodeNotFound(_) => "NODE_NOT_FOUND",
            FacadeError::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            FacadeError::GroupNotFound(_) => "GROUP_NOT_FOUND",
            FacadeError::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            FacadeError::InvalidPort { .. } => "INVALID_PORT",
            FacadeError::Conflict(_) => "CONFLICT",
            FacadeError::InvalidRequest(_) => "VALIDATION_ERROR",
            FacadeError::UnknownOperation(_) => "UNKNOWN_OPERATION",
            FacadeError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Errors caused by the request rather than by the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, FacadeError::Internal(_))
    }
}

impl From<DocumentError> for FacadeError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::GraphNotFound(graph_id) => FacadeError::GraphNotFound(graph_id),
            DocumentError::NodeNotFound { node_id, .. }
            | DocumentError::MissingEndpoint { node_id, .. } => FacadeError::NodeNotFound(node_id),
            DocumentError::ConnectionNotFound { connection_id, .. } => {
                FacadeError::ConnectionNotFound(connection_id)
            }
            DocumentError::GroupNotFound { group_id, .. } => FacadeError::GroupNotFound(group_id),
            DocumentError::GraphExists(_)
            | DocumentError::NodeExists { .. }
            | DocumentError::ConnectionExists { .. }
            | DocumentError::GroupExists { .. } => FacadeError::Conflict(e.to_string()),
            e if e.is_validation() => FacadeError::InvalidRequest(e.to_string()),
            e => FacadeError::Internal(CollabError::Document(e)),
        }
    }
}

impl From<CollabError> for FacadeError {
    fn from(e: CollabError) -> Self {
        match e {
            CollabError::WorkflowNotFound(id) => FacadeError::WorkflowNotFound(id),
            CollabError::WorkflowExists(id) => FacadeError::WorkflowExists(id),
            CollabError::Document(e) => e.into(),
            e => FacadeError::Internal(e),
        }
    }
}

fn main_graph() -> String {
    MAIN_GRAPH_ID.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowRequest {
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetWorkflowStateRequest {
    pub workflow_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddNodeRequest {
    pub workflow_id: String,
    #[serde(default = "main_graph")]
    pub graph_id: String,
    pub template_id: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub property_values: BTreeMap<String, Value>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNodeRequest {
    pub workflow_id: String,
    #[serde(default = "main_graph")]
    pub graph_id: String,
    pub node_id: String,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub property_values: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteNodeRequest {
    pub workflow_id: String,
    #[serde(default = "main_graph")]
    pub graph_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectNodesRequest {
    pub workflow_id: String,
    #[serde(default = "main_graph")]
    pub graph_id: String,
    pub source: Endpoint,
    pub target: Endpoint,
    #[serde(default)]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveConnectionRequest {
    pub workflow_id: String,
    #[serde(default = "main_graph")]
    pub graph_id: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub workflow_id: String,
    #[serde(default = "main_graph")]
    pub graph_id: String,
    pub title: String,
    #[serde(default)]
    pub node_ids: Vec<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub size: Option<Size>,
    #[serde(default)]
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGroupRequest {
    pub workflow_id: String,
    #[serde(default = "main_graph")]
    pub graph_id: String,
    pub group_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub collapsed: Option<bool>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub size: Option<Size>,
    /// Replaces the membership when present
    #[serde(default)]
    pub node_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveGroupRequest {
    pub workflow_id: String,
    #[serde(default = "main_graph")]
    pub graph_id: String,
    pub group_id: String,
}

/// A workflow snapshot tagged with its id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub workflow_id: String,
    #[serde(flatten)]
    pub snapshot: WorkflowSnapshot,
}

pub struct OperationFacade {
    relay: Arc<Relay>,
    catalog: Arc<dyn TemplateCatalog>,
}

impl OperationFacade {
    pub fn new(relay: Arc<Relay>, catalog: Arc<dyn TemplateCatalog>) -> Self {
        Self { relay, catalog }
    }

    pub fn catalog(&self) -> &Arc<dyn TemplateCatalog> {
        &self.catalog
    }

    /// Run `operation` on a raw JSON payload and wrap the outcome in the
    /// `{success, data | error}` envelope.
    pub async fn dispatch(&self, operation: &str, payload: Value) -> Value {
        match self.execute(operation, payload).await {
            Ok(data) => json!({ "success": true, "data": data }),
            Err(e) => {
                if e.is_client_error() {
                    log::debug!("{operation} rejected: {e}");
                } else {
                    log::error!("{operation} failed: {e}");
                }
                json!({
                    "success": false,
                    "error": { "code": e.code(), "message": e.to_string() },
                })
            }
        }
    }

    async fn execute(&self, operation: &str, payload: Value) -> Result<Value, FacadeError> {
        match operation {
            "createWorkflow" => to_data(&self.create_workflow(parse(payload)?).await?),
            "getWorkflowState" => to_data(&self.get_workflow_state(parse(payload)?).await?),
            "addNode" => to_data(&self.add_node(parse(payload)?).await?),
            "updateNode" => to_data(&self.update_node(parse(payload)?).await?),
            "deleteNode" => {
                let node_id = self.delete_node(parse(payload)?).await?;
                Ok(json!({ "nodeId": node_id }))
            }
            "connectNodes" => to_data(&self.connect_nodes(parse(payload)?).await?),
            "removeConnection" => {
                let connection_id = self.remove_connection(parse(payload)?).await?;
                Ok(json!({ "connectionId": connection_id }))
            }
            "createGroup" => to_data(&self.create_group(parse(payload)?).await?),
            "updateGroup" => to_data(&self.update_group(parse(payload)?).await?),
            "removeGroup" => {
                let group_id = self.remove_group(parse(payload)?).await?;
                Ok(json!({ "groupId": group_id }))
            }
            other => Err(FacadeError::UnknownOperation(other.to_string())),
        }
    }

    pub async fn create_workflow(&self, req: CreateWorkflowRequest) -> Result<WorkflowState, FacadeError> {
        if req.name.trim().is_empty() {
            return Err(FacadeError::InvalidRequest("name must not be empty".into()));
        }
        let workflow_id = req.workflow_id.unwrap_or_else(|| new_id("wf"));
        self.relay.registry().create(&workflow_id).await?;
        self.relay
            .publish_local(
                &workflow_id,
                &Mutation::UpdateMetadata {
                    name: Some(req.name),
                    description: req.description,
                    active_graph_id: Some(MAIN_GRAPH_ID.to_string()),
                    is_draft: None,
                    is_published: None,
                },
            )
            .await?;
        log::info!("Workflow {workflow_id} created through the facade");
        self.state_of(workflow_id).await
    }

    pub async fn get_workflow_state(&self, req: GetWorkflowStateRequest) -> Result<WorkflowState, FacadeError> {
        self.state_of(req.workflow_id).await
    }

    /// Instantiate a template as a new node. Template property defaults are
    /// overlaid by the request's values.
    pub async fn add_node(&self, req: AddNodeRequest) -> Result<Node, FacadeError> {
        let handle = self.open(&req.workflow_id).await?;
        require_graph(&handle, &req.graph_id)?;
        let template = self
            .catalog
            .get(&req.template_id)
            .ok_or_else(|| FacadeError::TemplateNotFound(req.template_id.clone()))?;

        let mut property_values = template.default_values();
        property_values.extend(req.property_values);
        let node = Node {
            id: req.node_id.unwrap_or_else(|| new_id("node")),
            position: req.position,
            metadata: NodeMetadata {
                node_type: template.node_type,
                title: req.title.unwrap_or(template.title),
                template_id: Some(template.id),
                property_values,
            },
            group_id: None,
        };
        self.publish(
            &req.workflow_id,
            Mutation::AddNode {
                graph_id: req.graph_id.clone(),
                node: node.clone(),
            },
        )
        .await?;
        let stored = self
            .read(&req.workflow_id, |doc| doc.node(&req.graph_id, &node.id))
            .await;
        Ok(stored.unwrap_or(node))
    }

    /// Move a node and merge property values into its metadata. The
    /// merged metadata is written as a whole.
    pub async fn update_node(&self, req: UpdateNodeRequest) -> Result<Node, FacadeError> {
        let handle = self.open(&req.workflow_id).await?;
        let current = require_node(&handle, &req.graph_id, &req.node_id)?;

        let metadata = if req.property_values.is_some() || req.title.is_some() {
            let mut metadata = current.metadata.clone();
            if let Some(values) = req.property_values {
                metadata.property_values.extend(values);
            }
            if let Some(title) = req.title {
                metadata.title = title;
            }
            Some(metadata)
        } else {
            None
        };
        if req.position.is_none() && metadata.is_none() {
            return Ok(current);
        }

        self.publish(
            &req.workflow_id,
            Mutation::UpdateNode {
                graph_id: req.graph_id.clone(),
                node_id: req.node_id.clone(),
                position: req.position,
                metadata,
            },
        )
        .await?;
        self.read(&req.workflow_id, |doc| doc.node(&req.graph_id, &req.node_id))
            .await
            .ok_or_else(|| FacadeError::NodeNotFound(req.node_id.clone()))
    }

    pub async fn delete_node(&self, req: DeleteNodeRequest) -> Result<String, FacadeError> {
        self.publish(
            &req.workflow_id,
            Mutation::RemoveNode {
                graph_id: req.graph_id,
                node_id: req.node_id.clone(),
            },
        )
        .await?;
        Ok(req.node_id)
    }

    /// Connect two node ports. Ports are checked against the nodes'
    /// templates when the catalog knows them.
    pub async fn connect_nodes(&self, req: ConnectNodesRequest) -> Result<Connection, FacadeError> {
        let handle = self.open(&req.workflow_id).await?;
        let source = require_node(&handle, &req.graph_id, &req.source.node_id)?;
        let target = require_node(&handle, &req.graph_id, &req.target.node_id)?;
        self.check_port(&source, &req.source.port_id, PortDirection::Output)?;
        self.check_port(&target, &req.target.port_id, PortDirection::Input)?;

        let connection = Connection {
            id: req.connection_id.unwrap_or_else(|| new_id("conn")),
            source: req.source,
            target: req.target,
        };
        self.publish(
            &req.workflow_id,
            Mutation::AddConnection {
                graph_id: req.graph_id,
                connection: connection.clone(),
            },
        )
        .await?;
        Ok(connection)
    }

    pub async fn remove_connection(&self, req: RemoveConnectionRequest) -> Result<String, FacadeError> {
        self.publish(
            &req.workflow_id,
            Mutation::RemoveConnection {
                graph_id: req.graph_id,
                connection_id: req.connection_id.clone(),
            },
        )
        .await?;
        Ok(req.connection_id)
    }

    /// Group nodes. Without an explicit position the group encloses its
    /// members with [`GROUP_PADDING`] on every side.
    pub async fn create_group(&self, req: CreateGroupRequest) -> Result<Group, FacadeError> {
        let handle = self.open(&req.workflow_id).await?;
        require_graph(&handle, &req.graph_id)?;
        let mut node_ids = req.node_ids;
        node_ids.sort();
        node_ids.dedup();
        let members = node_ids
            .iter()
            .map(|id| require_node(&handle, &req.graph_id, id))
            .collect::<Result<Vec<_>, _>>()?;

        let (position, size) = match (req.position, req.size, enclosing_bounds(&members)) {
            (Some(position), Some(size), _) => (position, size),
            (position, size, Some((bounds_pos, bounds_size))) => {
                (position.unwrap_or(bounds_pos), size.unwrap_or(bounds_size))
            }
            (position, size, None) => (position.unwrap_or_default(), size.unwrap_or_default()),
        };
        let group = Group {
            id: req.group_id.unwrap_or_else(|| new_id("group")),
            title: req.title,
            color: req.color.unwrap_or_else(|| DEFAULT_GROUP_COLOR.to_string()),
            description: req.description.unwrap_or_default(),
            node_ids,
            position,
            size,
            collapsed: false,
        };
        self.publish(
            &req.workflow_id,
            Mutation::CreateGroup {
                graph_id: req.graph_id.clone(),
                group: group.clone(),
            },
        )
        .await?;
        let stored = self
            .read(&req.workflow_id, |doc| doc.group(&req.graph_id, &group.id))
            .await;
        Ok(stored.unwrap_or(group))
    }

    /// Update group fields and, when `nodeIds` is given, replace the
    /// membership. The whole update is one mutation, so it applies entirely
    /// or not at all.
    pub async fn update_group(&self, req: UpdateGroupRequest) -> Result<Group, FacadeError> {
        let handle = self.open(&req.workflow_id).await?;
        require_graph(&handle, &req.graph_id)?;
        if handle
            .with_document(|doc| doc.group(&req.graph_id, &req.group_id))
            .is_none()
        {
            return Err(FacadeError::GroupNotFound(req.group_id.clone()));
        }

        self.publish(
            &req.workflow_id,
            Mutation::UpdateGroup {
                graph_id: req.graph_id.clone(),
                group_id: req.group_id.clone(),
                title: req.title,
                color: req.color,
                description: req.description,
                position: req.position,
                size: req.size,
                collapsed: req.collapsed,
                node_ids: req.node_ids,
            },
        )
        .await?;

        self.read(&req.workflow_id, |doc| doc.group(&req.graph_id, &req.group_id))
            .await
            .ok_or_else(|| FacadeError::GroupNotFound(req.group_id.clone()))
    }

    pub async fn remove_group(&self, req: RemoveGroupRequest) -> Result<String, FacadeError> {
        self.publish(
            &req.workflow_id,
            Mutation::RemoveGroup {
                graph_id: req.graph_id,
                group_id: req.group_id.clone(),
            },
        )
        .await?;
        Ok(req.group_id)
    }

    async fn open(&self, workflow_id: &str) -> Result<Arc<DocumentHandle>, FacadeError> {
        Ok(self.relay.registry().open_existing(workflow_id).await?)
    }

    async fn publish(&self, workflow_id: &str, mutation: Mutation) -> Result<(), FacadeError> {
        self.relay.publish_local(workflow_id, &mutation).await?;
        Ok(())
    }

    /// Read from the current resident document, which may have been
    /// rehydrated since the caller's handle was obtained.
    async fn read<R>(&self, workflow_id: &str, read: impl FnOnce(&WorkflowDocument) -> Option<R>) -> Option<R> {
        let handle = self.relay.registry().open_existing(workflow_id).await.ok()?;
        handle.with_document(read)
    }

    async fn state_of(&self, workflow_id: String) -> Result<WorkflowState, FacadeError> {
        let snapshot = self.relay.registry().get_snapshot(&workflow_id).await?;
        Ok(WorkflowState {
            workflow_id,
            snapshot,
        })
    }

    fn check_port(&self, node: &Node, port_id: &str, direction: PortDirection) -> Result<(), FacadeError> {
        let Some(template) = node
            .metadata
            .template_id
            .as_deref()
            .and_then(|id| self.catalog.get(id))
        else {
            return Ok(());
        };
        if template.has_port(port_id, direction) {
            Ok(())
        } else {
            Err(FacadeError::InvalidPort {
                node_id: node.id.clone(),
                port_id: port_id.to_string(),
                direction,
            })
        }
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, FacadeError> {
    serde_json::from_value(payload).map_err(|e| FacadeError::InvalidRequest(e.to_string()))
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, FacadeError> {
    serde_json::to_value(value)
        .map_err(|e| FacadeError::Internal(CollabError::Document(DocumentError::from(e))))
}

fn require_graph(handle: &DocumentHandle, graph_id: &str) -> Result<(), FacadeError> {
    if handle.with_document(|doc| doc.has_graph(graph_id)) {
        Ok(())
    } else {
        Err(FacadeError::GraphNotFound(graph_id.to_string()))
    }
}

fn require_node(handle: &DocumentHandle, graph_id: &str, node_id: &str) -> Result<Node, FacadeError> {
    require_graph(handle, graph_id)?;
    handle
        .with_document(|doc| doc.node(graph_id, node_id))
        .ok_or_else(|| FacadeError::NodeNotFound(node_id.to_string()))
}

/// Box around `nodes` grown by [`GROUP_PADDING`]; `None` for no nodes.
pub fn enclosing_bounds(nodes: &[Node]) -> Option<(Position, Size)> {
    let first = nodes.first()?;
    let init = (
        first.position.x,
        first.position.y,
        first.position.x + NODE_WIDTH,
        first.position.y + NODE_HEIGHT,
    );
    let (min_x, min_y, max_x, max_y) = nodes.iter().fold(init, |(x0, y0, x1, y1), node| {
        (
            x0.min(node.position.x),
            y0.min(node.position.y),
            x1.max(node.position.x + NODE_WIDTH),
            y1.max(node.position.y + NODE_HEIGHT),
        )
    });
    Some((
        Position::new(min_x - GROUP_PADDING, min_y - GROUP_PADDING),
        Size {
            width: max_x - min_x + 2.0 * GROUP_PADDING,
            height: max_y - min_y + 2.0 * GROUP_PADDING,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::protocol::PeerInfo;
    use crate::registry::DocumentRegistry;
    use crate::storage::{MemorySnapshotStore, PersistenceBridge, RetryPolicy};
    use crate::templates::InMemoryCatalog;
    use uuid::Uuid;

    const TEMPLATES: &str = r#"[
        {
            "id": "tpl_http",
            "type": "http-request",
            "title": "HTTP Request",
            "ports": [
                {"id": "in", "type": "input"},
                {"id": "out", "type": "output"}
            ],
            "properties": {
                "method": {"type": "select", "defaultValue": "GET"},
                "timeout": {"type": "number", "defaultValue": 30}
            }
        }
    ]"#;

    fn facade() -> OperationFacade {
        let config = ServerConfig::for_testing();
        let store = Arc::new(MemorySnapshotStore::new());
        let bridge = PersistenceBridge::new(store, RetryPolicy::for_testing());
        let registry = Arc::new(DocumentRegistry::new(bridge, config.broadcast_capacity));
        let relay = Arc::new(Relay::new(registry, config));
        let catalog = Arc::new(InMemoryCatalog::from_json(TEMPLATES).unwrap());
        OperationFacade::new(relay, catalog)
    }

    async fn workflow(facade: &OperationFacade) -> String {
        let created = facade
            .dispatch("createWorkflow", json!({"workflowId": "wf_test", "name": "Test"}))
            .await;
        assert_eq!(created["success"], json!(true), "{created}");
        "wf_test".to_string()
    }

    async fn add(facade: &OperationFacade, wf: &str, id: &str, x: f64, y: f64) {
        let res = facade
            .dispatch(
                "addNode",
                json!({
                    "workflowId": wf,
                    "templateId": "tpl_http",
                    "nodeId": id,
                    "position": {"x": x, "y": y},
                }),
            )
            .await;
        assert_eq!(res["success"], json!(true), "{res}");
    }

    #[tokio::test]
    async fn test_create_workflow_seeds_main_graph() {
        let facade = facade();
        let res = facade.dispatch("createWorkflow", json!({"name": "Pipeline"})).await;
        assert_eq!(res["success"], json!(true));
        let data = &res["data"];
        assert!(data["workflowId"].as_str().unwrap().starts_with("wf_"));
        assert_eq!(data["metadata"]["name"], json!("Pipeline"));
        assert_eq!(data["metadata"]["activeGraphId"], json!("main"));
        assert_eq!(data["graphs"]["main"]["isMain"], json!(true));
    }

    #[tokio::test]
    async fn test_create_existing_workflow_conflicts() {
        let facade = facade();
        workflow(&facade).await;
        let res = facade
            .dispatch("createWorkflow", json!({"workflowId": "wf_test", "name": "Again"}))
            .await;
        assert_eq!(res["error"]["code"], json!("WORKFLOW_EXISTS"));
    }

    #[tokio::test]
    async fn test_add_node_overlays_template_defaults() {
        let facade = facade();
        let wf = workflow(&facade).await;
        let res = facade
            .dispatch(
                "addNode",
                json!({
                    "workflowId": wf,
                    "templateId": "tpl_http",
                    "position": {"x": 10.0, "y": 20.0},
                    "propertyValues": {"method": "POST"},
                }),
            )
            .await;
        let node = &res["data"];
        assert!(node["id"].as_str().unwrap().starts_with("node_"));
        assert_eq!(node["metadata"]["type"], json!("http-request"));
        assert_eq!(node["metadata"]["title"], json!("HTTP Request"));
        assert_eq!(node["metadata"]["templateId"], json!("tpl_http"));
        assert_eq!(node["metadata"]["propertyValues"]["method"], json!("POST"));
        assert_eq!(node["metadata"]["propertyValues"]["timeout"], json!(30));
    }

    #[tokio::test]
    async fn test_validation_errors_are_structured() {
        let facade = facade();
        let wf = workflow(&facade).await;

        let missing_wf = facade
            .dispatch("addNode", json!({"workflowId": "nope", "templateId": "tpl_http"}))
            .await;
        assert_eq!(missing_wf["success"], json!(false));
        assert_eq!(missing_wf["error"]["code"], json!("WORKFLOW_NOT_FOUND"));

        let missing_graph = facade
            .dispatch(
                "addNode",
                json!({"workflowId": wf, "graphId": "other", "templateId": "tpl_http"}),
            )
            .await;
        assert_eq!(missing_graph["error"]["code"], json!("GRAPH_NOT_FOUND"));

        let missing_template = facade
            .dispatch("addNode", json!({"workflowId": wf, "templateId": "tpl_nope"}))
            .await;
        assert_eq!(missing_template["error"]["code"], json!("TEMPLATE_NOT_FOUND"));

        let malformed = facade.dispatch("addNode", json!({"templateId": 3})).await;
        assert_eq!(malformed["error"]["code"], json!("VALIDATION_ERROR"));

        let unknown = facade.dispatch("launchRocket", json!({})).await;
        assert_eq!(unknown["error"]["code"], json!("UNKNOWN_OPERATION"));

        let state = facade
            .get_workflow_state(GetWorkflowStateRequest { workflow_id: wf })
            .await
            .unwrap();
        assert!(state.snapshot.graphs[MAIN_GRAPH_ID].nodes.is_empty());
    }

    #[tokio::test]
    async fn test_update_node_merges_properties() {
        let facade = facade();
        let wf = workflow(&facade).await;
        add(&facade, &wf, "n1", 0.0, 0.0).await;

        let res = facade
            .dispatch(
                "updateNode",
                json!({
                    "workflowId": wf,
                    "nodeId": "n1",
                    "propertyValues": {"url": "https://example.com"},
                    "position": {"x": 5.0, "y": 6.0},
                }),
            )
            .await;
        let values = &res["data"]["metadata"]["propertyValues"];
        assert_eq!(values["url"], json!("https://example.com"));
        assert_eq!(values["method"], json!("GET"));
        assert_eq!(res["data"]["position"], json!({"x": 5.0, "y": 6.0}));
    }

    #[tokio::test]
    async fn test_connect_checks_nodes_and_ports() {
        let facade = facade();
        let wf = workflow(&facade).await;
        add(&facade, &wf, "a", 0.0, 0.0).await;
        add(&facade, &wf, "b", 300.0, 0.0).await;

        let bad_node = facade
            .dispatch(
                "connectNodes",
                json!({
                    "workflowId": wf,
                    "source": {"nodeId": "a", "portId": "out"},
                    "target": {"nodeId": "ghost", "portId": "in"},
                }),
            )
            .await;
        assert_eq!(bad_node["error"]["code"], json!("NODE_NOT_FOUND"));

        let bad_port = facade
            .dispatch(
                "connectNodes",
                json!({
                    "workflowId": wf,
                    "source": {"nodeId": "a", "portId": "in"},
                    "target": {"nodeId": "b", "portId": "in"},
                }),
            )
            .await;
        assert_eq!(bad_port["error"]["code"], json!("INVALID_PORT"));

        let ok = facade
            .dispatch(
                "connectNodes",
                json!({
                    "workflowId": wf,
                    "source": {"nodeId": "a", "portId": "out"},
                    "target": {"nodeId": "b", "portId": "in"},
                }),
            )
            .await;
        let connection_id = ok["data"]["id"].as_str().unwrap().to_string();

        let removed = facade
            .dispatch(
                "removeConnection",
                json!({"workflowId": wf, "connectionId": connection_id}),
            )
            .await;
        assert_eq!(removed["data"]["connectionId"], json!(connection_id));

        let again = facade
            .dispatch(
                "removeConnection",
                json!({"workflowId": wf, "connectionId": connection_id}),
            )
            .await;
        assert_eq!(again["error"]["code"], json!("CONNECTION_NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_create_group_encloses_members() {
        let facade = facade();
        let wf = workflow(&facade).await;
        add(&facade, &wf, "a", 100.0, 100.0).await;
        add(&facade, &wf, "b", 400.0, 300.0).await;

        let group = facade
            .create_group(CreateGroupRequest {
                workflow_id: wf.clone(),
                graph_id: main_graph(),
                title: "Fetch".into(),
                node_ids: vec!["b".into(), "a".into()],
                color: None,
                description: None,
                position: None,
                size: None,
                group_id: Some("g1".into()),
            })
            .await
            .unwrap();
        assert_eq!(group.node_ids, vec!["a", "b"]);
        assert_eq!(group.color, DEFAULT_GROUP_COLOR);
        assert_eq!(group.position, Position::new(60.0, 60.0));
        assert_eq!(group.size.width, 400.0 + 2.0 * GROUP_PADDING + NODE_WIDTH - 100.0);
        assert_eq!(group.size.height, 200.0 + 2.0 * GROUP_PADDING + NODE_HEIGHT);

        let state = facade
            .get_workflow_state(GetWorkflowStateRequest { workflow_id: wf })
            .await
            .unwrap();
        let node = state.snapshot.node(MAIN_GRAPH_ID, "a").unwrap();
        assert_eq!(node.group_id.as_deref(), Some("g1"));
    }

    #[tokio::test]
    async fn test_create_group_with_missing_member_writes_nothing() {
        let facade = facade();
        let wf = workflow(&facade).await;
        add(&facade, &wf, "a", 0.0, 0.0).await;
        let res = facade
            .dispatch(
                "createGroup",
                json!({"workflowId": wf, "title": "G", "nodeIds": ["a", "ghost"]}),
            )
            .await;
        assert_eq!(res["error"]["code"], json!("NODE_NOT_FOUND"));
        let state = facade
            .get_workflow_state(GetWorkflowStateRequest { workflow_id: wf })
            .await
            .unwrap();
        assert!(state.snapshot.graphs[MAIN_GRAPH_ID].groups.is_empty());
    }

    #[tokio::test]
    async fn test_update_group_fields_and_membership() {
        let facade = facade();
        let wf = workflow(&facade).await;
        for id in ["a", "b", "c"] {
            add(&facade, &wf, id, 0.0, 0.0).await;
        }
        facade
            .dispatch(
                "createGroup",
                json!({"workflowId": wf, "groupId": "g1", "title": "G", "nodeIds": ["a", "b"]}),
            )
            .await;

        let res = facade
            .dispatch(
                "updateGroup",
                json!({
                    "workflowId": wf,
                    "groupId": "g1",
                    "title": "Renamed",
                    "collapsed": true,
                    "nodeIds": ["b", "c"],
                }),
            )
            .await;
        let group = &res["data"];
        assert_eq!(group["title"], json!("Renamed"));
        assert_eq!(group["collapsed"], json!(true));
        assert_eq!(group["nodeIds"], json!(["b", "c"]));

        let bad = facade
            .dispatch(
                "updateGroup",
                json!({"workflowId": wf, "groupId": "g1", "title": "X", "nodeIds": ["ghost"]}),
            )
            .await;
        assert_eq!(bad["error"]["code"], json!("NODE_NOT_FOUND"));
        let state = facade
            .get_workflow_state(GetWorkflowStateRequest { workflow_id: wf.clone() })
            .await
            .unwrap();
        assert_eq!(state.snapshot.group(MAIN_GRAPH_ID, "g1").unwrap().title, "Renamed");

        let removed = facade
            .dispatch("removeGroup", json!({"workflowId": wf, "groupId": "g1"}))
            .await;
        assert_eq!(removed["data"]["groupId"], json!("g1"));
    }

    #[tokio::test]
    async fn test_update_group_after_peer_removed_member_writes_nothing() {
        let facade = facade();
        let wf = workflow(&facade).await;
        for id in ["a", "b"] {
            add(&facade, &wf, id, 0.0, 0.0).await;
        }
        facade
            .dispatch(
                "createGroup",
                json!({"workflowId": wf, "groupId": "g1", "title": "G", "nodeIds": ["a"]}),
            )
            .await;

        // A live client deletes "b" just before the facade call lands
        let editor = Uuid::new_v4();
        let joined = facade
            .relay
            .join(editor, &wf, PeerInfo::new("u1", "Editor"), &[])
            .await
            .unwrap();
        let mut watcher = facade
            .relay
            .join(Uuid::new_v4(), &wf, PeerInfo::new("u2", "Watcher"), &[])
            .await
            .unwrap();
        let mut replica = WorkflowDocument::new("editor");
        replica.apply_remote(&joined.catch_up).unwrap();
        let change = replica
            .apply_local(&Mutation::RemoveNode {
                graph_id: MAIN_GRAPH_ID.into(),
                node_id: "b".into(),
            })
            .unwrap();
        facade.relay.publish(editor, 1, &change.delta).await.unwrap();
        while watcher.receiver.try_recv().is_ok() {}
        let version = facade.relay.registry().get(&wf).await.unwrap().version();

        let res = facade
            .dispatch(
                "updateGroup",
                json!({"workflowId": wf, "groupId": "g1", "title": "Renamed", "nodeIds": ["a", "b"]}),
            )
            .await;
        assert_eq!(res["error"]["code"], json!("NODE_NOT_FOUND"));
        assert!(watcher.receiver.try_recv().is_err(), "nothing was broadcast");
        let handle = facade.relay.registry().get(&wf).await.unwrap();
        assert_eq!(handle.version(), version);
        let group = handle.snapshot().group(MAIN_GRAPH_ID, "g1").cloned().unwrap();
        assert_eq!(group.title, "G");
        assert_eq!(group.node_ids, vec!["a"]);
    }

    #[tokio::test]
    async fn test_concurrent_create_workflow_keeps_first_name() {
        let facade = Arc::new(facade());
        let attempts: Vec<_> = ["First", "Second", "Third"]
            .into_iter()
            .map(|name| {
                let facade = facade.clone();
                tokio::spawn(async move {
                    facade
                        .dispatch("createWorkflow", json!({"workflowId": "wf_race", "name": name}))
                        .await
                })
            })
            .collect();

        let mut winners = Vec::new();
        for attempt in attempts {
            let res = attempt.await.unwrap();
            if res["success"] == json!(true) {
                winners.push(res["data"]["metadata"]["name"].clone());
            } else {
                assert_eq!(res["error"]["code"], json!("WORKFLOW_EXISTS"));
            }
        }
        assert_eq!(winners.len(), 1);
        let state = facade
            .get_workflow_state(GetWorkflowStateRequest { workflow_id: "wf_race".into() })
            .await
            .unwrap();
        assert_eq!(json!(state.snapshot.metadata.name), winners[0]);
    }

    #[tokio::test]
    async fn test_delete_node() {
        let facade = facade();
        let wf = workflow(&facade).await;
        add(&facade, &wf, "a", 0.0, 0.0).await;
        let res = facade
            .dispatch("deleteNode", json!({"workflowId": wf, "nodeId": "a"}))
            .await;
        assert_eq!(res["data"]["nodeId"], json!("a"));
        let again = facade
            .dispatch("deleteNode", json!({"workflowId": wf, "nodeId": "a"}))
            .await;
        assert_eq!(again["error"]["code"], json!("NODE_NOT_FOUND"));
    }

    #[test]
    fn test_enclosing_bounds() {
        assert!(enclosing_bounds(&[]).is_none());
        let node = Node {
            id: "a".into(),
            position: Position::new(0.0, 0.0),
            metadata: NodeMetadata::default(),
            group_id: None,
        };
        let (pos, size) = enclosing_bounds(&[node]).unwrap();
        assert_eq!(pos, Position::new(-GROUP_PADDING, -GROUP_PADDING));
        assert_eq!(size.width, NODE_WIDTH + 2.0 * GROUP_PADDING);
        assert_eq!(size.height, NODE_HEIGHT + 2.0 * GROUP_PADDING);
    }
}
