use thiserror::Error;

/// Errors raised while validating or merging document changes.
///
/// Validation variants are reported before any write transaction is opened,
/// so a returned error always means the document is unchanged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DocumentError {
    #[error("graph not found: {0}")]
    GraphNotFound(String),
    #[error("graph already exists: {0}")]
    GraphExists(String),
    #[error("node not found: {node_id} in graph {graph_id}")]
    NodeNotFound { graph_id: String, node_id: String },
    #[error("node already exists: {node_id} in graph {graph_id}")]
    NodeExists { graph_id: String, node_id: String },
    #[error("connection not found: {connection_id} in graph {graph_id}")]
    ConnectionNotFound {
        graph_id: String,
        connection_id: String,
    },
    #[error("connection already exists: {connection_id} in graph {graph_id}")]
    ConnectionExists {
        graph_id: String,
        connection_id: String,
    },
    #[error("group not found: {group_id} in graph {graph_id}")]
    GroupNotFound { graph_id: String, group_id: String },
    #[error("group already exists: {group_id} in graph {graph_id}")]
    GroupExists { graph_id: String, group_id: String },
    #[error("connection endpoint references missing node {node_id} in graph {graph_id}")]
    MissingEndpoint { graph_id: String, node_id: String },
    #[error("refusing to leave the workflow without a main graph ({0})")]
    LastMainGraph(String),
    #[error("invalid field value: {0}")]
    InvalidField(String),
    #[error("malformed delta: {0}")]
    MalformedDelta(String),
    #[error("malformed state summary: {0}")]
    MalformedSummary(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DocumentError {
    /// True for errors caused by the caller's request rather than by a
    /// corrupt payload.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            DocumentError::MalformedDelta(_)
                | DocumentError::MalformedSummary(_)
                | DocumentError::Serialization(_)
        )
    }
}

impl From<serde_json::Error> for DocumentError {
    fn from(e: serde_json::Error) -> Self {
        DocumentError::Serialization(e.to_string())
    }
}
