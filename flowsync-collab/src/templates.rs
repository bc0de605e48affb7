//! Node templates used by the operation facade to instantiate nodes.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePort {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub direction: PortDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefinition {
    #[serde(rename = "type")]
    pub property_type: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplate {
    pub id: String,
    /// Node type written into instantiated nodes
    #[serde(rename = "type")]
    pub node_type: String,
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ports: Vec<TemplatePort>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDefinition>,
}

impl NodeTemplate {
    /// Default property values declared by the template.
    pub fn default_values(&self) -> BTreeMap<String, Value> {
        self.properties
            .iter()
            .filter_map(|(name, def)| def.default_value.clone().map(|v| (name.clone(), v)))
            .collect()
    }

    /// Whether the template declares `port_id` in `direction`. Templates
    /// without declared ports accept any port.
    pub fn has_port(&self, port_id: &str, direction: PortDirection) -> bool {
        self.ports.is_empty()
            || self
                .ports
                .iter()
                .any(|p| p.id == port_id && p.direction == direction)
    }
}

/// Source of node templates.
pub trait TemplateCatalog: Send + Sync {
    fn get(&self, template_id: &str) -> Option<NodeTemplate>;

    fn list(&self) -> Vec<NodeTemplate>;
}

/// Catalog held in memory, loadable from a JSON array of templates.
#[derive(Default)]
pub struct InMemoryCatalog {
    templates: RwLock<HashMap<String, NodeTemplate>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_templates(templates: impl IntoIterator<Item = NodeTemplate>) -> Self {
        let catalog = Self::new();
        for template in templates {
            catalog.insert(template);
        }
        catalog
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let templates: Vec<NodeTemplate> = serde_json::from_str(json)?;
        Ok(Self::from_templates(templates))
    }

    /// Add or replace a template.
    pub fn insert(&self, template: NodeTemplate) {
        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        templates.insert(template.id.clone(), template);
    }
}

impl TemplateCatalog for InMemoryCatalog {
    fn get(&self, template_id: &str) -> Option<NodeTemplate> {
        self.templates
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(template_id)
            .cloned()
    }

    fn list(&self) -> Vec<NodeTemplate> {
        let mut list: Vec<NodeTemplate> = self
            .templates
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}
