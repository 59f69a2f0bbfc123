//! The UI export format of a workflow and its conversion to API format.
//!
//! The editor saves graphs as a list of nodes plus a link table. The server
//! only accepts the API format, where every node is keyed by its id and each
//! input is either a literal value or a `[node_id, output_index]` connection.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{Input, Node, NodeConnection, Prompt};

/// A workflow in the editor's export format.
///
/// Fields this crate does not interpret are kept so that an edited workflow
/// can be written back without losing editor state.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Workflow {
    /// The nodes of the graph.
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    /// The link table. Each entry is either `[id, source, slot, target,
    /// target_slot, type]` or an object with the same information.
    #[serde(default)]
    pub links: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A node in the editor's export format.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowNode {
    /// Node id, usually an integer.
    pub id: Value,
    /// The node class type.
    #[serde(rename = "type")]
    pub class_type: String,
    /// Declared inputs in slot order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<WorkflowInput>>,
    /// Widget values in declaration order.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub widgets_values: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A declared input of an export format node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowInput {
    /// The input name.
    pub name: String,
    /// The id of the link feeding this input, if connected.
    #[serde(default)]
    pub link: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A resolved entry of the link table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub id: u64,
    pub source_node: String,
    pub source_slot: u32,
    pub target_node: String,
    pub target_slot: u32,
}

/// Renders a node id the way the API format keys nodes.
fn id_string(id: &Value) -> String {
    match id {
        Value::String(id) => id.clone(),
        other => other.to_string(),
    }
}

impl Link {
    /// Parses a link table entry. Returns `None` for malformed entries.
    pub fn parse(value: &Value) -> Option<Self> {
        match value {
            Value::Array(fields) => Some(Self {
                id: fields.first()?.as_u64()?,
                source_node: id_string(fields.get(1)?),
                source_slot: u32::try_from(fields.get(2)?.as_u64()?).ok()?,
                target_node: id_string(fields.get(3)?),
                target_slot: u32::try_from(fields.get(4)?.as_u64()?).ok()?,
            }),
            Value::Object(fields) => Some(Self {
                id: fields.get("id")?.as_u64()?,
                source_node: id_string(fields.get("origin_id")?),
                source_slot: u32::try_from(fields.get("origin_slot")?.as_u64()?).ok()?,
                target_node: id_string(fields.get("target_id")?),
                target_slot: u32::try_from(fields.get("target_slot")?.as_u64()?).ok()?,
            }),
            _ => None,
        }
    }
}

impl WorkflowNode {
    /// The node id as used for API format keys.
    pub fn id_string(&self) -> String {
        id_string(&self.id)
    }

    /// Widget values in declaration order. A non-array value counts as empty.
    pub fn widget_values(&self) -> &[Value] {
        match &self.widgets_values {
            Value::Array(values) => values,
            _ => &[],
        }
    }

    fn to_api_node(&self, links: &HashMap<u64, Link>) -> Node {
        let mut node = Node::new(self.class_type.clone());
        let mut widgets = self.widget_values().iter();
        for input in self.inputs.iter().flatten() {
            match input.link {
                Some(link) => {
                    if let Some(link) = links.get(&link) {
                        node.inputs.insert(
                            input.name.clone(),
                            Input::NodeConnection(NodeConnection {
                                node_id: link.source_node.clone(),
                                output_index: link.source_slot,
                            }),
                        );
                    }
                }
                None => {
                    if let Some(value) = widgets.next() {
                        node.inputs
                            .insert(input.name.clone(), Input::Value(value.clone()));
                    }
                }
            }
        }
        node
    }
}

impl Workflow {
    /// Parses the link table, skipping malformed entries.
    pub fn link_table(&self) -> HashMap<u64, Link> {
        self.links
            .iter()
            .filter_map(Link::parse)
            .map(|link| (link.id, link))
            .collect()
    }

    /// Converts the workflow to API format.
    ///
    /// Every node produces exactly one entry. Connected inputs resolve through
    /// the link table; inputs whose link is missing from the table are
    /// dropped. Unconnected inputs take the next widget value, in declaration
    /// order, while values remain.
    pub fn to_prompt(&self) -> Prompt {
        let links = self.link_table();
        Prompt {
            workflow: self
                .nodes
                .iter()
                .map(|node| (node.id_string(), node.to_api_node(&links)))
                .collect(),
        }
    }

    /// Get a node by its id.
    pub fn get_node_by_id_mut(&mut self, id: &str) -> Option<&mut WorkflowNode> {
        self.nodes.iter_mut().find(|node| node.id_string() == id)
    }

    /// Removes the given nodes along with every link touching them.
    ///
    /// Inputs and outputs of the remaining nodes that referred to a removed
    /// link are disconnected.
    ///
    /// # Returns
    ///
    /// The number of nodes removed.
    pub fn remove_nodes<S: AsRef<str>>(&mut self, ids: &[S]) -> usize {
        let ids: HashSet<&str> = ids.iter().map(AsRef::as_ref).collect();
        let before = self.nodes.len();
        self.nodes.retain(|node| !ids.contains(node.id_string().as_str()));
        let removed = before - self.nodes.len();

        self.links.retain(|link| match Link::parse(link) {
            Some(link) => {
                !ids.contains(link.source_node.as_str()) && !ids.contains(link.target_node.as_str())
            }
            None => true,
        });
        let kept: HashSet<u64> = self.link_table().into_keys().collect();

        for node in &mut self.nodes {
            for input in node.inputs.iter_mut().flatten() {
                if input.link.is_some_and(|link| !kept.contains(&link)) {
                    input.link = None;
                }
            }
            if let Some(Value::Array(outputs)) = node.extra.get_mut("outputs") {
                for output in outputs {
                    if let Some(Value::Array(links)) = output.get_mut("links") {
                        links.retain(|link| link.as_u64().is_some_and(|link| kept.contains(&link)));
                    }
                }
            }
        }
        removed
    }

    /// Replaces one widget value of the node with the given id.
    ///
    /// # Errors
    ///
    /// Fails if the node does not exist or has no widget at `index`.
    pub fn set_widget_value(&mut self, node_id: &str, index: usize, value: Value) -> anyhow::Result<()> {
        let node = self
            .get_node_by_id_mut(node_id)
            .with_context(|| format!("node {} not found", node_id))?;
        let slot = match &mut node.widgets_values {
            Value::Array(values) => values.get_mut(index),
            _ => None,
        }
        .with_context(|| format!("node {} has no widget value at index {}", node_id, index))?;
        *slot = value;
        Ok(())
    }

    /// Replaces one widget value on every node of the given class type.
    ///
    /// # Returns
    ///
    /// The number of nodes that were changed.
    ///
    /// # Errors
    ///
    /// Fails if no node of that class type has a widget at `index`.
    pub fn set_widget_by_type(
        &mut self,
        class_type: &str,
        index: usize,
        value: Value,
    ) -> anyhow::Result<usize> {
        let mut changed = 0;
        for node in self.nodes.iter_mut().filter(|node| node.class_type == class_type) {
            if let Some(slot) = node.widgets_values.as_array_mut().and_then(|v| v.get_mut(index)) {
                *slot = value.clone();
                changed += 1;
            }
        }
        if changed == 0 {
            return Err(anyhow!(
                "no {} node with a widget value at index {}",
                class_type,
                index
            ));
        }
        Ok(changed)
    }
}

/// A workflow document as found on disk.
#[derive(Debug, Clone)]
pub enum WorkflowFile {
    /// The editor's export format.
    Export(Workflow),
    /// API format wrapped as `{"prompt": {...}}`, as sent to the server.
    Wrapped(Prompt),
    /// Bare API format.
    Api(Prompt),
}

impl WorkflowFile {
    /// Detects the format of a parsed JSON document.
    ///
    /// # Errors
    ///
    /// Fails if the document matches none of the known formats.
    pub fn from_value(value: Value) -> anyhow::Result<Self> {
        let is_export = value.get("nodes").is_some_and(Value::is_array);
        let is_wrapped = value.get("prompt").is_some_and(Value::is_object);
        if is_export {
            serde_json::from_value(value)
                .map(Self::Export)
                .context("failed to parse workflow in export format")
        } else if is_wrapped {
            serde_json::from_value(value["prompt"].clone())
                .map(Self::Wrapped)
                .context("failed to parse wrapped API workflow")
        } else {
            serde_json::from_value(value)
                .map(Self::Api)
                .context("failed to parse API workflow")
        }
    }

    /// Reads and detects a workflow document from a file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {} as JSON", path.display()))?;
        Self::from_value(value).with_context(|| format!("unrecognised workflow {}", path.display()))
    }

    /// The API format graph, converting from export format if needed.
    pub fn into_prompt(self) -> Prompt {
        match self {
            WorkflowFile::Export(workflow) => workflow.to_prompt(),
            WorkflowFile::Wrapped(prompt) | WorkflowFile::Api(prompt) => prompt,
        }
    }
}
