use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Struct representing a prompt workflow in API format.
#[derive(Default, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct Prompt {
    /// The prompt workflow, indexed by node id.
    pub workflow: BTreeMap<String, Node>,
}

impl Prompt {
    /// Get a node by its id.
    pub fn get_node_by_id(&self, id: &str) -> Option<&Node> {
        self.workflow.get(id)
    }

    /// Get a mutable reference to a node by its id.
    pub fn get_node_by_id_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.workflow.get_mut(id)
    }

    /// Iterate over all nodes of the given class type, in node id order.
    pub fn get_nodes_by_type<'a>(
        &'a self,
        class_type: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Node)> + 'a {
        self.workflow
            .iter()
            .filter(move |(_, node)| node.class_type == class_type)
            .map(|(id, node)| (id.as_str(), node))
    }

    /// Returns the smallest unused numeric node id.
    ///
    /// Ids are compared numerically, non-numeric ids are ignored.
    pub fn next_node_id(&self) -> String {
        let max = self
            .workflow
            .keys()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        (max + 1).to_string()
    }

    /// Ids of every node consuming an output of `node_id`, with the input name.
    pub fn consumers_of<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.workflow.iter().flat_map(move |(id, node)| {
            node.inputs.iter().filter_map(move |(name, input)| {
                (input.node_id() == Some(node_id)).then_some((id.as_str(), name.as_str()))
            })
        })
    }
}

/// Struct representing a single node of an API format workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Node {
    /// The node class type.
    pub class_type: String,
    /// The node inputs.
    #[serde(default)]
    pub inputs: BTreeMap<String, Input>,
    /// UI metadata such as the node title. Ignored by the server.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl Node {
    /// Creates a node with no inputs.
    pub fn new<S: Into<String>>(class_type: S) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: BTreeMap::new(),
            meta: None,
        }
    }

    /// Builder style helper to add a widget value input.
    pub fn with_value<K, V>(mut self, name: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.inputs.insert(name.into(), Input::Value(value.into()));
        self
    }

    /// Builder style helper to add a connection input.
    pub fn with_connection<K, S>(mut self, name: K, node_id: S, output_index: u32) -> Self
    where
        K: Into<String>,
        S: Into<String>,
    {
        self.inputs.insert(
            name.into(),
            Input::NodeConnection(NodeConnection {
                node_id: node_id.into(),
                output_index,
            }),
        );
        self
    }

    /// Iterate over the ids of every node this node takes input from.
    pub fn connections(&self) -> impl Iterator<Item = &str> {
        self.inputs.values().filter_map(|input| input.node_id())
    }
}

/// Enum of inputs to a node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Input {
    /// Node connection input variant.
    NodeConnection(NodeConnection),
    /// Widget input variant.
    Value(serde_json::Value),
}

impl Input {
    /// Get the value of the input.
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Input::NodeConnection(_) => None,
            Input::Value(value) => Some(value),
        }
    }

    /// Get a mutable reference to the value of the input.
    pub fn value_mut(&mut self) -> Option<&mut serde_json::Value> {
        match self {
            Input::NodeConnection(_) => None,
            Input::Value(value) => Some(value),
        }
    }

    /// Get the node connection of the input.
    pub fn node_connection(&self) -> Option<&NodeConnection> {
        match self {
            Input::NodeConnection(node_connection) => Some(node_connection),
            Input::Value(_) => None,
        }
    }

    /// Get the node id of the input.
    pub fn node_id(&self) -> Option<&str> {
        self.node_connection()
            .map(|node_connection| node_connection.node_id.as_str())
    }
}

/// Struct representing a node input connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "(String, u32)")]
#[serde(into = "(String, u32)")]
pub struct NodeConnection {
    /// The node id of the node providing the input.
    pub node_id: String,
    /// The index of the output from the node providing the input.
    pub output_index: u32,
}

impl From<(String, u32)> for NodeConnection {
    fn from((node_id, output_index): (String, u32)) -> Self {
        Self {
            node_id,
            output_index,
        }
    }
}

impl From<NodeConnection> for (String, u32) {
    fn from(
        NodeConnection {
            node_id,
            output_index,
        }: NodeConnection,
    ) -> Self {
        (node_id, output_index)
    }
}

/// Struct representing a response to a prompt execution request.
#[derive(Serialize, Deserialize, Debug)]
pub struct Response {
    /// The prompt id.
    pub prompt_id: uuid::Uuid,
    /// The prompt number.
    #[serde(default)]
    pub number: u64,
    /// Node errors that have occurred indexed by node id.
    #[serde(default)]
    pub node_errors: HashMap<String, serde_json::Value>,
}

/// Body returned by the `prompt` endpoint when the graph fails validation.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ValidationFailure {
    /// Top level error description.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    /// Node errors indexed by node id.
    #[serde(default)]
    pub node_errors: HashMap<String, serde_json::Value>,
}

impl ValidationFailure {
    /// Human readable summary of the failure.
    pub fn message(&self) -> String {
        let error = match &self.error {
            Some(serde_json::Value::Object(error)) => error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_owned)
                .unwrap_or_else(|| serde_json::Value::Object(error.clone()).to_string()),
            Some(serde_json::Value::String(error)) => error.clone(),
            Some(other) => other.to_string(),
            None => "prompt failed validation".to_string(),
        };
        if self.node_errors.is_empty() {
            return error;
        }
        let mut nodes: Vec<_> = self.node_errors.keys().map(String::as_str).collect();
        nodes.sort_unstable();
        format!("{} (nodes: {})", error, nodes.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_prompt() {
        let prompt: Prompt = serde_json::from_value(serde_json::json!({
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": "flux1-dev-fp8.safetensors" }
            },
            "14": {
                "class_type": "Power Lora Loader (rgthree)",
                "inputs": {
                    "model": ["4", 0],
                    "clip": ["4", 1],
                    "lora_01": { "on": true, "lora": "turbo.safetensors", "strength": 0.75 }
                }
            }
        }))
        .unwrap();

        let lora = prompt.get_node_by_id("14").unwrap();
        assert_eq!(
            lora.inputs["clip"].node_connection(),
            Some(&NodeConnection {
                node_id: "4".to_string(),
                output_index: 1
            })
        );
        assert!(lora.inputs["lora_01"].value().unwrap().is_object());
        let mut connections: Vec<_> = lora.connections().collect();
        connections.dedup();
        assert_eq!(connections, vec!["4"]);
    }

    #[test]
    fn test_serialize_round_trips_meta() {
        let value = serde_json::json!({
            "9": {
                "class_type": "SaveImage",
                "inputs": { "filename_prefix": "test", "images": ["8", 0] },
                "_meta": { "title": "Save Image" }
            }
        });
        let prompt: Prompt = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(serde_json::to_value(&prompt).unwrap(), value);
    }

    #[test]
    fn test_next_node_id_and_consumers() {
        let mut prompt = Prompt::default();
        prompt
            .workflow
            .insert("1".to_string(), Node::new("CheckpointLoaderSimple"));
        prompt.workflow.insert(
            "10".to_string(),
            Node::new("KSampler").with_connection("model", "1", 0),
        );
        assert_eq!(prompt.next_node_id(), "11");
        assert_eq!(
            prompt.consumers_of("1").collect::<Vec<_>>(),
            vec![("10", "model")]
        );
    }

    #[test]
    fn test_validation_failure_message() {
        let failure: ValidationFailure = serde_json::from_value(serde_json::json!({
            "error": { "type": "prompt_outputs_failed_validation", "message": "Prompt outputs failed validation" },
            "node_errors": { "4": {}, "11": {} }
        }))
        .unwrap();
        assert_eq!(
            failure.message(),
            "Prompt outputs failed validation (nodes: 11, 4)"
        );
    }
}
