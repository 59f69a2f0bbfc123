use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::Prompt;

/// Struct containing task results from the ComfyUI API `history` endpoint.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(transparent)]
pub struct History {
    /// Completed tasks indexed by their uuid.
    pub tasks: HashMap<uuid::Uuid, Task>,
}

/// Struct representing a single task result from the ComfyUI API `history` endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Task {
    /// Outputs from the task.
    #[serde(default)]
    pub outputs: Outputs,
    /// Information about prompt execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptResult>,
    /// Execution status. Absent on older servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

impl Task {
    /// The execution state of this task.
    ///
    /// A task without a status block counts as finished, since older servers
    /// only add a task to history once it is done.
    pub fn state(&self) -> ExecutionState {
        self.status
            .as_ref()
            .map(TaskStatus::state)
            .unwrap_or(ExecutionState::Succeeded)
    }

    /// Iterate over every image produced by the task with the id of the
    /// node that produced it.
    pub fn images(&self) -> impl Iterator<Item = (&str, &Image)> {
        self.outputs
            .nodes
            .iter()
            .filter_map(|(node, output)| match output {
                NodeOutputOrUnknown::NodeOutput(output) => Some((node.as_str(), output)),
                NodeOutputOrUnknown::Unknown(_) => None,
            })
            .flat_map(|(node, output)| output.images.iter().map(move |image| (node, image)))
    }
}

/// Struct representing outputs from a task.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
#[serde(transparent)]
pub struct Outputs {
    /// Outputs from the task indexed by node.
    pub nodes: HashMap<String, NodeOutputOrUnknown>,
}

/// Enumertion of all possible output types from a node.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum NodeOutputOrUnknown {
    /// Enum variant representing image outputs from a node.
    NodeOutput(NodeOutput),
    /// Struct capturing unknown outputs.
    Unknown(serde_json::Value),
}

/// Struct representing image outputs from a node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeOutput {
    /// Images from the node.
    pub images: Vec<Image>,
}

/// Struct representing an image stored by the server.
///
/// Serializes to the query string understood by the `view` endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// The filename of the image.
    pub filename: String,
    /// The subfolder of the image, relative to the folder type.
    #[serde(default)]
    pub subfolder: String,
    /// The folder type: `output`, `input` or `temp`.
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// Struct representing the prompt a task was executed with.
///
/// The server sends this as a positional array: `[number, prompt_id,
/// prompt, extra_data, outputs_to_execute, ...]`. Trailing elements are
/// ignored.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(try_from = "Vec<serde_json::Value>")]
#[serde(into = "Vec<serde_json::Value>")]
pub struct PromptResult {
    /// The task number.
    pub num: u64,
    /// The task uuid.
    pub id: uuid::Uuid,
    /// The prompt that was executed.
    pub prompt: Prompt,
    /// Outputs executed for this prompt.
    pub outputs_to_execute: Vec<String>,
}

impl TryFrom<Vec<serde_json::Value>> for PromptResult {
    type Error = String;

    fn try_from(values: Vec<serde_json::Value>) -> Result<Self, Self::Error> {
        let mut values = values.into_iter();
        let num = values
            .next()
            .and_then(|v| v.as_u64())
            .ok_or("missing task number")?;
        let id = values
            .next()
            .and_then(|v| v.as_str().map(str::to_owned))
            .ok_or("missing prompt id")?
            .parse()
            .map_err(|e: uuid::Error| e.to_string())?;
        let prompt = serde_json::from_value(values.next().ok_or("missing prompt")?)
            .map_err(|e| e.to_string())?;
        let outputs_to_execute = values
            .nth(1)
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| e.to_string())?
            .unwrap_or_default();
        Ok(Self {
            num,
            id,
            prompt,
            outputs_to_execute,
        })
    }
}

impl From<PromptResult> for Vec<serde_json::Value> {
    fn from(
        PromptResult {
            num,
            id,
            prompt,
            outputs_to_execute,
        }: PromptResult,
    ) -> Self {
        vec![
            num.into(),
            id.to_string().into(),
            serde_json::to_value(prompt).unwrap_or_default(),
            serde_json::Value::Object(Default::default()),
            outputs_to_execute.into(),
        ]
    }
}

/// Struct representing the execution status of a task.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TaskStatus {
    /// Status string reported by the server, e.g. `success` or `error`.
    #[serde(default)]
    pub status_str: String,
    /// Whether the server considers the task completed.
    #[serde(default)]
    pub completed: bool,
    /// Execution events in the order they occurred.
    #[serde(default)]
    pub messages: Vec<StatusMessage>,
}

/// Execution event names reported in `status.messages`.
pub mod events {
    pub const EXECUTION_START: &str = "execution_start";
    pub const EXECUTION_CACHED: &str = "execution_cached";
    pub const EXECUTION_SUCCESS: &str = "execution_success";
    pub const EXECUTION_ERROR: &str = "execution_error";
    pub const EXECUTION_INTERRUPTED: &str = "execution_interrupted";
}

impl TaskStatus {
    /// Whether an event with the given name was reported.
    pub fn has_event(&self, event: &str) -> bool {
        self.messages.iter().any(|message| message.event == event)
    }

    /// Data attached to the first event with the given name.
    pub fn event_data(&self, event: &str) -> Option<&serde_json::Value> {
        self.messages
            .iter()
            .find(|message| message.event == event)
            .map(|message| &message.data)
    }

    /// Classifies the reported events.
    pub fn state(&self) -> ExecutionState {
        if self.has_event(events::EXECUTION_ERROR)
            || self.has_event(events::EXECUTION_INTERRUPTED)
            || self.status_str == "error"
        {
            ExecutionState::Failed
        } else if self.has_event(events::EXECUTION_SUCCESS)
            || self.has_event(events::EXECUTION_CACHED)
            || self.status_str == "success"
        {
            ExecutionState::Succeeded
        } else {
            ExecutionState::Running
        }
    }

    /// Short description of the execution error, if one was reported.
    pub fn error_message(&self) -> Option<String> {
        let data = self
            .event_data(events::EXECUTION_ERROR)
            .or_else(|| self.event_data(events::EXECUTION_INTERRUPTED))?;
        let node_type = data.get("node_type").and_then(|v| v.as_str());
        let message = data
            .get("exception_message")
            .and_then(|v| v.as_str())
            .map(str::trim);
        Some(match (node_type, message) {
            (Some(node_type), Some(message)) => format!("{node_type}: {message}"),
            (None, Some(message)) => message.to_string(),
            (Some(node_type), None) => format!("{node_type}: interrupted"),
            (None, None) => "execution failed".to_string(),
        })
    }
}

/// The state of a task as derived from its status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// The task is still executing.
    Running,
    /// The task finished, possibly entirely from cache.
    Succeeded,
    /// The task reported an error or was interrupted.
    Failed,
}

/// Struct representing a single `[event, data]` status message.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(from = "(String, serde_json::Value)")]
#[serde(into = "(String, serde_json::Value)")]
pub struct StatusMessage {
    /// The event name.
    pub event: String,
    /// Event payload.
    pub data: serde_json::Value,
}

impl From<(String, serde_json::Value)> for StatusMessage {
    fn from((event, data): (String, serde_json::Value)) -> Self {
        Self { event, data }
    }
}

impl From<StatusMessage> for (String, serde_json::Value) {
    fn from(StatusMessage { event, data }: StatusMessage) -> Self {
        (event, data)
    }
}
