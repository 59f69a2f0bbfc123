use std::collections::HashSet;

use crate::models::*;

/// Trait for visiting nodes in a ComfyUI graph.
pub trait Visitor {
    /// Visits a node in a ComfyUI graph.
    ///
    /// # Arguments
    ///
    /// * `prompt` - The prompt that contains the graph.
    /// * `id` - The id of the node to visit.
    /// * `node` - The node to visit.
    fn visit(&mut self, prompt: &Prompt, id: &str, node: &Node) {
        walk(self, prompt, node)
    }
}

/// Visits every node that `node` takes input from.
pub fn walk<V: Visitor + ?Sized>(visitor: &mut V, prompt: &Prompt, node: &Node) {
    for c in node.connections() {
        if let Some(input) = prompt.get_node_by_id(c) {
            visitor.visit(prompt, c, input);
        }
    }
}

/// Finds the first node of one of the given class types upstream of (and
/// including) the node the walk starts at.
pub(crate) struct FindNode<'a> {
    class_types: &'a [&'a str],
    visited: HashSet<String>,
    pub(crate) found: Option<String>,
}

impl<'a> FindNode<'a> {
    pub(crate) fn new(class_types: &'a [&'a str]) -> Self {
        Self {
            class_types,
            visited: HashSet::new(),
            found: None,
        }
    }

    /// Runs the search from `start`.
    pub(crate) fn search(mut self, prompt: &Prompt, start: &str) -> Option<String> {
        let node = prompt.get_node_by_id(start)?;
        self.visit(prompt, start, node);
        self.found
    }
}

impl<'a> Visitor for FindNode<'a> {
    fn visit(&mut self, prompt: &Prompt, id: &str, node: &Node) {
        if self.found.is_some() || !self.visited.insert(id.to_string()) {
            return;
        }
        if self.class_types.contains(&node.class_type.as_str()) {
            self.found = Some(id.to_string());
            return;
        }
        walk(self, prompt, node)
    }
}

/// Finds the node the graph's output is written by: a node that takes
/// inputs but whose outputs nobody consumes. `SaveImage` nodes win over other
/// candidates, ties are broken by node id order.
pub(crate) fn find_output_node(prompt: &Prompt) -> Option<String> {
    let consumed: HashSet<&str> = prompt
        .workflow
        .values()
        .flat_map(|node| node.connections())
        .collect();
    let mut candidates = prompt.workflow.iter().filter(|(id, node)| {
        !consumed.contains(id.as_str()) && node.connections().next().is_some()
    });
    let first = candidates.clone().next().map(|(id, _)| id.clone());
    candidates
        .find(|(_, node)| node.class_type == "SaveImage")
        .map(|(id, _)| id.clone())
        .or(first)
}
