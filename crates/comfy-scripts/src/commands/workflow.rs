use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use clap::{ArgGroup, Parser};
use comfyui_api::WorkflowFile;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

#[derive(Parser, Debug)]
pub struct ConvertOpts {
    /// Workflow JSON file in export format
    file: PathBuf,

    /// Write the result here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(group(ArgGroup::new("edits").required(true).multiple(true).args(["remove", "widget", "widget_type"])))]
pub struct StripOpts {
    /// Workflow JSON file in export format
    file: PathBuf,

    /// Ids of the nodes to remove
    #[arg(long, num_args = 1.., value_name = "ID")]
    remove: Vec<String>,

    /// Set a widget value of one node, e.g. `23:0=1024`
    #[arg(long, value_name = "NODE:INDEX=VALUE")]
    widget: Vec<WidgetAssignment>,

    /// Set a widget value on every node of a class, e.g. `KSampler:0=42`
    #[arg(long, value_name = "CLASS:INDEX=VALUE")]
    widget_type: Vec<WidgetAssignment>,

    /// Write the result here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

/// `TARGET:INDEX=VALUE`, where VALUE is JSON or else taken as a string.
#[derive(Clone, Debug, PartialEq)]
pub struct WidgetAssignment {
    target: String,
    index: usize,
    value: Value,
}

impl FromStr for WidgetAssignment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (slot, value) = s
            .split_once('=')
            .with_context(|| format!("expected TARGET:INDEX=VALUE, got {}", s))?;
        let (target, index) = slot
            .rsplit_once(':')
            .with_context(|| format!("expected TARGET:INDEX before '=', got {}", slot))?;
        let index = index
            .parse()
            .with_context(|| format!("invalid widget index {}", index))?;
        let value =
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
        Ok(Self {
            target: target.to_owned(),
            index,
            value,
        })
    }
}

fn write_json<T: Serialize>(value: &T, output: Option<&Path>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => std::fs::write(path, json + "\n")
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            println!("{}", json);
            Ok(())
        }
    }
}

pub fn convert(opts: ConvertOpts) -> anyhow::Result<()> {
    let prompt = match WorkflowFile::from_path(&opts.file)? {
        WorkflowFile::Export(workflow) => workflow.to_prompt(),
        other => {
            warn!(file = %opts.file.display(), "workflow is already in API format");
            other.into_prompt()
        }
    };
    write_json(&prompt, opts.output.as_deref())
}

pub fn strip(opts: StripOpts) -> anyhow::Result<()> {
    let mut workflow = match WorkflowFile::from_path(&opts.file)? {
        WorkflowFile::Export(workflow) => workflow,
        _ => anyhow::bail!("{} is not in export format", opts.file.display()),
    };
    if !opts.remove.is_empty() {
        let removed = workflow.remove_nodes(&opts.remove);
        if removed < opts.remove.len() {
            warn!(
                requested = opts.remove.len(),
                removed, "some nodes were not found"
            );
        }
        eprintln!("Removed {} node(s)", removed);
    }
    for assignment in opts.widget {
        workflow.set_widget_value(&assignment.target, assignment.index, assignment.value)?;
    }
    for assignment in opts.widget_type {
        let changed =
            workflow.set_widget_by_type(&assignment.target, assignment.index, assignment.value)?;
        eprintln!("Updated {} {} node(s)", changed, assignment.target);
    }
    write_json(&workflow, opts.output.as_deref())
}
