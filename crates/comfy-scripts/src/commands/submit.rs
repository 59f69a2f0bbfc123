use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use comfyui_api::{
    comfy::{PromptTextExt, SeedExt},
    Prompt, WorkflowFile,
};
use tracing::info;

use super::{describe_outcome, print_download_summary, Environment};

/// Submits a workflow in export, API or wrapped API format.
#[derive(Parser, Debug)]
pub struct SubmitOpts {
    /// Workflow JSON file
    file: PathBuf,

    /// Wait for the job to finish
    #[arg(long)]
    wait: bool,

    /// Seed to set on the sampler
    #[arg(long)]
    seed: Option<u64>,

    /// Positive prompt text to set
    #[arg(long)]
    prompt: Option<String>,

    /// Download the outputs to this directory once finished, implies --wait
    #[arg(long, value_name = "DIR")]
    download: Option<PathBuf>,
}

/// Loads a workflow file and applies the requested overrides.
pub(crate) fn load_prompt(opts: &SubmitOpts) -> anyhow::Result<Prompt> {
    let mut prompt = WorkflowFile::from_path(&opts.file)?.into_prompt();
    if prompt.workflow.is_empty() {
        bail!("{} contains no nodes", opts.file.display());
    }
    if let Some(seed) = opts.seed {
        prompt.set_seed(seed).context("Failed to set seed")?;
    }
    if let Some(text) = &opts.prompt {
        prompt
            .set_prompt_text(text.as_str())
            .context("Failed to set prompt text")?;
    }
    Ok(prompt)
}

pub async fn exec(env: &Environment, opts: SubmitOpts) -> anyhow::Result<()> {
    let prompt = load_prompt(&opts)?;
    let comfy = env.comfy()?;

    let prompt_id = comfy.submit(&prompt).await?;
    println!("{}", prompt_id);

    if !opts.wait && opts.download.is_none() {
        return Ok(());
    }

    info!(%prompt_id, "waiting for job");
    let outcome = comfy.wait(&prompt_id).await;
    println!("{}: {}", prompt_id, describe_outcome(&outcome));
    if !outcome.is_success() {
        bail!("Job {} {}", prompt_id, outcome.label());
    }

    if let (Some(dir), Some(task)) = (&opts.download, outcome.task()) {
        let summary = comfy.download_task(task, dir).await?;
        print_download_summary(&summary, dir);
    }
    Ok(())
}
