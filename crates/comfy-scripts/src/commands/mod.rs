use std::path::Path;

use anyhow::Context;
use clap::Subcommand;
use comfyui_api::{Comfy, DownloadSummary, JobOutcome};

use crate::config::Config;

mod audit;
mod batch;
mod compare;
mod download;
mod fetch;
mod optimize;
mod stats;
mod submit;
mod workflow;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit a workflow file
    Submit(submit::SubmitOpts),
    /// Convert an exported workflow to API format
    Convert(workflow::ConvertOpts),
    /// Remove nodes or set widget values in an exported workflow
    Strip(workflow::StripOpts),
    /// Generate images from prompts with resolution and quality presets
    Batch(batch::BatchOpts),
    /// Download the outputs of finished jobs
    Download(download::DownloadOpts),
    /// Show GPU and VRAM information of the server
    Stats(stats::StatsOpts),
    /// Run several workflows with the same seed and compare them
    Compare(compare::CompareOpts),
    /// Download models listed in a manifest
    Fetch(fetch::FetchOpts),
    /// Look for conflicting package requirements of custom nodes
    Audit(audit::AuditOpts),
    /// Rewrite a prompt idea with an LLM
    Optimize(optimize::OptimizeOpts),
}

pub async fn exec(env: &Environment, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Submit(opts) => submit::exec(env, opts).await,
        Command::Convert(opts) => workflow::convert(opts),
        Command::Strip(opts) => workflow::strip(opts),
        Command::Batch(opts) => batch::exec(env, opts).await,
        Command::Download(opts) => download::exec(env, opts).await,
        Command::Stats(opts) => stats::exec(env, opts).await,
        Command::Compare(opts) => compare::exec(env, opts).await,
        Command::Fetch(opts) => fetch::exec(env, opts).await,
        Command::Audit(opts) => audit::exec(opts),
        Command::Optimize(opts) => optimize::exec(env, opts).await,
    }
}

/// What every command gets to work with.
#[derive(Debug, Clone)]
pub struct Environment {
    config: Config,
    url: String,
}

impl Environment {
    pub fn new(config: Config, url: String) -> Self {
        Self { config, url }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// A client for the configured server with the configured poll policy.
    pub fn comfy(&self) -> anyhow::Result<Comfy> {
        Ok(Comfy::new_with_url(&self.url)
            .with_context(|| format!("Invalid server URL {}", self.url))?
            .with_settings(self.config.poll.settings()))
    }

    /// A client that has answered a liveness probe.
    pub async fn live_comfy(&self) -> anyhow::Result<Comfy> {
        let comfy = self.comfy()?;
        if !comfy.is_alive().await {
            anyhow::bail!("ComfyUI server is not reachable at {}", self.url);
        }
        Ok(comfy)
    }
}

/// One line describing how a job ended.
pub(crate) fn describe_outcome(outcome: &JobOutcome) -> String {
    let elapsed = outcome.elapsed().as_secs_f64();
    if outcome.is_success() {
        return format!("{} in {:.1}s", outcome.label(), elapsed);
    }
    match outcome.error_message() {
        Some(message) => format!("{} after {:.1}s: {}", outcome.label(), elapsed, message),
        None => format!("{} after {:.1}s", outcome.label(), elapsed),
    }
}

pub(crate) fn print_download_summary(summary: &DownloadSummary, dir: &Path) {
    for path in &summary.downloaded {
        println!("  saved {}", path.display());
    }
    println!(
        "Downloaded {} file(s) to {}, {} already present, {} failed",
        summary.downloaded.len(),
        dir.display(),
        summary.skipped.len(),
        summary.failed
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_describe_outcome() {
        let outcome = JobOutcome::TimedOut {
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(describe_outcome(&outcome), "timed out after 1.5s");
    }
}
