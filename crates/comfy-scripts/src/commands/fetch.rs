use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use model_fetch::{Downloader, FetchOutcome, Manifest, ModelSpec};
use tracing::error;

use super::Environment;

/// Downloads the models listed in a manifest into the models directory.
#[derive(Parser, Debug)]
pub struct FetchOpts {
    /// TOML manifest with `[[model]]` entries
    manifest: PathBuf,

    /// Only fetch the models with these names
    #[arg(long, value_name = "NAME")]
    only: Vec<String>,

    /// Models directory, defaults to the configured models_dir
    #[arg(long, value_name = "DIR")]
    models_dir: Option<PathBuf>,

    /// Do not draw progress bars
    #[arg(long)]
    no_progress: bool,
}

fn select<'a>(manifest: &'a Manifest, only: &[String]) -> anyhow::Result<Vec<&'a ModelSpec>> {
    if only.is_empty() {
        return Ok(manifest.models.iter().collect());
    }
    only.iter()
        .map(|name| {
            manifest
                .get(name)
                .with_context(|| format!("No model named {} in manifest", name))
        })
        .collect()
}

pub async fn exec(env: &Environment, opts: FetchOpts) -> anyhow::Result<()> {
    let manifest = Manifest::from_path(&opts.manifest)?;
    let specs = select(&manifest, &opts.only)?;
    let models_dir = opts
        .models_dir
        .unwrap_or_else(|| env.config().models_dir.clone());

    let downloader = Downloader::new(models_dir)?
        .with_credentials(env.config().credentials())
        .with_progress(!opts.no_progress);

    let results = downloader.fetch_all(specs).await;
    let mut failed = 0;
    for (name, result) in &results {
        match result {
            Ok(FetchOutcome::Downloaded { path, bytes, source }) => {
                println!("{}: downloaded {} bytes from {} to {}", name, bytes, source, path.display())
            }
            Ok(FetchOutcome::Skipped { path }) => {
                println!("{}: already present at {}", name, path.display())
            }
            Err(e) => {
                error!(model = %name, error = %e, "download failed");
                println!("{}: failed: {}", name, e);
                failed += 1;
            }
        }
    }
    println!("{}/{} models available", results.len() - failed, results.len());
    if failed > 0 {
        bail!("{} of {} models failed to download", failed, results.len());
    }
    Ok(())
}
