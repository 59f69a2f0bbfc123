use std::path::PathBuf;

use clap::Parser;
use uuid::Uuid;

use super::{print_download_summary, Environment};

/// Downloads the images of finished jobs, skipping files already on disk.
#[derive(Parser, Debug)]
pub struct DownloadOpts {
    /// Job ids as printed by `submit` or `batch`
    #[arg(required = true, num_args = 1..)]
    ids: Vec<Uuid>,

    /// Output directory, defaults to the configured output_dir
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,
}

pub async fn exec(env: &Environment, opts: DownloadOpts) -> anyhow::Result<()> {
    let dir = opts
        .output
        .unwrap_or_else(|| env.config().output_dir.clone());
    let comfy = env.comfy()?;
    let summary = comfy.download_all(&opts.ids, &dir).await?;
    print_download_summary(&summary, &dir);
    Ok(())
}
