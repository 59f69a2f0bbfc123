use anyhow::Context;
use clap::Parser;
use comfyui_api::SystemStats;

use super::Environment;

/// Prints the server's GPU and VRAM usage.
#[derive(Parser, Debug)]
pub struct StatsOpts {}

fn render(stats: &SystemStats) -> String {
    let mut lines = vec![format!(
        "ComfyUI {} on {}, Python {}",
        stats.system.comfyui_version.as_deref().unwrap_or("unknown"),
        stats.system.os,
        stats.system.python_version.split_whitespace().next().unwrap_or("unknown"),
    )];
    if stats.devices.is_empty() {
        lines.push("No GPU devices reported".to_string());
    }
    for device in &stats.devices {
        lines.push(format!(
            "{}: {:.1} GiB free of {:.1} GiB",
            device.name,
            device.vram_free_gib(),
            device.vram_total_gib()
        ));
    }
    lines.join("\n")
}

pub async fn exec(env: &Environment, _: StatsOpts) -> anyhow::Result<()> {
    let stats = env
        .comfy()?
        .system_stats()
        .await
        .with_context(|| format!("ComfyUI server is not reachable at {}", env.url()))?;
    println!("{}", render(&stats));
    Ok(())
}
