use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{ArgGroup, Parser, ValueEnum};
use comfyui_api::{
    comfy::{Lora, LoraExt},
    Node, Prompt,
};
use itertools::Itertools;
use rand::Rng;
use tracing::{error, warn};

use super::{describe_outcome, print_download_summary, Environment};

const CHECKPOINT: &str = "flux1-dev-fp8.safetensors";

const POSITIVE_SUFFIX: &str = "ultra realistic, high resolution, 8k uhd, professional photography, \
    detailed, sharp focus, perfect composition, masterpiece, best quality";

const NEGATIVE_SUFFIX: &str = "low quality, blurry, pixelated, compressed, jpeg artifacts, \
    watermark, text, logo, oversaturated, cartoon, anime, painting, illustration, unrealistic, \
    distorted, deformed, amateur, grainy";

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// 1024x1536, 2:3
    Portrait,
    /// 1080x1920, 9:16
    #[value(alias = "portrait_hd")]
    PortraitHd,
    /// 1024x1024
    Square,
    /// 1536x1024, 3:2
    Landscape,
    /// 1920x1080, 16:9
    #[value(alias = "landscape_hd")]
    LandscapeHd,
    /// 1080x1920, for stories
    Story,
}

impl Resolution {
    pub fn size(self) -> (u32, u32) {
        match self {
            Resolution::Portrait => (1024, 1536),
            Resolution::PortraitHd => (1080, 1920),
            Resolution::Square => (1024, 1024),
            Resolution::Landscape => (1536, 1024),
            Resolution::LandscapeHd => (1920, 1080),
            Resolution::Story => (1080, 1920),
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quality {
    /// 30 steps, two LoRAs
    Ultra,
    /// 25 steps, two LoRAs
    High,
    /// 20 steps, one LoRA
    Balanced,
    /// 15 steps with the turbo LoRA
    Fast,
}

/// Sampler settings and LoRAs of a quality level.
#[derive(Clone, Debug, PartialEq)]
pub struct QualityPreset {
    pub steps: u32,
    pub cfg: f64,
    pub loras: Vec<Lora>,
    pub description: &'static str,
}

impl Quality {
    pub fn preset(self) -> QualityPreset {
        const ULTRAFLUX: &str = "ultrafluxV1.aWjp.safetensors";
        const FACEBOOK_QUALITY: &str = "facebookQuality.3t4R.safetensors";
        match self {
            Quality::Ultra => QualityPreset {
                steps: 30,
                cfg: 3.5,
                loras: vec![Lora::new(ULTRAFLUX, 0.9), Lora::new(FACEBOOK_QUALITY, 0.7)],
                description: "Maximum quality for professional use",
            },
            Quality::High => QualityPreset {
                steps: 25,
                cfg: 3.5,
                loras: vec![Lora::new(ULTRAFLUX, 0.85), Lora::new(FACEBOOK_QUALITY, 0.65)],
                description: "High quality, balanced speed",
            },
            Quality::Balanced => QualityPreset {
                steps: 20,
                cfg: 3.0,
                loras: vec![Lora::new(ULTRAFLUX, 0.75)],
                description: "Good quality, faster generation",
            },
            Quality::Fast => QualityPreset {
                steps: 15,
                cfg: 2.5,
                loras: vec![Lora::new("FLUX.1-Turbo-Alpha.safetensors", 1.0)],
                description: "Quick generation for previews",
            },
        }
    }
}

/// Generates images from one prompt or a file of prompts.
#[derive(Parser, Debug)]
#[command(group(ArgGroup::new("source").required(true).args(["prompt", "file"])))]
pub struct BatchOpts {
    /// Single prompt to generate
    #[arg(short, long)]
    prompt: Option<String>,

    /// File with one prompt per line, `#` starts a comment
    #[arg(short, long)]
    file: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Resolution::Portrait)]
    resolution: Resolution,

    #[arg(short, long, value_enum, default_value_t = Quality::High)]
    quality: Quality,

    /// Number of variations per prompt, each with a random seed
    #[arg(short, long, default_value_t = 1)]
    variations: u32,

    /// Additional negative prompt
    #[arg(short, long, default_value = "")]
    negative: String,

    /// Submit everything and exit without waiting
    #[arg(long)]
    no_wait: bool,

    /// Download finished images to this directory
    #[arg(long, value_name = "DIR", conflicts_with = "no_wait")]
    download: Option<PathBuf>,
}

/// Reads prompts from a file, skipping blank lines and comments.
pub(crate) fn load_prompts(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read prompts from {}", path.display()))?;
    let prompts: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect();
    if prompts.is_empty() {
        bail!("No prompts found in {}", path.display());
    }
    Ok(prompts)
}

fn join_nonempty(parts: &[&str]) -> String {
    parts.iter().filter(|part| !part.is_empty()).join(", ")
}

/// Builds the txt2img graph for one image.
pub(crate) fn txt2img(
    text: &str,
    negative: &str,
    (width, height): (u32, u32),
    preset: &QualityPreset,
    seed: u64,
    filename_prefix: &str,
) -> anyhow::Result<Prompt> {
    let mut prompt = Prompt::default();
    let nodes = [
        ("1", Node::new("CheckpointLoaderSimple").with_value("ckpt_name", CHECKPOINT)),
        (
            "2",
            Node::new("CLIPTextEncode")
                .with_value("text", join_nonempty(&[text, POSITIVE_SUFFIX]))
                .with_connection("clip", "1", 1),
        ),
        (
            "3",
            Node::new("CLIPTextEncode")
                .with_value("text", join_nonempty(&[negative, NEGATIVE_SUFFIX]))
                .with_connection("clip", "1", 1),
        ),
        (
            "4",
            Node::new("KSampler")
                .with_value("seed", seed)
                .with_value("steps", preset.steps)
                .with_value("cfg", preset.cfg)
                .with_value("sampler_name", "euler")
                .with_value("scheduler", "simple")
                .with_value("denoise", 1.0)
                .with_connection("model", "1", 0)
                .with_connection("positive", "2", 0)
                .with_connection("negative", "3", 0)
                .with_connection("latent_image", "5", 0),
        ),
        (
            "5",
            Node::new("EmptyLatentImage")
                .with_value("width", width)
                .with_value("height", height)
                .with_value("batch_size", 1),
        ),
        (
            "6",
            Node::new("VAEDecode")
                .with_connection("samples", "4", 0)
                .with_connection("vae", "1", 2),
        ),
        (
            "7",
            Node::new("SaveImage")
                .with_value("filename_prefix", filename_prefix)
                .with_connection("images", "6", 0),
        ),
    ];
    for (id, node) in nodes {
        prompt.workflow.insert(id.to_owned(), node);
    }
    prompt.insert_lora_chain(&preset.loras)?;
    Ok(prompt)
}

fn lora_label(lora: &Lora) -> &str {
    lora.name.split('.').next().unwrap_or(&lora.name)
}

pub async fn exec(env: &Environment, opts: BatchOpts) -> anyhow::Result<()> {
    let prompts = match (&opts.prompt, &opts.file) {
        (_, Some(file)) => load_prompts(file)?,
        (Some(prompt), None) => vec![prompt.clone()],
        (None, None) => bail!("Either --prompt or --file is required"),
    };
    let comfy = env.live_comfy().await?;

    let size = opts.resolution.size();
    let preset = opts.quality.preset();
    let total = prompts.len() * opts.variations as usize;
    let prefix = format!("batch_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"));

    println!("Resolution: {:?} ({}x{})", opts.resolution, size.0, size.1);
    println!("Quality: {:?} - {}", opts.quality, preset.description);
    println!("Steps: {} | CFG: {}", preset.steps, preset.cfg);
    println!("LoRAs: {}", preset.loras.iter().map(lora_label).join(", "));
    println!(
        "Prompts: {} | Variations: {} | Total images: {}",
        prompts.len(),
        opts.variations,
        total
    );

    let mut submitted = 0;
    let mut current = 0;
    for (index, text) in prompts.iter().enumerate() {
        println!("[{}/{}] {}", index + 1, prompts.len(), text);
        for variation in 0..opts.variations {
            current += 1;
            let seed = rand::thread_rng().gen_range(0..=u64::from(u32::MAX));
            let prompt = txt2img(text, &opts.negative, size, &preset, seed, &prefix)?;

            let prompt_id = match comfy.submit(&prompt).await {
                Ok(prompt_id) => prompt_id,
                Err(e) => {
                    error!(error = %e, "failed to submit");
                    println!("  [{}/{}] failed to submit: {}", current, total, e);
                    continue;
                }
            };
            submitted += 1;

            if opts.no_wait {
                println!("  [{}/{}] submitted {}", current, total, prompt_id);
                continue;
            }
            let outcome = comfy.wait(&prompt_id).await;
            println!(
                "  [{}/{}] variation {} (seed {}): {}",
                current,
                total,
                variation + 1,
                seed,
                describe_outcome(&outcome)
            );
            if !outcome.is_success() {
                warn!(%prompt_id, "moving on to the next image");
            }
            if let (Some(dir), Some(task)) = (&opts.download, outcome.task()) {
                let summary = comfy.download_task(task, dir).await?;
                print_download_summary(&summary, dir);
            }
        }
    }

    println!("Batch complete: {}/{} images submitted", submitted, total);
    if submitted == 0 && total > 0 {
        bail!("No images could be submitted");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use comfyui_api::comfy::{CfgExt, PromptTextExt, SeedExt, SizeExt, StepsExt};

    use super::*;

    #[test]
    fn test_load_prompts_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompts.txt");
        std::fs::write(&path, "# beaches\nsunset over ocean\n\n  \nfoggy pier\n").unwrap();
        assert_eq!(
            load_prompts(&path).unwrap(),
            vec!["sunset over ocean", "foggy pier"]
        );

        std::fs::write(&path, "# only comments\n").unwrap();
        assert!(load_prompts(&path).is_err());
    }

    #[test]
    fn test_txt2img_uses_presets() {
        let preset = Quality::Ultra.preset();
        let prompt = txt2img(
            "a lighthouse",
            "",
            Resolution::Story.size(),
            &preset,
            1234,
            "batch_test",
        )
        .unwrap();

        assert_eq!(prompt.seed().unwrap(), 1234);
        assert_eq!(prompt.steps().unwrap(), 30);
        assert_eq!(prompt.cfg().unwrap(), 3.5);
        assert_eq!(prompt.size().unwrap(), (1080, 1920));
        assert!(prompt.prompt_text().unwrap().starts_with("a lighthouse, ultra realistic"));
        assert!(prompt.get_node_by_id("3").unwrap().inputs["text"]
            .value()
            .and_then(|v| v.as_str())
            .unwrap()
            .starts_with("low quality"));

        let loras: Vec<_> = prompt.get_nodes_by_type("LoraLoader").collect();
        assert_eq!(loras.len(), 2);
        let sampler = prompt.get_node_by_id("4").unwrap();
        let model = sampler.inputs["model"].node_id().unwrap();
        assert_eq!(
            prompt.get_node_by_id(model).unwrap().inputs["lora_name"]
                .value()
                .and_then(|v| v.as_str()),
            Some("facebookQuality.3t4R.safetensors")
        );
    }

    #[test]
    fn test_fast_preset_has_turbo_lora() {
        let preset = Quality::Fast.preset();
        assert_eq!(preset.steps, 15);
        assert_eq!(lora_label(&preset.loras[0]), "FLUX");
    }
}
