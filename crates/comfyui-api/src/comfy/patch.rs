//! Reading and writing well known values of an API format graph.
//!
//! Templates are patched "by known field": the node carrying a value is found
//! by walking back from the output node to the nearest node of a matching
//! class, falling back to the first node of that class. Nothing is ever
//! created by a setter; patching a field no node carries is an error.

use anyhow::{anyhow, Context};
use serde_json::Value;

use crate::{
    comfy::visitor::{find_output_node, FindNode},
    models::*,
};

/// A value carried by one input of one of several node classes.
#[derive(Clone, Copy, Debug)]
pub struct Field {
    name: &'static str,
    /// `(class_type, input name)` pairs, in order of preference.
    targets: &'static [(&'static str, &'static str)],
}

/// The fields this crate knows how to patch.
pub mod fields {
    use super::Field;

    pub const TEXT: Field = Field {
        name: "text",
        targets: &[("CLIPTextEncode", "text")],
    };
    pub const SEED: Field = Field {
        name: "seed",
        targets: &[
            ("KSampler", "seed"),
            ("SamplerCustom", "noise_seed"),
            ("RandomNoise", "noise_seed"),
        ],
    };
    pub const STEPS: Field = Field {
        name: "steps",
        targets: &[("KSampler", "steps"), ("BasicScheduler", "steps")],
    };
    pub const CFG: Field = Field {
        name: "cfg",
        targets: &[("KSampler", "cfg"), ("SamplerCustom", "cfg")],
    };
    pub const WIDTH: Field = Field {
        name: "width",
        targets: &[("EmptyLatentImage", "width"), ("EmptySD3LatentImage", "width")],
    };
    pub const HEIGHT: Field = Field {
        name: "height",
        targets: &[
            ("EmptyLatentImage", "height"),
            ("EmptySD3LatentImage", "height"),
        ],
    };
    pub const MODEL: Field = Field {
        name: "model",
        targets: &[
            ("CheckpointLoaderSimple", "ckpt_name"),
            ("UNETLoader", "unet_name"),
            ("UnetLoaderGGUF", "unet_name"),
        ],
    };
    pub const FILENAME_PREFIX: Field = Field {
        name: "filename prefix",
        targets: &[("SaveImage", "filename_prefix")],
    };
    pub const LORA_STRENGTH: Field = Field {
        name: "lora strength",
        targets: &[
            ("LoraLoader", "strength_model"),
            ("LoraLoaderModelOnly", "strength_model"),
        ],
    };
}

/// Node classes that sample, in order of preference, with their conditioning inputs.
const SAMPLERS: &[&str] = &["KSampler", "SamplerCustom", "CFGGuider"];

impl Field {
    fn class_types(&self) -> Vec<&'static str> {
        self.targets.iter().map(|(class_type, _)| *class_type).collect()
    }

    fn input_for(&self, class_type: &str) -> Option<&'static str> {
        self.targets
            .iter()
            .find(|(c, _)| *c == class_type)
            .map(|(_, input)| *input)
    }

    /// Finds the node carrying this field upstream of `output_node`, or of the
    /// graph's output node when `None`.
    pub fn find_node(&self, prompt: &Prompt, output_node: Option<&str>) -> Option<String> {
        let output_node = match output_node {
            Some(node) => node.to_string(),
            None => find_output_node(prompt)?,
        };
        FindNode::new(&self.class_types()).search(prompt, &output_node)
    }

    /// Uses the output node heuristic, then falls back to the first node of
    /// a matching class.
    pub fn guess_node(&self, prompt: &Prompt) -> Option<String> {
        self.find_node(prompt, None).or_else(|| {
            self.targets.iter().find_map(|(class_type, _)| {
                prompt
                    .get_nodes_by_type(class_type)
                    .next()
                    .map(|(id, _)| id.to_string())
            })
        })
    }

    /// Gets the value of this field on the node with id `node`.
    pub fn get_node<'a>(&self, prompt: &'a Prompt, node: &str) -> anyhow::Result<&'a Value> {
        let n = prompt
            .get_node_by_id(node)
            .with_context(|| format!("node {} not found", node))?;
        let input = self
            .input_for(&n.class_type)
            .with_context(|| format!("node {} ({}) has no {}", node, n.class_type, self.name))?;
        n.inputs
            .get(input)
            .and_then(Input::value)
            .with_context(|| format!("node {} has no value for input {}", node, input))
    }

    /// Sets the value of this field on the node with id `node`.
    pub fn set_node(&self, prompt: &mut Prompt, node: &str, value: Value) -> anyhow::Result<()> {
        let n = prompt
            .get_node_by_id_mut(node)
            .with_context(|| format!("node {} not found", node))?;
        let input = self
            .input_for(&n.class_type)
            .with_context(|| format!("node {} ({}) has no {}", node, n.class_type, self.name))?;
        let slot = n
            .inputs
            .get_mut(input)
            .and_then(Input::value_mut)
            .with_context(|| format!("node {} has no value for input {}", node, input))?;
        *slot = value;
        Ok(())
    }

    /// Gets the value of this field using the node heuristic.
    pub fn get<'a>(&self, prompt: &'a Prompt) -> anyhow::Result<&'a Value> {
        let node = self
            .guess_node(prompt)
            .with_context(|| format!("no node carries {}", self.name))?;
        self.get_node(prompt, &node)
    }

    /// Sets the value of this field using the node heuristic.
    pub fn set(&self, prompt: &mut Prompt, value: Value) -> anyhow::Result<()> {
        let node = self
            .guess_node(prompt)
            .with_context(|| format!("no node carries {}", self.name))?;
        self.set_node(prompt, &node, value)
    }
}

/// Finds the text encoder feeding the sampler's `input` conditioning.
fn find_text_node(prompt: &Prompt, input: &str) -> Option<String> {
    let output_node = find_output_node(prompt)?;
    let sampler = FindNode::new(SAMPLERS).search(prompt, &output_node)?;
    let conditioning = prompt
        .get_node_by_id(&sampler)?
        .inputs
        .get(input)?
        .node_id()?
        .to_string();
    FindNode::new(&["CLIPTextEncode"]).search(prompt, &conditioning)
}

fn as_str<'a>(value: &'a Value, field: &str) -> anyhow::Result<&'a str> {
    value
        .as_str()
        .with_context(|| format!("{} is not a string: {}", field, value))
}

fn as_u64(value: &Value, field: &str) -> anyhow::Result<u64> {
    value
        .as_u64()
        .with_context(|| format!("{} is not an unsigned integer: {}", field, value))
}

fn as_f64(value: &Value, field: &str) -> anyhow::Result<f64> {
    value
        .as_f64()
        .with_context(|| format!("{} is not a number: {}", field, value))
}

/// Extension methods for the positive prompt text.
pub trait PromptTextExt {
    fn prompt_text(&self) -> anyhow::Result<&str>;
    fn set_prompt_text<S: Into<String>>(&mut self, text: S) -> anyhow::Result<()>;
}

impl Prompt {
    fn positive_text_node(&self) -> Option<String> {
        find_text_node(self, "positive")
            .or_else(|| find_text_node(self, "conditioning"))
            .or_else(|| fields::TEXT.guess_node(self))
    }
}

impl PromptTextExt for Prompt {
    fn prompt_text(&self) -> anyhow::Result<&str> {
        let node = self
            .positive_text_node()
            .context("no text encoder for the positive prompt")?;
        as_str(fields::TEXT.get_node(self, &node)?, "prompt text")
    }

    fn set_prompt_text<S: Into<String>>(&mut self, text: S) -> anyhow::Result<()> {
        let node = self
            .positive_text_node()
            .context("no text encoder for the positive prompt")?;
        fields::TEXT.set_node(self, &node, Value::String(text.into()))
    }
}

/// Extension methods for the negative prompt text.
pub trait NegativePromptExt {
    fn negative_prompt(&self) -> anyhow::Result<&str>;
    fn set_negative_prompt<S: Into<String>>(&mut self, text: S) -> anyhow::Result<()>;
}

impl NegativePromptExt for Prompt {
    fn negative_prompt(&self) -> anyhow::Result<&str> {
        let node = find_text_node(self, "negative")
            .context("no text encoder for the negative prompt")?;
        as_str(fields::TEXT.get_node(self, &node)?, "negative prompt")
    }

    fn set_negative_prompt<S: Into<String>>(&mut self, text: S) -> anyhow::Result<()> {
        let node = find_text_node(self, "negative")
            .context("no text encoder for the negative prompt")?;
        fields::TEXT.set_node(self, &node, Value::String(text.into()))
    }
}

pub trait SeedExt {
    fn seed(&self) -> anyhow::Result<u64>;
    fn set_seed(&mut self, seed: u64) -> anyhow::Result<()>;
}

impl SeedExt for Prompt {
    fn seed(&self) -> anyhow::Result<u64> {
        as_u64(fields::SEED.get(self)?, "seed")
    }

    fn set_seed(&mut self, seed: u64) -> anyhow::Result<()> {
        fields::SEED.set(self, seed.into())
    }
}

pub trait StepsExt {
    fn steps(&self) -> anyhow::Result<u32>;
    fn set_steps(&mut self, steps: u32) -> anyhow::Result<()>;
}

impl StepsExt for Prompt {
    fn steps(&self) -> anyhow::Result<u32> {
        let steps = as_u64(fields::STEPS.get(self)?, "steps")?;
        u32::try_from(steps).context("steps out of range")
    }

    fn set_steps(&mut self, steps: u32) -> anyhow::Result<()> {
        fields::STEPS.set(self, steps.into())
    }
}

pub trait CfgExt {
    fn cfg(&self) -> anyhow::Result<f64>;
    fn set_cfg(&mut self, cfg: f64) -> anyhow::Result<()>;
}

impl CfgExt for Prompt {
    fn cfg(&self) -> anyhow::Result<f64> {
        as_f64(fields::CFG.get(self)?, "cfg")
    }

    fn set_cfg(&mut self, cfg: f64) -> anyhow::Result<()> {
        fields::CFG.set(self, cfg.into())
    }
}

pub trait SizeExt {
    /// Returns `(width, height)` of the latent image.
    fn size(&self) -> anyhow::Result<(u32, u32)>;
    fn set_size(&mut self, width: u32, height: u32) -> anyhow::Result<()>;
}

impl SizeExt for Prompt {
    fn size(&self) -> anyhow::Result<(u32, u32)> {
        let width = as_u64(fields::WIDTH.get(self)?, "width")?;
        let height = as_u64(fields::HEIGHT.get(self)?, "height")?;
        Ok((
            u32::try_from(width).context("width out of range")?,
            u32::try_from(height).context("height out of range")?,
        ))
    }

    fn set_size(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        fields::WIDTH.set(self, width.into())?;
        fields::HEIGHT.set(self, height.into())
    }
}

pub trait ModelExt {
    fn model(&self) -> anyhow::Result<&str>;
    fn set_model<S: Into<String>>(&mut self, model: S) -> anyhow::Result<()>;
}

impl ModelExt for Prompt {
    fn model(&self) -> anyhow::Result<&str> {
        as_str(fields::MODEL.get(self)?, "model")
    }

    fn set_model<S: Into<String>>(&mut self, model: S) -> anyhow::Result<()> {
        fields::MODEL.set(self, Value::String(model.into()))
    }
}

pub trait FilenamePrefixExt {
    fn filename_prefix(&self) -> anyhow::Result<&str>;
    fn set_filename_prefix<S: Into<String>>(&mut self, prefix: S) -> anyhow::Result<()>;
}

impl FilenamePrefixExt for Prompt {
    fn filename_prefix(&self) -> anyhow::Result<&str> {
        as_str(fields::FILENAME_PREFIX.get(self)?, "filename prefix")
    }

    fn set_filename_prefix<S: Into<String>>(&mut self, prefix: S) -> anyhow::Result<()> {
        fields::FILENAME_PREFIX.set(self, Value::String(prefix.into()))
    }
}

/// A LoRA to apply on top of the base model.
#[derive(Clone, Debug, PartialEq)]
pub struct Lora {
    /// File name as known to the server's `loras` folder.
    pub name: String,
    pub strength_model: f64,
    pub strength_clip: f64,
}

impl Lora {
    /// A LoRA applied with the same strength to the model and the text encoder.
    pub fn new<S: Into<String>>(name: S, strength: f64) -> Self {
        Self {
            name: name.into(),
            strength_model: strength,
            strength_clip: strength,
        }
    }
}

const CLIP_LOADERS: &[&str] = &["DualCLIPLoader", "CLIPLoader", "TripleCLIPLoader"];

pub trait LoraExt {
    /// The model strength of the LoRA loader nearest to the output.
    fn lora_strength(&self) -> anyhow::Result<f64>;

    /// Sets both strengths of the LoRA loader nearest to the output.
    fn set_lora_strength(&mut self, strength: f64) -> anyhow::Result<()>;

    /// Splices a chain of `LoraLoader` nodes between the model loader and
    /// everything consuming its model and clip outputs.
    ///
    /// # Returns
    ///
    /// The ids of the inserted nodes, in chain order.
    fn insert_lora_chain(&mut self, loras: &[Lora]) -> anyhow::Result<Vec<String>>;
}

impl Prompt {
    fn consumers_of_output(&self, connection: &NodeConnection) -> Vec<(String, String)> {
        self.workflow
            .iter()
            .flat_map(|(id, node)| {
                node.inputs
                    .iter()
                    .filter(|(_, input)| input.node_connection() == Some(connection))
                    .map(move |(name, _)| (id.clone(), name.clone()))
            })
            .collect()
    }

    fn rewire(&mut self, consumers: &[(String, String)], connection: &NodeConnection) {
        for (id, input) in consumers {
            if let Some(node) = self.get_node_by_id_mut(id) {
                node.inputs
                    .insert(input.clone(), Input::NodeConnection(connection.clone()));
            }
        }
    }
}

impl LoraExt for Prompt {
    fn lora_strength(&self) -> anyhow::Result<f64> {
        as_f64(fields::LORA_STRENGTH.get(self)?, "lora strength")
    }

    fn set_lora_strength(&mut self, strength: f64) -> anyhow::Result<()> {
        let node = fields::LORA_STRENGTH
            .guess_node(self)
            .context("no node carries lora strength")?;
        fields::LORA_STRENGTH.set_node(self, &node, strength.into())?;
        let n = self
            .get_node_by_id_mut(&node)
            .with_context(|| format!("node {} not found", node))?;
        if let Some(clip) = n.inputs.get_mut("strength_clip").and_then(Input::value_mut) {
            *clip = strength.into();
        }
        Ok(())
    }

    fn insert_lora_chain(&mut self, loras: &[Lora]) -> anyhow::Result<Vec<String>> {
        if loras.is_empty() {
            return Ok(vec![]);
        }
        let loader = fields::MODEL
            .guess_node(self)
            .context("no model loader to attach LoRAs to")?;
        let mut model = NodeConnection {
            node_id: loader.clone(),
            output_index: 0,
        };
        let loader_class = self
            .get_node_by_id(&loader)
            .map(|node| node.class_type.clone())
            .unwrap_or_default();
        let mut clip = if loader_class == "CheckpointLoaderSimple" {
            NodeConnection {
                node_id: loader,
                output_index: 1,
            }
        } else {
            let clip_loader = CLIP_LOADERS
                .iter()
                .find_map(|class_type| self.get_nodes_by_type(class_type).next())
                .map(|(id, _)| id.to_string())
                .ok_or_else(|| anyhow!("no text encoder loader to attach LoRAs to"))?;
            NodeConnection {
                node_id: clip_loader,
                output_index: 0,
            }
        };

        let model_consumers = self.consumers_of_output(&model);
        let clip_consumers = self.consumers_of_output(&clip);

        let mut ids = Vec::with_capacity(loras.len());
        for lora in loras {
            let id = self.next_node_id();
            let node = Node::new("LoraLoader")
                .with_connection("model", model.node_id.clone(), model.output_index)
                .with_connection("clip", clip.node_id.clone(), clip.output_index)
                .with_value("lora_name", lora.name.clone())
                .with_value("strength_model", lora.strength_model)
                .with_value("strength_clip", lora.strength_clip);
            self.workflow.insert(id.clone(), node);
            model = NodeConnection {
                node_id: id.clone(),
                output_index: 0,
            };
            clip = NodeConnection {
                node_id: id.clone(),
                output_index: 1,
            };
            ids.push(id);
        }

        self.rewire(&model_consumers, &model);
        self.rewire(&clip_consumers, &clip);
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn txt2img() -> Prompt {
        serde_json::from_value(json!({
            "1": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "flux1-dev-fp8.safetensors" } },
            "2": { "class_type": "CLIPTextEncode", "inputs": { "text": "a lighthouse", "clip": ["1", 1] } },
            "3": { "class_type": "CLIPTextEncode", "inputs": { "text": "blurry", "clip": ["1", 1] } },
            "4": { "class_type": "KSampler", "inputs": {
                "seed": 1, "steps": 20, "cfg": 3.0, "sampler_name": "euler", "scheduler": "simple", "denoise": 1.0,
                "model": ["1", 0], "positive": ["2", 0], "negative": ["3", 0], "latent_image": ["5", 0]
            } },
            "5": { "class_type": "EmptyLatentImage", "inputs": { "width": 1024, "height": 1024, "batch_size": 1 } },
            "6": { "class_type": "VAEDecode", "inputs": { "samples": ["4", 0], "vae": ["1", 2] } },
            "7": { "class_type": "SaveImage", "inputs": { "filename_prefix": "test", "images": ["6", 0] } }
        }))
        .unwrap()
    }

    #[test]
    fn test_get_fields() {
        let prompt = txt2img();
        assert_eq!(prompt.prompt_text().unwrap(), "a lighthouse");
        assert_eq!(prompt.negative_prompt().unwrap(), "blurry");
        assert_eq!(prompt.seed().unwrap(), 1);
        assert_eq!(prompt.steps().unwrap(), 20);
        assert_eq!(prompt.cfg().unwrap(), 3.0);
        assert_eq!(prompt.size().unwrap(), (1024, 1024));
        assert_eq!(prompt.model().unwrap(), "flux1-dev-fp8.safetensors");
        assert_eq!(prompt.filename_prefix().unwrap(), "test");
    }

    #[test]
    fn test_set_fields() {
        let mut prompt = txt2img();
        prompt.set_prompt_text("a castle").unwrap();
        prompt.set_negative_prompt("low quality").unwrap();
        prompt.set_seed(123456789).unwrap();
        prompt.set_steps(30).unwrap();
        prompt.set_cfg(3.5).unwrap();
        prompt.set_size(1080, 1920).unwrap();
        prompt.set_filename_prefix("batch_1").unwrap();

        assert_eq!(prompt.workflow["2"].inputs["text"].value(), Some(&json!("a castle")));
        assert_eq!(prompt.workflow["3"].inputs["text"].value(), Some(&json!("low quality")));
        assert_eq!(prompt.workflow["4"].inputs["seed"].value(), Some(&json!(123456789)));
        assert_eq!(prompt.size().unwrap(), (1080, 1920));
        assert_eq!(prompt.cfg().unwrap(), 3.5);
        assert_eq!(prompt.filename_prefix().unwrap(), "batch_1");
    }

    #[test]
    fn test_seed_on_random_noise() {
        let mut prompt: Prompt = serde_json::from_value(json!({
            "25": { "class_type": "RandomNoise", "inputs": { "noise_seed": 7 } },
            "13": { "class_type": "SamplerCustomAdvanced", "inputs": { "noise": ["25", 0] } },
            "9": { "class_type": "SaveImage", "inputs": { "images": ["13", 0] } }
        }))
        .unwrap();
        assert_eq!(prompt.seed().unwrap(), 7);
        prompt.set_seed(8).unwrap();
        assert_eq!(prompt.workflow["25"].inputs["noise_seed"].value(), Some(&json!(8)));
    }

    #[test]
    fn test_missing_field_is_error() {
        let mut prompt = txt2img();
        prompt.workflow.remove("5");
        assert!(prompt.set_size(512, 512).is_err());
        assert!(prompt.lora_strength().is_err());
        assert!(!prompt.workflow.values().any(|n| n.class_type == "EmptyLatentImage"));
    }

    #[test]
    fn test_prompt_text_falls_back_to_first_encoder() {
        let mut prompt: Prompt = serde_json::from_value(json!({
            "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "first" } },
            "8": { "class_type": "CLIPTextEncode", "inputs": { "text": "second" } }
        }))
        .unwrap();
        assert_eq!(prompt.prompt_text().unwrap(), "first");
        prompt.set_prompt_text("changed").unwrap();
        assert_eq!(prompt.workflow["6"].inputs["text"].value(), Some(&json!("changed")));
        assert!(prompt.negative_prompt().is_err());
    }

    #[test]
    fn test_insert_lora_chain() {
        let mut prompt = txt2img();
        let ids = prompt
            .insert_lora_chain(&[
                Lora::new("ultrafluxV1.aWjp.safetensors", 0.9),
                Lora::new("facebookQuality.3t4R.safetensors", 0.7),
            ])
            .unwrap();
        assert_eq!(ids, vec!["8".to_string(), "9".to_string()]);

        let first = &prompt.workflow["8"];
        assert_eq!(first.inputs["model"].node_connection().unwrap().node_id, "1");
        assert_eq!(first.inputs["clip"].node_connection().unwrap().output_index, 1);
        let second = &prompt.workflow["9"];
        assert_eq!(second.inputs["model"].node_connection().unwrap().node_id, "8");
        assert_eq!(second.inputs["strength_clip"].value(), Some(&json!(0.7)));

        // the sampler and text encoders now read from the end of the chain
        let sampler_model = prompt.workflow["4"].inputs["model"].node_connection().unwrap();
        assert_eq!((sampler_model.node_id.as_str(), sampler_model.output_index), ("9", 0));
        let clip = prompt.workflow["2"].inputs["clip"].node_connection().unwrap();
        assert_eq!((clip.node_id.as_str(), clip.output_index), ("9", 1));
        // the VAE output of the loader is untouched
        assert_eq!(prompt.workflow["6"].inputs["vae"].node_id(), Some("1"));

        assert_eq!(prompt.lora_strength().unwrap(), 0.7);
        prompt.set_lora_strength(0.5).unwrap();
        assert_eq!(prompt.workflow["9"].inputs["strength_clip"].value(), Some(&json!(0.5)));
    }

    #[test]
    fn test_empty_lora_chain_is_noop() {
        let mut prompt = txt2img();
        let before = prompt.clone();
        assert!(prompt.insert_lora_chain(&[]).unwrap().is_empty());
        assert_eq!(prompt, before);
    }
}
