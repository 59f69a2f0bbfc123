use std::path::{Path, PathBuf};

use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{FetchError, ModelSource};

/// A model file to download, with the sources to try in order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelSpec {
    /// Name used in logs and reports.
    pub name: String,
    /// Directory relative to the models directory, e.g. `loras` or `vae`.
    pub target_dir: PathBuf,
    /// File name to save as.
    pub filename: String,
    /// Mirrors, tried in order until one succeeds.
    #[serde(default)]
    pub sources: Vec<ModelSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A list of models to download, read from TOML:
///
/// ```toml
/// [[model]]
/// name = "flux-vae"
/// target_dir = "vae"
/// filename = "ae.safetensors"
///
/// [[model.sources]]
/// kind = "huggingface"
/// repo_id = "black-forest-labs/FLUX.1-dev"
/// filename = "ae.safetensors"
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Manifest {
    #[serde(rename = "model", default)]
    pub models: Vec<ModelSpec>,
}

impl Manifest {
    /// Loads a manifest from a TOML file.
    ///
    /// # Errors
    ///
    /// Fails if the file does not exist or does not describe a manifest.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, FetchError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(FetchError::ManifestNotFound(path.to_path_buf()));
        }
        Ok(Figment::from(Toml::file(path)).extract()?)
    }

    /// Parses a manifest from a TOML string.
    pub fn from_toml(toml: &str) -> Result<Self, FetchError> {
        Ok(Figment::from(Toml::string(toml)).extract()?)
    }

    /// Looks up a model by name.
    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|model| model.name == name)
    }
}
