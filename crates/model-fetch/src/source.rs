use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Base URLs of the model hosts.
#[derive(Clone, Debug, PartialEq)]
pub struct Endpoints {
    pub huggingface: Url,
    pub civitai: Url,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            huggingface: Url::parse("https://huggingface.co/").expect("Failed to parse default URL"),
            civitai: Url::parse("https://civitai.com/").expect("Failed to parse default URL"),
        }
    }
}

/// Access tokens sent to the model hosts.
#[derive(Clone, Default, PartialEq)]
pub struct Credentials {
    pub hf_token: Option<String>,
    pub civitai_api_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("hf_token", &self.hf_token.as_ref().map(|_| "<redacted>"))
            .field(
                "civitai_api_key",
                &self.civitai_api_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

fn default_revision() -> String {
    "main".to_string()
}

/// One place a model file can be downloaded from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSource {
    /// A file in a Hugging Face repository.
    #[serde(rename = "huggingface")]
    HuggingFace {
        repo_id: String,
        filename: String,
        #[serde(default = "default_revision")]
        revision: String,
    },
    /// A model version on CivitAI.
    Civitai { version_id: u64 },
    /// Any other URL, fetched without credentials.
    Url { url: String },
}

impl ModelSource {
    /// The download URL of this source.
    pub fn url(&self, endpoints: &Endpoints) -> Result<Url, url::ParseError> {
        match self {
            ModelSource::HuggingFace {
                repo_id,
                filename,
                revision,
            } => endpoints
                .huggingface
                .join(&format!("{}/resolve/{}/{}", repo_id, revision, filename)),
            ModelSource::Civitai { version_id } => endpoints
                .civitai
                .join(&format!("api/download/models/{}", version_id)),
            ModelSource::Url { url } => Url::parse(url),
        }
    }

    /// The bearer token to send to this source, if one is configured.
    pub fn token<'a>(&self, credentials: &'a Credentials) -> Option<&'a str> {
        match self {
            ModelSource::HuggingFace { .. } => credentials.hf_token.as_deref(),
            ModelSource::Civitai { .. } => credentials.civitai_api_key.as_deref(),
            ModelSource::Url { .. } => None,
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::HuggingFace {
                repo_id, filename, ..
            } => write!(f, "huggingface:{}/{}", repo_id, filename),
            ModelSource::Civitai { version_id } => write!(f, "civitai:{}", version_id),
            ModelSource::Url { url } => f.write_str(url),
        }
    }
}
