//! Downloads model and LoRA weight files into a ComfyUI models directory.
//!
//! Each [`ModelSpec`] lists one or more [`ModelSource`]s that are tried in
//! order. Files are streamed to a `.part` file next to the target and renamed
//! once complete, so an interrupted download never leaves a truncated model
//! behind. Existing targets are never downloaded again.

use std::path::PathBuf;

use reqwest::StatusCode;

mod download;
mod manifest;
mod source;

pub use download::*;
pub use manifest::*;
pub use source::*;

/// Errors returned while fetching models.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum FetchError {
    /// A source URL could not be built.
    #[error("Failed to parse source URL")]
    ParseError(#[from] url::ParseError),
    /// The HTTP client could not be built.
    #[error("Failed to build HTTP client")]
    Client(#[source] reqwest::Error),
    /// The request failed before or while streaming the body.
    #[error("Request to {url} failed")]
    RequestFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// The host answered with a non-success status.
    #[error("got error code: {status} from {url}")]
    BadStatus { status: StatusCode, url: String },
    /// Reading or writing a local file failed.
    #[error("Failed to write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The model lists no sources.
    #[error("No sources configured for {0}")]
    NoSources(String),
    /// Every source of a model failed.
    #[error("All {} sources failed for {name}: {}", .errors.len(), summarize(.errors))]
    AllSourcesFailed {
        name: String,
        errors: Vec<(ModelSource, FetchError)>,
    },
    /// The manifest file does not exist.
    #[error("Manifest {0} not found")]
    ManifestNotFound(PathBuf),
    /// The manifest could not be parsed.
    #[error("Failed to parse manifest")]
    Manifest(#[from] figment::Error),
}

fn summarize(errors: &[(ModelSource, FetchError)]) -> String {
    errors
        .iter()
        .map(|(source, error)| format!("{}: {}", source, error))
        .collect::<Vec<_>>()
        .join("; ")
}
